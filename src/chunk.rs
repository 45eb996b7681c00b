use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const MEGABYTE: usize = 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 10 * MEGABYTE;

/// Size of each individual read from the source.
pub const READ_INCREMENT: usize = 4096;

/// Lazy, finite, non-restartable sequence of chunks over `R`.
///
/// Every chunk but the last is exactly `chunk_size` bytes. Once the source
/// is drained the reader yields an empty chunk, which callers treat as the
/// end of the sequence. The reader borrows or owns the source but never
/// closes it.
pub struct ChunkReader<R> {
    source: R,
    chunk_size: usize,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_chunk_size(source, DEFAULT_CHUNK_SIZE)
    }

    /// A `chunk_size` of zero is raised to one byte.
    pub fn with_chunk_size(source: R, chunk_size: usize) -> Self {
        Self {
            source,
            chunk_size: chunk_size.max(1),
            exhausted: false,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Read the next chunk. An empty chunk means the source is exhausted.
    pub async fn next_chunk(&mut self) -> io::Result<Vec<u8>> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let mut chunk = Vec::with_capacity(self.chunk_size.min(MEGABYTE));
        let mut buffer = [0u8; READ_INCREMENT];

        while chunk.len() < self.chunk_size {
            let wanted = READ_INCREMENT.min(self.chunk_size - chunk.len());
            let read = self.source.read(&mut buffer[..wanted]).await?;
            if read == 0 {
                self.exhausted = true;
                break;
            }
            chunk.extend_from_slice(&buffer[..read]);
        }

        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use rstest::rstest;
    use tokio::io::ReadBuf;

    use super::*;

    async fn drain(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
        let mut reader = ChunkReader::with_chunk_size(data, chunk_size);
        let mut chunks = Vec::new();
        loop {
            let chunk = reader.next_chunk().await.unwrap();
            if chunk.is_empty() {
                return chunks;
            }
            chunks.push(chunk);
        }
    }

    #[rstest]
    #[case::exact_multiple(3 * 8192, 8192, vec![8192, 8192, 8192])]
    #[case::trailing_remainder(20_000, 8192, vec![8192, 8192, 3616])]
    #[case::shorter_than_chunk(100, 8192, vec![100])]
    #[case::chunk_not_multiple_of_read(10_000, 5000, vec![5000, 5000])]
    #[case::tiny_chunks(5, 2, vec![2, 2, 1])]
    #[case::empty(0, 8192, vec![])]
    #[tokio::test]
    async fn test_chunk_sizes(
        #[case] len: usize,
        #[case] chunk_size: usize,
        #[case] expected: Vec<usize>,
    ) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let chunks = drain(&data, chunk_size).await;

        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, expected);
        assert_eq!(chunks.concat(), data);
    }

    #[tokio::test]
    async fn test_exhausted_reader_keeps_yielding_empty_chunks() {
        let data = [7u8; 10];
        let mut reader = ChunkReader::with_chunk_size(&data[..], 10);

        assert_eq!(reader.next_chunk().await.unwrap().len(), 10);
        assert!(reader.next_chunk().await.unwrap().is_empty());
        assert!(reader.next_chunk().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_chunk_size_is_raised_to_one() {
        let reader = ChunkReader::with_chunk_size(&b"ab"[..], 0);
        assert_eq!(reader.chunk_size(), 1);
        assert_eq!(drain(b"ab", 0).await, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn test_default_chunk_size_is_ten_mebibytes() {
        let reader = ChunkReader::new(&b""[..]);
        assert_eq!(reader.chunk_size(), 10 * 1024 * 1024);
    }

    struct FailingSource {
        remaining: usize,
    }

    impl AsyncRead for FailingSource {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(io::Error::other("disk went away")));
            }
            let n = self.remaining.min(buf.remaining());
            buf.put_slice(&vec![1u8; n]);
            self.remaining -= n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let mut reader = ChunkReader::with_chunk_size(FailingSource { remaining: 100 }, 50);
        assert_eq!(reader.next_chunk().await.unwrap().len(), 50);
        assert_eq!(reader.next_chunk().await.unwrap().len(), 50);

        let err = reader.next_chunk().await.unwrap_err();
        assert_eq!(err.to_string(), "disk went away");
    }
}
