//! Multipart upload coordinator.
//!
//! Drives one upload end to end: ensure the bucket, initiate, upload each
//! chunk as a numbered part, then complete. Any failure after initiation
//! aborts the session on the store before the failure is returned.

use std::future::Future;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    chunk::{ChunkReader, DEFAULT_CHUNK_SIZE},
    error::UploadError,
    store::{BucketStatus, ObjectStore, PartDescriptor},
};

/// Most parts a single multipart upload may have.
pub const MAX_PARTS_COUNT: u32 = 10_000;

/// Where an upload goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
}

impl UploadTarget {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// The content type to send, if one is set and not blank.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type
            .as_deref()
            .map(str::trim)
            .filter(|content_type| !content_type.is_empty())
    }

    fn validate(&self) -> Result<(), UploadError> {
        if self.bucket.trim().is_empty() {
            return Err(UploadError::InvalidTarget("bucket name is empty".into()));
        }
        if self.key.is_empty() {
            return Err(UploadError::InvalidTarget("object key is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Initiated,
    UploadingParts,
    Completed,
    Aborted,
}

impl SessionState {
    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Initiated, UploadingParts)
                | (Initiated, Completed)
                | (Initiated, Aborted)
                | (UploadingParts, UploadingParts)
                | (UploadingParts, Completed)
                | (UploadingParts, Aborted)
        )
    }
}

/// Part descriptors in the order they arrived.
///
/// Nothing about arrival order is promised; [`CompletedParts::into_sorted`]
/// is the single place the completion order is established.
#[derive(Debug, Default, Clone)]
struct CompletedParts {
    parts: Vec<PartDescriptor>,
}

impl CompletedParts {
    fn push(&mut self, part: PartDescriptor) {
        self.parts.push(part);
    }

    fn len(&self) -> usize {
        self.parts.len()
    }

    /// Parts sorted by ascending part number, as completion requires.
    fn into_sorted(mut self) -> Vec<PartDescriptor> {
        self.parts.sort_by_key(|part| part.part_number);
        self.parts
    }
}

/// State of one multipart upload, owned by a single `upload` call.
#[derive(Debug)]
struct UploadSession<'a> {
    target: &'a UploadTarget,
    upload_id: String,
    parts: CompletedParts,
    bytes_uploaded: u64,
    state: SessionState,
}

impl<'a> UploadSession<'a> {
    fn initiated(target: &'a UploadTarget, upload_id: String) -> Self {
        Self {
            target,
            upload_id,
            parts: CompletedParts::default(),
            bytes_uploaded: 0,
            state: SessionState::Initiated,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal upload session transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(upload_id = %self.upload_id, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

/// Reported after each part is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub part_number: u32,
    pub part_bytes: u64,
    pub bytes_uploaded: u64,
}

/// What a finished upload produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub bucket: String,
    pub key: String,
    /// `None` when the source was empty and no multipart session was opened.
    pub upload_id: Option<String>,
    pub parts: Vec<PartDescriptor>,
    pub bytes_uploaded: u64,
    pub e_tag: Option<String>,
}

pub struct MultipartUploader<S> {
    store: S,
    chunk_size: usize,
}

async fn guarded<T, E>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, E>>,
) -> Result<T, UploadError>
where
    UploadError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        result = call => result.map_err(UploadError::from),
    }
}

impl<S: ObjectStore> MultipartUploader<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// A `chunk_size` of zero is raised to one byte.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Create `bucket` unless it already exists. Safe to call repeatedly.
    pub async fn ensure_bucket(&self, bucket: &str) -> Result<BucketStatus, UploadError> {
        self.ensure_bucket_guarded(bucket, &CancellationToken::new())
            .await
    }

    async fn ensure_bucket_guarded(
        &self,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> Result<BucketStatus, UploadError> {
        let status = guarded(cancel, self.store.create_bucket(bucket)).await?;
        match status {
            BucketStatus::Created => info!(bucket, "created bucket"),
            BucketStatus::AlreadyExists => debug!(bucket, "bucket already exists"),
        }
        Ok(status)
    }

    pub async fn upload<R>(
        &self,
        target: &UploadTarget,
        source: R,
        cancel: Option<&CancellationToken>,
    ) -> Result<CompletedUpload, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.upload_with_progress(target, source, cancel, |_| {})
            .await
    }

    /// Upload `source` to `target`, calling `on_progress` after every part.
    #[instrument(skip_all, fields(bucket = %target.bucket, key = %target.key))]
    pub async fn upload_with_progress<R, F>(
        &self,
        target: &UploadTarget,
        source: R,
        cancel: Option<&CancellationToken>,
        mut on_progress: F,
    ) -> Result<CompletedUpload, UploadError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(UploadProgress) + Send,
    {
        target.validate()?;
        let cancel = cancel.cloned().unwrap_or_else(CancellationToken::new);

        self.ensure_bucket_guarded(&target.bucket, &cancel).await?;

        let mut reader = ChunkReader::with_chunk_size(source, self.chunk_size);
        let first = reader.next_chunk().await.map_err(UploadError::SourceRead)?;
        if first.is_empty() {
            return self.put_empty(target, &cancel).await;
        }

        let upload_id = guarded(
            &cancel,
            self.store.initiate_multipart_upload(
                &target.bucket,
                &target.key,
                target.content_type(),
            ),
        )
        .await?;
        info!(%upload_id, "initiated multipart upload");

        let mut session = UploadSession::initiated(target, upload_id);

        let result = self
            .upload_parts(&mut session, first, &mut reader, &cancel, &mut on_progress)
            .await;
        let result = match result {
            Ok(()) => self.complete(&mut session, &cancel).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(upload) => Ok(upload),
            Err(err) => Err(self.abort(&mut session, err).await),
        }
    }

    async fn upload_parts<R, F>(
        &self,
        session: &mut UploadSession<'_>,
        first: Vec<u8>,
        reader: &mut ChunkReader<R>,
        cancel: &CancellationToken,
        on_progress: &mut F,
    ) -> Result<(), UploadError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(UploadProgress) + Send,
    {
        let mut chunk = first;
        let mut part_number: u32 = 1;

        while !chunk.is_empty() {
            if part_number > MAX_PARTS_COUNT {
                return Err(UploadError::TooManyParts {
                    limit: MAX_PARTS_COUNT,
                });
            }

            session.transition(SessionState::UploadingParts);
            let part_bytes = chunk.len() as u64;
            let target = session.target;
            let e_tag = guarded(
                cancel,
                self.store.upload_part(
                    &target.bucket,
                    &target.key,
                    &session.upload_id,
                    part_number,
                    chunk,
                ),
            )
            .await?;
            debug!(part_number, part_bytes, %e_tag, "uploaded part");

            session.parts.push(PartDescriptor {
                part_number,
                e_tag,
            });
            session.bytes_uploaded += part_bytes;
            on_progress(UploadProgress {
                part_number,
                part_bytes,
                bytes_uploaded: session.bytes_uploaded,
            });

            part_number += 1;
            chunk = reader.next_chunk().await.map_err(UploadError::SourceRead)?;
        }

        Ok(())
    }

    async fn complete(
        &self,
        session: &mut UploadSession<'_>,
        cancel: &CancellationToken,
    ) -> Result<CompletedUpload, UploadError> {
        let parts = session.parts.clone().into_sorted();
        let target = session.target;

        let e_tag = guarded(
            cancel,
            self.store.complete_multipart_upload(
                &target.bucket,
                &target.key,
                &session.upload_id,
                &parts,
            ),
        )
        .await?;

        session.transition(SessionState::Completed);
        info!(
            upload_id = %session.upload_id,
            parts = parts.len(),
            bytes = session.bytes_uploaded,
            "completed multipart upload"
        );

        Ok(CompletedUpload {
            bucket: target.bucket.clone(),
            key: target.key.clone(),
            upload_id: Some(session.upload_id.clone()),
            parts,
            bytes_uploaded: session.bytes_uploaded,
            e_tag,
        })
    }

    /// Abort `session` and hand back the error to report.
    ///
    /// The abort is not subject to cancellation. A failed abort never hides
    /// `cause`: both travel in [`UploadError::AbortFailed`].
    async fn abort(&self, session: &mut UploadSession<'_>, cause: UploadError) -> UploadError {
        warn!(
            upload_id = %session.upload_id,
            parts = session.parts.len(),
            error = %cause,
            "multipart upload failed, aborting"
        );

        let target = session.target;
        let aborted = self
            .store
            .abort_multipart_upload(&target.bucket, &target.key, &session.upload_id)
            .await;
        session.transition(SessionState::Aborted);

        match aborted {
            Ok(()) => cause,
            Err(abort) => {
                error!(upload_id = %session.upload_id, error = %abort, "abort failed");
                UploadError::AbortFailed {
                    upload_id: session.upload_id.clone(),
                    cause: Box::new(cause),
                    abort,
                }
            }
        }
    }

    /// S3 refuses to complete a multipart upload without parts, so an empty
    /// source becomes a plain zero-byte object.
    async fn put_empty(
        &self,
        target: &UploadTarget,
        cancel: &CancellationToken,
    ) -> Result<CompletedUpload, UploadError> {
        info!("source is empty, writing a zero-byte object");
        let e_tag = guarded(
            cancel,
            self.store.put_object(
                &target.bucket,
                &target.key,
                target.content_type(),
                Vec::new(),
            ),
        )
        .await?;

        Ok(CompletedUpload {
            bucket: target.bucket.clone(),
            key: target.key.clone(),
            upload_id: None,
            parts: Vec::new(),
            bytes_uploaded: 0,
            e_tag,
        })
    }
}
