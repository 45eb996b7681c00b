use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct Record {
    index: u64,
    id: String,
    label: String,
    score: f64,
    tags: [&'static str; 3],
}

const TAGS: [&str; 7] = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta"];

impl Record {
    fn new(index: u64) -> Self {
        let tag = |offset: u64| TAGS[((index + offset) % TAGS.len() as u64) as usize];
        Self {
            index,
            id: Uuid::new_v4().to_string(),
            label: format!("record-{index:08}"),
            score: (index % 1000) as f64 / 7.0,
            tags: [tag(0), tag(3), tag(5)],
        }
    }
}

/// A JSON array of records, at least `min_size` bytes long.
///
/// Sizes are approximate by at most one record (~150 bytes); `0` yields `[]`.
pub fn generate(min_size: usize) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::with_capacity(min_size + 256);
    out.push(b'[');

    let mut index = 0u64;
    while out.len() + 1 < min_size {
        if index > 0 {
            out.push(b',');
        }
        serde_json::to_writer(&mut out, &Record::new(index))?;
        index += 1;
    }

    out.push(b']');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn test_generate_reaches_requested_size_and_parses() {
        let payload = generate(64 * 1024).unwrap();
        assert!(payload.len() >= 64 * 1024);
        assert!(payload.len() < 64 * 1024 + 512);

        let value: Value = serde_json::from_slice(&payload).unwrap();
        let records = value.as_array().unwrap();
        assert_eq!(records[0]["index"], 0);
        assert_eq!(records[1]["label"], "record-00000001");
    }

    #[test]
    fn test_generate_zero_is_empty_array() {
        assert_eq!(generate(0).unwrap(), b"[]");
        assert_eq!(generate(2).unwrap(), b"[]");
    }
}
