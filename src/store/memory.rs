use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap, HashSet, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use uuid::Uuid;

use super::{BucketStatus, ObjectStore, PartDescriptor};
use crate::error::{StoreError, StoreOperation};

/// A store call that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    CreateBucket,
    Initiate,
    UploadPart(u32),
    Complete,
    Abort,
    PutObject,
}

/// One call as the store received it, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    CreateBucket {
        bucket: String,
    },
    Initiate {
        bucket: String,
        key: String,
        content_type: Option<String>,
    },
    UploadPart {
        upload_id: String,
        part_number: u32,
        bytes: usize,
    },
    Complete {
        upload_id: String,
        part_numbers: Vec<u32>,
    },
    Abort {
        upload_id: String,
    },
    PutObject {
        bucket: String,
        key: String,
        bytes: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub e_tag: String,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    content_type: Option<String>,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct State {
    buckets: HashSet<String>,
    uploads: HashMap<String, PendingUpload>,
    objects: HashMap<(String, String), StoredObject>,
    calls: Vec<StoreCall>,
    failures: HashSet<FailurePoint>,
}

/// In-process [`ObjectStore`] holding everything in memory.
///
/// Validates completion requests the way S3 does (ascending, gap-free part
/// numbers starting at 1, entity tags matching what was issued, at least one
/// part) and records every call so tests can assert on the exact sequence.
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

fn e_tag_for(body: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("\"{:016x}\"", hasher.finish())
}

fn rejected(operation: StoreOperation, message: impl Into<String>) -> StoreError {
    StoreError::Rejected {
        operation,
        message: message.into(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent call matching `point` fail.
    pub fn fail_on(&self, point: FailurePoint) {
        self.state().failures.insert(point);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state().calls.clone()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.state().buckets.contains(bucket)
    }

    /// Multipart sessions that were initiated but neither completed nor aborted.
    pub fn pending_uploads(&self) -> Vec<String> {
        self.state().uploads.keys().cloned().collect()
    }
}

impl State {
    fn check(&self, point: FailurePoint, operation: StoreOperation) -> Result<(), StoreError> {
        if self.failures.contains(&point) {
            return Err(rejected(operation, format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    fn upload_mut(
        &mut self,
        operation: StoreOperation,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<&mut PendingUpload, StoreError> {
        match self.uploads.get_mut(upload_id) {
            Some(upload) if upload.bucket == bucket && upload.key == key => Ok(upload),
            _ => Err(rejected(operation, format!("NoSuchUpload: {upload_id}"))),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create_bucket(&self, bucket: &str) -> Result<BucketStatus, StoreError> {
        let mut state = self.state();
        state.calls.push(StoreCall::CreateBucket {
            bucket: bucket.to_string(),
        });
        state.check(FailurePoint::CreateBucket, StoreOperation::CreateBucket)?;

        if state.buckets.insert(bucket.to_string()) {
            Ok(BucketStatus::Created)
        } else {
            Ok(BucketStatus::AlreadyExists)
        }
    }

    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String, StoreError> {
        let operation = StoreOperation::InitiateMultipartUpload;
        let mut state = self.state();
        state.calls.push(StoreCall::Initiate {
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_type: content_type.map(str::to_string),
        });
        state.check(FailurePoint::Initiate, operation)?;

        if !state.buckets.contains(bucket) {
            return Err(rejected(operation, format!("NoSuchBucket: {bucket}")));
        }

        let upload_id = Uuid::new_v4().simple().to_string();
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_type: content_type.map(str::to_string),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<String, StoreError> {
        let operation = StoreOperation::UploadPart;
        let mut state = self.state();
        state.calls.push(StoreCall::UploadPart {
            upload_id: upload_id.to_string(),
            part_number,
            bytes: body.len(),
        });
        state.check(FailurePoint::UploadPart(part_number), operation)?;

        if !(1..=10_000).contains(&part_number) {
            return Err(rejected(
                operation,
                format!("InvalidArgument: part number {part_number}"),
            ));
        }

        let upload = state.upload_mut(operation, bucket, key, upload_id)?;
        let e_tag = e_tag_for(&body);
        upload.parts.insert(part_number, (e_tag.clone(), body));
        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartDescriptor],
    ) -> Result<Option<String>, StoreError> {
        let operation = StoreOperation::CompleteMultipartUpload;
        let mut state = self.state();
        state.calls.push(StoreCall::Complete {
            upload_id: upload_id.to_string(),
            part_numbers: parts.iter().map(|p| p.part_number).collect(),
        });
        state.check(FailurePoint::Complete, operation)?;

        let upload = state.upload_mut(operation, bucket, key, upload_id)?;

        if parts.is_empty() {
            return Err(rejected(
                operation,
                "MalformedXML: at least one part is required",
            ));
        }

        let mut body = Vec::new();
        for (index, part) in parts.iter().enumerate() {
            if part.part_number as usize != index + 1 {
                return Err(rejected(
                    operation,
                    format!(
                        "InvalidPartOrder: expected part {} at position {}, got {}",
                        index + 1,
                        index,
                        part.part_number
                    ),
                ));
            }
            match upload.parts.get(&part.part_number) {
                Some((e_tag, bytes)) if *e_tag == part.e_tag => body.extend_from_slice(bytes),
                _ => {
                    return Err(rejected(
                        operation,
                        format!("InvalidPart: part {} not found", part.part_number),
                    ));
                }
            }
        }

        let content_type = upload.content_type.clone();
        state.uploads.remove(upload_id);

        let e_tag = format!("\"{}-{}\"", e_tag_for(&body).trim_matches('"'), parts.len());
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                content_type,
                e_tag: e_tag.clone(),
            },
        );
        Ok(Some(e_tag))
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let operation = StoreOperation::AbortMultipartUpload;
        let mut state = self.state();
        state.calls.push(StoreCall::Abort {
            upload_id: upload_id.to_string(),
        });
        state.check(FailurePoint::Abort, operation)?;

        state.upload_mut(operation, bucket, key, upload_id)?;
        state.uploads.remove(upload_id);
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> Result<Option<String>, StoreError> {
        let operation = StoreOperation::PutObject;
        let mut state = self.state();
        state.calls.push(StoreCall::PutObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            bytes: body.len(),
        });
        state.check(FailurePoint::PutObject, operation)?;

        if !state.buckets.contains(bucket) {
            return Err(rejected(operation, format!("NoSuchBucket: {bucket}")));
        }

        let e_tag = e_tag_for(&body);
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                content_type: content_type.map(str::to_string),
                e_tag: e_tag.clone(),
            },
        );
        Ok(Some(e_tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(part_number: u32, e_tag: &str) -> PartDescriptor {
        PartDescriptor {
            part_number,
            e_tag: e_tag.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_bucket_twice_reports_existing() {
        let store = MemoryStore::new();
        assert_eq!(
            store.create_bucket("b").await.unwrap(),
            BucketStatus::Created
        );
        assert_eq!(
            store.create_bucket("b").await.unwrap(),
            BucketStatus::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_complete_rejects_out_of_order_parts() {
        let store = MemoryStore::new();
        store.create_bucket("b").await.unwrap();
        let id = store.initiate_multipart_upload("b", "k", None).await.unwrap();
        let first = store.upload_part("b", "k", &id, 1, vec![1]).await.unwrap();
        let second = store.upload_part("b", "k", &id, 2, vec![2]).await.unwrap();

        let err = store
            .complete_multipart_upload("b", "k", &id, &[part(2, &second), part(1, &first)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("InvalidPartOrder"));

        store
            .complete_multipart_upload("b", "k", &id, &[part(1, &first), part(2, &second)])
            .await
            .unwrap();
        assert_eq!(store.object("b", "k").unwrap().body, vec![1, 2]);
        assert!(store.pending_uploads().is_empty());
    }

    #[tokio::test]
    async fn test_complete_rejects_gaps_and_empty_part_lists() {
        let store = MemoryStore::new();
        store.create_bucket("b").await.unwrap();
        let id = store.initiate_multipart_upload("b", "k", None).await.unwrap();
        let e_tag = store.upload_part("b", "k", &id, 2, vec![2]).await.unwrap();

        let err = store
            .complete_multipart_upload("b", "k", &id, &[part(2, &e_tag)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("InvalidPartOrder"));

        let err = store
            .complete_multipart_upload("b", "k", &id, &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("MalformedXML"));
    }

    #[tokio::test]
    async fn test_complete_rejects_wrong_e_tag() {
        let store = MemoryStore::new();
        store.create_bucket("b").await.unwrap();
        let id = store.initiate_multipart_upload("b", "k", None).await.unwrap();
        store.upload_part("b", "k", &id, 1, vec![1]).await.unwrap();

        let err = store
            .complete_multipart_upload("b", "k", &id, &[part(1, "\"bogus\"")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("InvalidPart"));
    }

    #[tokio::test]
    async fn test_injected_failure_is_recorded_and_returned() {
        let store = MemoryStore::new();
        store.fail_on(FailurePoint::CreateBucket);

        let err = store.create_bucket("b").await.unwrap_err();
        assert_eq!(err.operation(), StoreOperation::CreateBucket);
        assert_eq!(
            store.calls(),
            vec![StoreCall::CreateBucket {
                bucket: "b".to_string()
            }]
        );
        assert!(!store.has_bucket("b"));
    }

    #[tokio::test]
    async fn test_abort_discards_parts() {
        let store = MemoryStore::new();
        store.create_bucket("b").await.unwrap();
        let id = store.initiate_multipart_upload("b", "k", None).await.unwrap();
        store.upload_part("b", "k", &id, 1, vec![1]).await.unwrap();

        store.abort_multipart_upload("b", "k", &id).await.unwrap();
        assert!(store.pending_uploads().is_empty());
        assert!(store.object("b", "k").is_none());

        let err = store.abort_multipart_upload("b", "k", &id).await.unwrap_err();
        assert!(err.to_string().contains("NoSuchUpload"));
    }
}
