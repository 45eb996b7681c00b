use async_trait::async_trait;

use crate::error::StoreError;

mod memory;
mod s3;

pub use memory::{FailurePoint, MemoryStore, StoreCall, StoredObject};
pub use s3::{S3Store, S3StoreConfig};

/// Identifies one uploaded part when the upload is completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1-based, unique within one upload session.
    pub part_number: u32,
    pub e_tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create `bucket`. A bucket that already exists is reported as
    /// [`BucketStatus::AlreadyExists`], not as an error.
    async fn create_bucket(&self, bucket: &str) -> Result<BucketStatus, StoreError>;

    /// Start a multipart upload and return its upload id.
    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String, StoreError>;

    /// Upload one part and return the entity tag the store assigned to it.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<String, StoreError>;

    /// Assemble the uploaded parts into one object. `parts` must be sorted by
    /// part number.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartDescriptor],
    ) -> Result<Option<String>, StoreError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError>;

    /// Single-shot write, used for sources too small to form a part.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> Result<Option<String>, StoreError>;
}
