//! Multipart uploads against S3-compatible stores, plus the pieces needed to
//! reproduce them against a throwaway storage emulator.

pub mod chunk;
pub mod config;
pub mod error;
pub mod payload;
pub mod provision;
pub mod store;
pub mod upload;

pub use chunk::ChunkReader;
pub use error::{ProvisioningError, StoreError, StoreOperation, UploadError};
pub use store::{MemoryStore, ObjectStore, PartDescriptor, S3Store, S3StoreConfig};
pub use upload::{CompletedUpload, MultipartUploader, UploadProgress, UploadTarget};
