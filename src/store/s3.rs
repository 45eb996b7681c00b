use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, http::HttpResponse},
    error::{ProvideErrorMetadata, SdkError},
    operation::create_bucket::CreateBucketError,
    primitives::ByteStream,
    types::{
        BucketLocationConstraint, CompletedMultipartUpload, CompletedPart,
        CreateBucketConfiguration,
    },
};
use tracing::{debug, instrument};
use url::Url;

use super::{BucketStatus, ObjectStore, PartDescriptor};
use crate::error::{StoreError, StoreOperation};

/// S3 needs no location constraint in its default region and rejects one.
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone)]
pub struct S3StoreConfig {
    pub endpoint: Url,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub force_path_style: bool,
}

impl S3StoreConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            region: DEFAULT_REGION.to_string(),
            access_key_id: "xxx".to_string(),
            secret_access_key: "xxx".to_string(),
            force_path_style: true,
        }
    }
}

/// [`ObjectStore`] backed by the AWS SDK, pointed at any S3-compatible endpoint.
pub struct S3Store {
    client: Client,
    region: String,
}

impl S3Store {
    pub fn new(config: S3StoreConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "s3bug-static",
        );

        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(config.endpoint.as_str().trim_end_matches('/'))
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style)
            .build();

        Self {
            client: Client::from_conf(sdk_config),
            region: config.region,
        }
    }

    fn bucket_configuration(&self) -> Option<CreateBucketConfiguration> {
        if self.region == DEFAULT_REGION {
            return None;
        }
        Some(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                .build(),
        )
    }
}

fn store_error<E>(operation: StoreOperation, err: SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match err {
        SdkError::ServiceError(service) => {
            let err = service.err();
            StoreError::Rejected {
                operation,
                message: format!(
                    "{}: {}",
                    err.code().unwrap_or("Unknown"),
                    err.message().unwrap_or("no message")
                ),
            }
        }
        other => StoreError::Transport {
            operation,
            source: Box::new(other),
        },
    }
}

/// The SDK models part numbers as `i32`.
fn sdk_part_number(operation: StoreOperation, part_number: u32) -> Result<i32, StoreError> {
    i32::try_from(part_number).map_err(|_| StoreError::Rejected {
        operation,
        message: format!("part number {part_number} out of range"),
    })
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn create_bucket(&self, bucket: &str) -> Result<BucketStatus, StoreError> {
        let result = self
            .client
            .create_bucket()
            .bucket(bucket)
            .set_create_bucket_configuration(self.bucket_configuration())
            .send()
            .await;

        match result {
            Ok(_) => Ok(BucketStatus::Created),
            Err(SdkError::ServiceError(service))
                if matches!(
                    service.err(),
                    CreateBucketError::BucketAlreadyOwnedByYou(_)
                        | CreateBucketError::BucketAlreadyExists(_)
                ) =>
            {
                debug!(bucket, "bucket already exists");
                Ok(BucketStatus::AlreadyExists)
            }
            Err(err) => Err(store_error(StoreOperation::CreateBucket, err)),
        }
    }

    #[instrument(skip(self))]
    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String, StoreError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(|e| store_error(StoreOperation::InitiateMultipartUpload, e))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or(StoreError::MalformedResponse {
                operation: StoreOperation::InitiateMultipartUpload,
                field: "UploadId",
            })
    }

    #[instrument(skip(self, body), fields(bytes = body.len()))]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<String, StoreError> {
        let part_number = sdk_part_number(StoreOperation::UploadPart, part_number)?;

        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| store_error(StoreOperation::UploadPart, e))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or(StoreError::MalformedResponse {
                operation: StoreOperation::UploadPart,
                field: "ETag",
            })
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartDescriptor],
    ) -> Result<Option<String>, StoreError> {
        let completed_parts = parts
            .iter()
            .map(|part| {
                let part_number =
                    sdk_part_number(StoreOperation::CompleteMultipartUpload, part.part_number)?;
                Ok(CompletedPart::builder()
                    .e_tag(&part.e_tag)
                    .part_number(part_number)
                    .build())
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| store_error(StoreOperation::CompleteMultipartUpload, e))?;

        Ok(output.e_tag().map(str::to_string))
    }

    #[instrument(skip(self))]
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| store_error(StoreOperation::AbortMultipartUpload, e))?;
        Ok(())
    }

    #[instrument(skip(self, body), fields(bytes = body.len()))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> Result<Option<String>, StoreError> {
        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| store_error(StoreOperation::PutObject, e))?;

        Ok(output.e_tag().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_path_style_and_placeholder_credentials() {
        let config = S3StoreConfig::new(Url::parse("http://localhost:4566").unwrap());
        assert!(config.force_path_style);
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.access_key_id, "xxx");
        assert_eq!(config.secret_access_key, "xxx");
    }

    #[test]
    fn test_part_numbers_beyond_i32_are_rejected() {
        assert_eq!(
            sdk_part_number(StoreOperation::UploadPart, 10_000).unwrap(),
            10_000
        );

        let err =
            sdk_part_number(StoreOperation::CompleteMultipartUpload, u32::MAX).unwrap_err();
        assert_eq!(err.operation(), StoreOperation::CompleteMultipartUpload);
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_location_constraint_only_outside_default_region() {
        let endpoint = Url::parse("http://localhost:4566").unwrap();
        let store = S3Store::new(S3StoreConfig::new(endpoint.clone()));
        assert!(store.bucket_configuration().is_none());

        let store = S3Store::new(S3StoreConfig {
            region: "eu-west-1".to_string(),
            ..S3StoreConfig::new(endpoint)
        });
        let configuration = store.bucket_configuration().unwrap();
        assert_eq!(
            configuration.location_constraint(),
            Some(&BucketLocationConstraint::EuWest1)
        );
    }
}
