use crate::{ObjectFetcher, ServiceError};
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::operation::get_object::GetObjectError;
use model::ObjectKey;

/// Error codes retrying cannot fix.
const PERMANENT_ERROR_CODES: [&str; 4] = [
    "AccessDenied",
    "AllAccessDisabled",
    "InvalidBucketName",
    "NoSuchBucket",
];

pub struct S3ObjectFetcher {
    s3: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectFetcher {
    pub fn new(s3: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            s3,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectFetcher for S3ObjectFetcher {
    async fn fetch(&self, object_key: &ObjectKey) -> Result<Vec<u8>, ServiceError> {
        let output = self
            .s3
            .get_object()
            .bucket(&self.bucket)
            .key(object_key.as_str())
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(GetObjectError::NoSuchKey(_)) => ServiceError::NotFound(object_key.to_string()),
                Some(GetObjectError::InvalidObjectState(_)) => {
                    ServiceError::Rejected(DisplayErrorContext(&err).to_string())
                }
                Some(service_err)
                    if service_err
                        .code()
                        .is_some_and(|code| PERMANENT_ERROR_CODES.contains(&code)) =>
                {
                    ServiceError::Rejected(DisplayErrorContext(&err).to_string())
                }
                _ => ServiceError::Transient(DisplayErrorContext(&err).to_string()),
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|err| ServiceError::Transient(err.to_string()))?;

        Ok(body.into_bytes().to_vec())
    }
}
