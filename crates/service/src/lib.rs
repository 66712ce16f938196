pub mod bedrock;
pub mod s3;

pub use bedrock::BedrockInferenceClient;
pub use s3::S3ObjectFetcher;

use async_trait::async_trait;
use model::ObjectKey;
use thiserror::Error;

/// Reads uploaded objects from storage.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn fetch(&self, object_key: &ObjectKey) -> Result<Vec<u8>, ServiceError>;
}

/// Describes an image with a language model.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(&self, request: InferenceRequest<'_>) -> Result<String, ServiceError>;
}

#[derive(Debug, Clone, Copy)]
pub struct InferenceRequest<'a> {
    pub image: &'a [u8],
    pub prompt: &'a str,
    pub max_tokens: u32,
}

/// Errors arising from calling a remote service.
/// Neither collaborator retries; classification drives the caller's retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    // The referenced object does not exist
    #[error("object '{0}' not found")]
    NotFound(String),
    // Worth retrying: throttling, timeouts, unavailability
    #[error("transient service failure: {0}")]
    Transient(String),
    // The service refused the request and always will
    #[error("service rejected the request: {0}")]
    Rejected(String),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient(_))
    }
}
