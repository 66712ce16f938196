use async_trait::async_trait;
use model::Error;
use thiserror::Error;

/// One delivery of a message. The same message may be delivered again,
/// each time with a fresh receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    // Handle used to ack or nack this particular delivery
    pub receipt: String,
    pub body: Option<String>,
}

/// At-least-once message source.
///
/// A message that is neither acked nor nacked becomes visible again once the
/// source's visibility timeout lapses.
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Wait for the next batch. May return an empty batch.
    async fn receive(&self) -> Result<Vec<QueueMessage>, QueueError>;
    /// Remove the message for good.
    async fn ack(&self, receipt: &str) -> Result<(), QueueError>;
    /// Make the message available for redelivery.
    async fn nack(&self, receipt: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend failure: {0}")]
    Backend(Error),
    #[error("unknown receipt '{0}'")]
    UnknownReceipt(String),
}
