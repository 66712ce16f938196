use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::operation::delete_message::DeleteMessageError;
use aws_sdk_sqs::operation::receive_message::ReceiveMessageOutput;
use lambda_runtime::tracing;
use queue::{QueueError, QueueMessage, QueueSource};

/// Long-polling SQS consumer.
pub struct SqsQueueSource {
    pub sqs: aws_sdk_sqs::Client,
    pub queue_url: String,
    pub batch_size: i32,
    pub wait_seconds: i32,
    // Visibility applied on nack, zero makes the message visible immediately
    pub nack_visibility_seconds: i32,
}

impl SqsQueueSource {
    pub fn new(sqs: aws_sdk_sqs::Client, queue_url: impl Into<String>) -> Self {
        Self {
            sqs,
            queue_url: queue_url.into(),
            batch_size: 10,
            wait_seconds: 20,
            nack_visibility_seconds: 30,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_wait_seconds(mut self, wait_seconds: i32) -> Self {
        self.wait_seconds = wait_seconds;
        self
    }

    pub fn with_nack_visibility_seconds(mut self, nack_visibility_seconds: i32) -> Self {
        self.nack_visibility_seconds = nack_visibility_seconds;
        self
    }
}

fn backend_error<E: std::error::Error>(err: E) -> QueueError {
    QueueError::Backend(DisplayErrorContext(err).to_string().into())
}

#[async_trait]
impl QueueSource for SqsQueueSource {
    async fn receive(&self) -> Result<Vec<QueueMessage>, QueueError> {
        let output: ReceiveMessageOutput = self
            .sqs
            .receive_message()
            .queue_url(self.queue_url.as_str())
            .max_number_of_messages(self.batch_size)
            .wait_time_seconds(self.wait_seconds)
            .send()
            .await
            .map_err(backend_error)?;

        let messages: Vec<QueueMessage> = output
            .messages()
            .iter()
            .filter_map(|message| {
                let (Some(message_id), Some(receipt)) =
                    (message.message_id(), message.receipt_handle())
                else {
                    tracing::warn!("Skipping SQS message without id or receipt handle");
                    return None;
                };

                Some(QueueMessage {
                    message_id: message_id.to_string(),
                    receipt: receipt.to_string(),
                    body: message.body().map(str::to_string),
                })
            })
            .collect();

        Ok(messages)
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        self.sqs
            .delete_message()
            .queue_url(self.queue_url.as_str())
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(DeleteMessageError::ReceiptHandleIsInvalid(_)) => {
                    QueueError::UnknownReceipt(receipt.to_string())
                }
                _ => backend_error(err),
            })?;

        Ok(())
    }

    async fn nack(&self, receipt: &str) -> Result<(), QueueError> {
        self.sqs
            .change_message_visibility()
            .queue_url(self.queue_url.as_str())
            .receipt_handle(receipt)
            .visibility_timeout(self.nack_visibility_seconds)
            .send()
            .await
            .map_err(backend_error)?;

        Ok(())
    }
}
