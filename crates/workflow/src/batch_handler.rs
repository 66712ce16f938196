use crate::consumer::{MessageOutcome, QueueConsumer};
use crate::error::EngineError;
use aws_lambda_events::sqs::{BatchItemFailure, SqsBatchResponse, SqsEvent, SqsMessage};
use lambda_runtime::{Error, LambdaEvent, tracing};
use model::{InstanceId, InstanceStatus};
use queue::QueueMessage;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time kept back from the invocation deadline to return the batch response.
const RESPONSE_MARGIN: Duration = Duration::from_secs(10);

/// Lambda entry point for a batch of upload notifications.
///
/// Messages that could not start an instance are reported back as batch item
/// failures, so the function *must* have `ReportBatchItemFailures` enabled.
/// The instances that were started are awaited before returning so the
/// sandbox is not frozen mid-workflow, but only until shortly before the
/// invocation deadline. Instances still running then are left to finish in
/// the background or be recovered by the poller. Their outcome never changes
/// which messages are reported.
pub async fn handle_sqs_event(
    consumer: &QueueConsumer,
    event: LambdaEvent<SqsEvent>,
) -> Result<SqsBatchResponse, Error> {
    let wait_budget: Duration = time_left(event.context.deadline);
    let messages: Vec<QueueMessage> = event
        .payload
        .records
        .into_iter()
        .map(|message: SqsMessage| QueueMessage {
            // We need to keep the message_id to report failures to SQS
            message_id: message.message_id.unwrap_or_default(),
            receipt: message.receipt_handle.unwrap_or_default(),
            body: message.body,
        })
        .collect();

    tracing::info!("Handling batch of [{}] from SQS", messages.len());

    let outcomes: Vec<MessageOutcome> = consumer.handle_batch(&messages).await;

    let mut started: Vec<InstanceId> = Vec::new();
    let mut batch_item_failures: Vec<BatchItemFailure> = Vec::new();
    for (message, outcome) in messages.into_iter().zip(outcomes) {
        match outcome {
            MessageOutcome::Acknowledge { instance_id } => started.push(instance_id),
            MessageOutcome::Reject { .. } => batch_item_failures.push(BatchItemFailure {
                item_identifier: message.message_id,
            }),
        }
    }

    let waiting = futures::future::join_all(
        started
            .iter()
            .map(|instance_id: &InstanceId| consumer.executor().wait(instance_id)),
    );

    let finished: Vec<Result<InstanceStatus, EngineError>> =
        match tokio::time::timeout(wait_budget, waiting).await {
            Ok(finished) => finished,
            Err(_) => {
                tracing::warn!(
                    "Returning before the deadline with [{}] workflows still running",
                    consumer.executor().running()
                );
                return Ok(SqsBatchResponse {
                    batch_item_failures,
                });
            }
        };

    for (instance_id, status) in started.iter().zip(finished) {
        match status {
            Ok(InstanceStatus { error: Some(reason), .. }) => {
                tracing::error!("Workflow {instance_id} failed: {reason}")
            }
            Ok(status) => tracing::debug!("Workflow {instance_id} ended {}", status.state),
            Err(err) => tracing::warn!("Could not await workflow {instance_id}: {err}"),
        }
    }

    Ok(SqsBatchResponse {
        batch_item_failures,
    })
}

/// How long instances may be awaited before a deadline given in epoch millis.
fn time_left(deadline_ms: u64) -> Duration {
    let deadline: SystemTime = UNIX_EPOCH + Duration::from_millis(deadline_ms);

    deadline
        .duration_since(SystemTime::now())
        .unwrap_or_default()
        .saturating_sub(RESPONSE_MARGIN)
}
