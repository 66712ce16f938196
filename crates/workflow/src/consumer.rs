use crate::engine::WorkflowExecutor;
use crate::error::ConsumerError;
use lambda_runtime::tracing;
use lambda_runtime::tracing::instrument::Instrumented;
use lambda_runtime::tracing::{Instrument, Span};
use model::{InstanceId, UploadEvent};
use queue::{QueueError, QueueMessage, QueueSource};
use std::future::Future;
use std::time::Duration;

/// Pause after a failed receive before polling again.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Decision taken for one message.
#[derive(Debug)]
pub enum MessageOutcome {
    Acknowledge { instance_id: InstanceId },
    Reject { error: ConsumerError },
}

impl MessageOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, MessageOutcome::Acknowledge { .. })
    }
}

/// Tally of one `poll_once` round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub received: usize,
    pub acknowledged: usize,
    pub rejected: usize,
}

/// Turns upload notifications into workflow instances.
///
/// Messages are not deduplicated here: a repeated key simply starts another
/// instance and the tracking store keeps the latest one.
#[derive(Clone)]
pub struct QueueConsumer {
    executor: WorkflowExecutor,
}

impl QueueConsumer {
    pub fn new(executor: WorkflowExecutor) -> Self {
        QueueConsumer { executor }
    }

    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    /// Decide each message of a batch independently, in input order.
    pub async fn handle_batch(&self, messages: &[QueueMessage]) -> Vec<MessageOutcome> {
        tracing::info!("Handling batch of [{}] messages", messages.len());

        let tasks: Vec<Instrumented<_>> = messages
            .iter()
            .map(|message: &QueueMessage| {
                let message_span: Span = tracing::span!(
                    tracing::Level::INFO,
                    "Queue message",
                    message_id = message.message_id.as_str()
                );

                self.handle_message(message).instrument(message_span)
            })
            .collect();

        futures::future::join_all(tasks).await
    }

    async fn handle_message(&self, message: &QueueMessage) -> MessageOutcome {
        match self.start_instance(message.body.as_deref()).await {
            Ok(instance_id) => MessageOutcome::Acknowledge { instance_id },
            Err(error) => {
                tracing::error!("Rejecting message {}: {error}", message.message_id);
                MessageOutcome::Reject { error }
            }
        }
    }

    async fn start_instance(&self, body: Option<&str>) -> Result<InstanceId, ConsumerError> {
        let event: UploadEvent = UploadEvent::from_body(body.unwrap_or_default())?;
        let instance_id: InstanceId = self.executor.create(event.object_key).await?;

        Ok(instance_id)
    }

    /// Receive one batch from `source`, then ack or nack every message.
    pub async fn poll_once(&self, source: &dyn QueueSource) -> Result<PollSummary, QueueError> {
        let messages: Vec<QueueMessage> = source.receive().await?;
        if messages.is_empty() {
            return Ok(PollSummary::default());
        }

        let outcomes: Vec<MessageOutcome> = self.handle_batch(&messages).await;
        let mut summary: PollSummary = PollSummary {
            received: messages.len(),
            ..PollSummary::default()
        };

        for (message, outcome) in messages.iter().zip(outcomes) {
            let settled: Result<(), QueueError> = if outcome.is_acknowledged() {
                summary.acknowledged += 1;
                source.ack(&message.receipt).await
            } else {
                summary.rejected += 1;
                source.nack(&message.receipt).await
            };

            // The message comes back on its own once its visibility lapses
            if let Err(err) = settled {
                tracing::warn!("Failed to settle message {}: {err}", message.message_id);
            }
        }

        Ok(summary)
    }

    /// Poll `source` until `shutdown` resolves.
    pub async fn run(&self, source: &dyn QueueSource, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Stopping queue consumer");
                    return;
                }
                polled = self.poll_once(source) => match polled {
                    Ok(summary) if summary.received > 0 => tracing::info!(
                        "Acknowledged [{}] and rejected [{}] of [{}] messages",
                        summary.acknowledged,
                        summary.rejected,
                        summary.received
                    ),
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!("Failed to receive messages: {err}");
                        tokio::time::sleep(RECEIVE_BACKOFF).await;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceSettings;
    use crate::pipeline::Services;
    use crate::retry::RetryPolicy;
    use model::{EventError, InstanceState, InstanceStatus, ObjectKey, StepName, WorkflowRecord};
    use state::{StepLog, TrackingStore};
    use state_in_memory::InMemoryTrackingStore;
    use std::collections::HashSet;
    use std::sync::Arc;
    use test_utils::{CountingFetcher, InMemoryQueue, ScriptedInference, SwitchableStepLog};

    struct Fixture {
        queue: InMemoryQueue,
        step_log: Arc<SwitchableStepLog>,
        tracking: Arc<InMemoryTrackingStore>,
        consumer: QueueConsumer,
    }

    fn fixture() -> Fixture {
        fixture_with(ScriptedInference::replying("A photo of a cat"))
    }

    fn fixture_with(inference: ScriptedInference) -> Fixture {
        let step_log: Arc<SwitchableStepLog> = Arc::new(SwitchableStepLog::default());
        let tracking: Arc<InMemoryTrackingStore> = Arc::new(InMemoryTrackingStore::default());

        let executor: WorkflowExecutor = WorkflowExecutor::new(
            step_log.clone(),
            Services {
                tracking: tracking.clone(),
                fetcher: Arc::new(
                    CountingFetcher::default().with_object("cat.png", b"\xff\xd8\xffcat"),
                ),
                inference: Arc::new(inference),
            },
            RetryPolicy::fast(3),
            InferenceSettings::default(),
        );

        Fixture {
            queue: InMemoryQueue::default(),
            step_log,
            tracking,
            consumer: QueueConsumer::new(executor),
        }
    }

    async fn wait_for_all(consumer: &QueueConsumer, outcomes: &[MessageOutcome]) {
        for outcome in outcomes {
            if let MessageOutcome::Acknowledge { instance_id } = outcome {
                let status: InstanceStatus = consumer.executor().wait(instance_id).await.unwrap();
                assert_eq!(InstanceState::Completed, status.state);
            }
        }
    }

    async fn recorded_analysis(fixture: &Fixture, instance_id: &InstanceId) -> Option<String> {
        fixture
            .step_log
            .get_step(instance_id, StepName::RunInference)
            .await
            .unwrap()
            .and_then(|entry| serde_json::from_value(entry.output).ok())
    }

    fn message(id: &str, body: &str) -> QueueMessage {
        QueueMessage {
            message_id: id.to_string(),
            receipt: format!("receipt-{id}"),
            body: Some(body.to_string()),
        }
    }

    #[tokio::test]
    async fn poison_message_does_not_block_its_sibling() {
        let fixture: Fixture = fixture();

        let outcomes: Vec<MessageOutcome> = fixture
            .consumer
            .handle_batch(&[
                message("poison", r#"{"bucket":"uploads"}"#),
                message("valid", r#"{"objectKey":"cat.png"}"#),
            ])
            .await;

        assert!(matches!(
            outcomes[0],
            MessageOutcome::Reject {
                error: ConsumerError::PoisonMessage(EventError::MissingKey)
            }
        ));
        assert!(outcomes[1].is_acknowledged());

        wait_for_all(&fixture.consumer, &outcomes).await;
    }

    #[tokio::test]
    async fn poll_acks_valid_and_nacks_poison_messages() {
        let fixture: Fixture = fixture();
        let valid: String = fixture.queue.send(r#"{"objectKey":"cat.png"}"#);
        let poison: String = fixture.queue.send("not json");

        let summary: PollSummary = fixture.consumer.poll_once(&fixture.queue).await.unwrap();

        assert_eq!(
            PollSummary {
                received: 2,
                acknowledged: 1,
                rejected: 1
            },
            summary
        );
        assert_eq!(vec![valid], fixture.queue.acked());
        assert_eq!(vec![poison], fixture.queue.visible_ids());
    }

    #[tokio::test]
    async fn failed_create_is_redelivered_then_completes() {
        let fixture: Fixture = fixture();
        let message_id: String = fixture.queue.send(r#"{"objectKey":"cat.png"}"#);

        fixture.step_log.set_available(false);
        let summary: PollSummary = fixture.consumer.poll_once(&fixture.queue).await.unwrap();
        assert_eq!(1, summary.rejected);
        assert!(fixture.queue.acked().is_empty());

        fixture.step_log.set_available(true);
        let messages: Vec<QueueMessage> = fixture.queue.receive().await.unwrap();
        assert_eq!(message_id, messages[0].message_id);

        let outcomes: Vec<MessageOutcome> = fixture.consumer.handle_batch(&messages).await;
        fixture.queue.ack(&messages[0].receipt).await.unwrap();
        wait_for_all(&fixture.consumer, &outcomes).await;

        let record: WorkflowRecord = fixture
            .tracking
            .get(&ObjectKey::parse("cat.png").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("A photo of a cat".to_string()), record.analysis_result);
        assert_eq!(vec![message_id], fixture.queue.acked());
    }

    #[tokio::test]
    async fn duplicate_deliveries_leave_one_consistent_record() {
        let fixture: Fixture =
            fixture_with(ScriptedInference::replying_in_turn(&["A tabby cat", "A ginger cat"]));
        fixture.queue.send(r#"{"objectKey":"cat.png"}"#);

        // Visibility lapses before the first delivery is acknowledged
        let mut messages: Vec<QueueMessage> = fixture.queue.receive().await.unwrap();
        assert_eq!(1, fixture.queue.redeliver_in_flight());
        messages.extend(fixture.queue.receive().await.unwrap());
        assert_eq!(messages[0].message_id, messages[1].message_id);

        let outcomes: Vec<MessageOutcome> = fixture.consumer.handle_batch(&messages).await;
        let instances: HashSet<InstanceId> = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                MessageOutcome::Acknowledge { instance_id } => Some(instance_id.clone()),
                MessageOutcome::Reject { .. } => None,
            })
            .collect();
        assert_eq!(2, instances.len());

        let mut completed: Vec<InstanceId> = Vec::new();
        for instance_id in &instances {
            let status: InstanceStatus = fixture.consumer.executor().wait(instance_id).await.unwrap();
            if status.state == InstanceState::Completed {
                completed.push(instance_id.clone());
            }
        }

        let record: WorkflowRecord = fixture
            .tracking
            .get(&ObjectKey::parse("cat.png").unwrap())
            .await
            .unwrap()
            .unwrap();

        // The last instance to record itself owns the row and wrote its own analysis
        assert!(completed.contains(&record.instance_id));
        assert!(record.analysis_result.is_some());
        assert_eq!(
            recorded_analysis(&fixture, &record.instance_id).await,
            record.analysis_result
        );
        for other in instances.iter().filter(|id| **id != record.instance_id) {
            assert_ne!(recorded_analysis(&fixture, other).await, record.analysis_result);
        }

        // Only the latest receipt is still valid
        assert!(fixture.queue.ack(&messages[1].receipt).await.is_ok());
        assert!(matches!(
            fixture.queue.ack(&messages[0].receipt).await,
            Err(QueueError::UnknownReceipt(_))
        ));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let fixture: Fixture = fixture();
        fixture.queue.send(r#"{"objectKey":"cat.png"}"#);

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let consumer: QueueConsumer = fixture.consumer.clone();
        let queue: &InMemoryQueue = &fixture.queue;

        let run = consumer.run(queue, async {
            stopped.await.ok();
        });
        let stop_after_ack = async {
            while queue.acked().is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            stop.send(()).ok();
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(run, stop_after_ack);
        })
        .await
        .expect("Consumer should stop");

        assert_eq!(1, fixture.queue.acked().len());
    }
}
