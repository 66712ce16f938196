use crate::config::InferenceSettings;
use crate::context::StepContext;
use crate::error::EngineError;
use crate::pipeline::{Services, analyse_upload};
use crate::registry::InstanceRegistry;
use crate::retry::RetryPolicy;
use lambda_runtime::tracing;
use lambda_runtime::tracing::{Instrument, Span};
use model::{InstanceId, InstanceState, InstanceStatus, Invocation, ObjectKey};
use state::{StateError, StateErrorReason, StepLog};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Runs upload analysis instances on the tokio runtime.
///
/// Cloned handles share one registry, so an instance started through one
/// clone can be queried or awaited through another.
#[derive(Clone)]
pub struct WorkflowExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    step_log: Arc<dyn StepLog>,
    services: Services,
    retry: RetryPolicy,
    inference: InferenceSettings,
    registry: Arc<InstanceRegistry>,
}

impl WorkflowExecutor {
    pub fn new(
        step_log: Arc<dyn StepLog>,
        services: Services,
        retry: RetryPolicy,
        inference: InferenceSettings,
    ) -> Self {
        WorkflowExecutor {
            inner: Arc::new(ExecutorInner {
                step_log,
                services,
                retry,
                inference,
                registry: Arc::new(InstanceRegistry::default()),
            }),
        }
    }

    /// Start a new instance for `object_key` and return without waiting for it.
    ///
    /// Nothing runs unless the invocation was durably recorded first.
    pub async fn create(&self, object_key: ObjectKey) -> Result<InstanceId, EngineError> {
        let invocation: Invocation = Invocation::new(InstanceId::generate(), object_key);

        self.inner
            .step_log
            .put_invocation(&invocation)
            .await
            .map_err(EngineError::Unavailable)?;

        tracing::info!(
            "Created workflow {} for {}",
            invocation.instance_id,
            invocation.object_key
        );

        let instance_id: InstanceId = invocation.instance_id.clone();
        self.launch(invocation);

        Ok(instance_id)
    }

    /// Current state of an instance. Never blocks on the instance itself.
    pub async fn status(&self, instance_id: &InstanceId) -> Result<InstanceStatus, EngineError> {
        if let Some(status) = self.inner.registry.status(instance_id) {
            return Ok(status);
        }

        let invocation: Invocation = self.invocation(instance_id).await?;
        Ok(invocation.status)
    }

    /// Continue an instance from its step log, replaying completed steps.
    pub async fn resume(&self, instance_id: &InstanceId) -> Result<InstanceStatus, EngineError> {
        if let Some(status) = self.inner.registry.status(instance_id) {
            tracing::debug!("Workflow {instance_id} is already running");
            return Ok(status);
        }

        let invocation: Invocation = self.invocation(instance_id).await?;
        let status: InstanceStatus = invocation.status.clone();

        if !status.is_terminal() {
            tracing::info!("Resuming workflow {instance_id} from {}", status.state);
            self.launch(invocation);
        }

        Ok(status)
    }

    /// Resume every instance the step log shows as unfinished.
    ///
    /// Terminal statuses the step log refused earlier are written first, and
    /// their instances are never resumed.
    pub async fn recover(&self) -> Result<Vec<InstanceId>, EngineError> {
        self.persist_finished().await;

        let unfinished: Vec<Invocation> = self
            .inner
            .step_log
            .unfinished_invocations()
            .await
            .map_err(EngineError::Unavailable)?;

        let mut resumed: Vec<InstanceId> = Vec::with_capacity(unfinished.len());
        for invocation in unfinished {
            let instance_id: InstanceId = invocation.instance_id.clone();

            if self.launch(invocation) {
                resumed.push(instance_id);
            }
        }

        tracing::info!("Recovered [{}] unfinished workflows", resumed.len());
        Ok(resumed)
    }

    /// Wait for an instance running in this executor to finish.
    ///
    /// For instances not running here this is the same as `status`.
    pub async fn wait(&self, instance_id: &InstanceId) -> Result<InstanceStatus, EngineError> {
        if let Some(mut receiver) = self.inner.registry.subscribe(instance_id) {
            let finished: Option<InstanceStatus> = receiver
                .wait_for(InstanceStatus::is_terminal)
                .await
                .map(|status| status.clone())
                .ok();

            if let Some(status) = finished {
                return Ok(status);
            }
        }

        self.status(instance_id).await
    }

    /// Abort every instance running in this executor. Their step logs are kept,
    /// so they can be resumed later.
    pub fn shutdown(&self) -> usize {
        let aborted: usize = self.inner.registry.abort_all();

        if aborted > 0 {
            tracing::warn!("Aborted [{aborted}] running workflows");
        }

        aborted
    }

    /// Number of instances currently running in this executor.
    pub fn running(&self) -> usize {
        self.inner.registry.len()
    }

    async fn persist_finished(&self) {
        for (instance_id, status) in self.inner.registry.unpersisted() {
            match self
                .inner
                .step_log
                .update_status(&instance_id, &status)
                .await
            {
                Ok(()) => self.inner.registry.persisted(&instance_id),
                Err(err) => tracing::warn!(
                    "Workflow {instance_id} is still {} only in memory: {err}",
                    status.state
                ),
            }
        }
    }

    async fn invocation(&self, instance_id: &InstanceId) -> Result<Invocation, EngineError> {
        self.inner
            .step_log
            .get_invocation(instance_id)
            .await
            .map_err(|err: StateError| match err.reason {
                StateErrorReason::MissingEntry => {
                    EngineError::UnknownInstance(instance_id.clone())
                }
                _ => EngineError::Unavailable(err),
            })
    }

    /// Spawn `invocation` unless it is already running here.
    fn launch(&self, invocation: Invocation) -> bool {
        let instance_id: InstanceId = invocation.instance_id.clone();

        if !self
            .inner
            .registry
            .try_register(&instance_id, invocation.status.clone())
        {
            return false;
        }

        let workflow_span: Span = tracing::span!(
            tracing::Level::INFO,
            "Workflow",
            instance_id = instance_id.as_str(),
            object_key = invocation.object_key.as_str()
        );

        let task: JoinHandle<()> = tokio::spawn(
            execute(self.inner.clone(), invocation.instance_id, invocation.object_key)
                .instrument(workflow_span),
        );
        self.inner.registry.attach(&instance_id, task.abort_handle());

        true
    }
}

async fn execute(inner: Arc<ExecutorInner>, instance_id: InstanceId, object_key: ObjectKey) {
    let ctx: StepContext = StepContext::new(
        instance_id,
        object_key,
        inner.step_log.clone(),
        inner.registry.clone(),
        inner.retry.clone(),
    );

    match analyse_upload(&ctx, &inner.services, &inner.inference).await {
        Ok(analysis) => {
            tracing::info!("Workflow completed with [{}] chars of analysis", analysis.len());
            ctx.transition(InstanceStatus::new(InstanceState::Completed))
                .await;
        }
        Err(failure) => {
            tracing::error!("Workflow failed: {failure}");
            ctx.transition(InstanceStatus::failed(failure.to_string()))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{StepName, WorkflowRecord};
    use service::ServiceError;
    use state::TrackingStore;
    use state_in_memory::{InMemoryStepLog, InMemoryTrackingStore};
    use std::time::Duration;
    use test_utils::{CountingFetcher, ScriptedInference, SwitchableStepLog};

    const CAT: &[u8] = b"\x89PNG\r\n\x1a\ncat";

    struct Harness {
        step_log: Arc<InMemoryStepLog>,
        tracking: Arc<InMemoryTrackingStore>,
        fetcher: Arc<CountingFetcher>,
        inference: Arc<ScriptedInference>,
    }

    impl Harness {
        fn new(inference: ScriptedInference) -> Self {
            Harness {
                step_log: Arc::new(InMemoryStepLog::default()),
                tracking: Arc::new(InMemoryTrackingStore::default()),
                fetcher: Arc::new(CountingFetcher::default().with_object("cat.png", CAT)),
                inference: Arc::new(inference),
            }
        }

        fn executor(&self, retry: RetryPolicy) -> WorkflowExecutor {
            WorkflowExecutor::new(
                self.step_log.clone(),
                Services {
                    tracking: self.tracking.clone(),
                    fetcher: self.fetcher.clone(),
                    inference: self.inference.clone(),
                },
                retry,
                InferenceSettings::default(),
            )
        }

        async fn record(&self, key: &str) -> WorkflowRecord {
            self.tracking
                .get(&ObjectKey::parse(key).unwrap())
                .await
                .unwrap()
                .expect("Record should exist")
        }
    }

    fn key(value: &str) -> ObjectKey {
        ObjectKey::parse(value).unwrap()
    }

    async fn inference_started(inference: &ScriptedInference) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while inference.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("Inference should have been called");
    }

    #[tokio::test]
    async fn upload_is_analysed_end_to_end() {
        let harness: Harness = Harness::new(ScriptedInference::replying("A photo of a cat"));
        let executor: WorkflowExecutor = harness.executor(RetryPolicy::fast(3));

        let instance_id: InstanceId = executor.create(key("cat.png")).await.unwrap();
        let status: InstanceStatus = executor.wait(&instance_id).await.unwrap();

        assert_eq!(InstanceStatus::new(InstanceState::Completed), status);
        assert_eq!(status, executor.status(&instance_id).await.unwrap());

        let record: WorkflowRecord = harness.record("cat.png").await;
        assert_eq!(instance_id, record.instance_id);
        assert_eq!(Some("A photo of a cat".to_string()), record.analysis_result);

        assert_eq!(
            vec![
                StepName::RecordInstance,
                StepName::FetchObject,
                StepName::RunInference,
                StepName::PersistResult
            ],
            harness.step_log.completed_steps(&instance_id)
        );
        assert_eq!(
            Some((CAT.len(), "Provide a description of this image".to_string(), 512)),
            harness.inference.last_request()
        );
        assert_eq!(0, executor.running());
    }

    #[tokio::test]
    async fn missing_object_fails_without_retrying() {
        let harness: Harness = Harness::new(ScriptedInference::replying("unused"));
        let executor: WorkflowExecutor = harness.executor(RetryPolicy::fast(6));

        let instance_id: InstanceId = executor.create(key("dog.png")).await.unwrap();
        let status: InstanceStatus = executor.wait(&instance_id).await.unwrap();

        assert_eq!(InstanceState::Failed, status.state);
        assert!(status.error.unwrap().contains("fetchObject"));
        assert_eq!(1, harness.fetcher.calls());
        assert_eq!(0, harness.inference.calls());
    }

    #[tokio::test]
    async fn inference_recovers_within_retry_budget() {
        let inference: ScriptedInference = ScriptedInference::replying("A photo of a cat")
            .with_failures((0..5).map(|_| ServiceError::Transient("throttled".to_string())));
        let harness: Harness = Harness::new(inference);
        let executor: WorkflowExecutor = harness.executor(RetryPolicy::fast(6));

        let instance_id: InstanceId = executor.create(key("cat.png")).await.unwrap();
        let status: InstanceStatus = executor.wait(&instance_id).await.unwrap();

        assert_eq!(InstanceState::Completed, status.state);
        assert_eq!(6, harness.inference.calls());
        assert_eq!(
            Some("A photo of a cat".to_string()),
            harness.record("cat.png").await.analysis_result
        );
    }

    #[tokio::test]
    async fn exhausted_budget_fails_instance_and_stops() {
        let inference: ScriptedInference = ScriptedInference::replying("too late")
            .with_failures((0..3).map(|_| ServiceError::Transient("throttled".to_string())));
        let harness: Harness = Harness::new(inference);
        let executor: WorkflowExecutor = harness.executor(RetryPolicy::fast(3));

        let instance_id: InstanceId = executor.create(key("cat.png")).await.unwrap();
        let status: InstanceStatus = executor.wait(&instance_id).await.unwrap();

        assert_eq!(
            InstanceStatus::failed(
                "step runInference failed after 3 attempt(s): transient service failure: throttled"
            ),
            status
        );
        assert_eq!(None, harness.record("cat.png").await.analysis_result);
        assert!(
            !harness
                .step_log
                .completed_steps(&instance_id)
                .contains(&StepName::PersistResult)
        );
    }

    #[tokio::test]
    async fn resumed_instance_does_not_fetch_again() {
        let harness: Harness = Harness::new(ScriptedInference::never_replying());
        let crashed: WorkflowExecutor = harness.executor(RetryPolicy::fast(3));

        let instance_id: InstanceId = crashed.create(key("cat.png")).await.unwrap();
        inference_started(&harness.inference).await;
        assert_eq!(1, crashed.shutdown());

        // A fresh executor over the same durable state
        let harness: Harness = Harness {
            inference: Arc::new(ScriptedInference::replying("A photo of a cat")),
            ..harness
        };
        let restarted: WorkflowExecutor = harness.executor(RetryPolicy::fast(3));

        let status: InstanceStatus = restarted.resume(&instance_id).await.unwrap();
        assert_eq!(InstanceState::RunningInference, status.state);

        let status: InstanceStatus = restarted.wait(&instance_id).await.unwrap();
        assert_eq!(InstanceState::Completed, status.state);
        assert_eq!(1, harness.fetcher.calls());
        assert_eq!(
            Some("A photo of a cat".to_string()),
            harness.record("cat.png").await.analysis_result
        );
    }

    #[tokio::test]
    async fn recover_resumes_only_unfinished_instances() {
        let harness: Harness = Harness::new(ScriptedInference::replying("A photo of a cat"));
        let executor: WorkflowExecutor = harness.executor(RetryPolicy::fast(3));

        let finished: InstanceId = executor.create(key("cat.png")).await.unwrap();
        executor.wait(&finished).await.unwrap();

        let interrupted: Invocation = Invocation::new(InstanceId::from("interrupted"), key("cat.png"));
        harness.step_log.put_invocation(&interrupted).await.unwrap();

        let resumed: Vec<InstanceId> = executor.recover().await.unwrap();
        assert_eq!(vec![interrupted.instance_id.clone()], resumed);

        let status: InstanceStatus = executor.wait(&interrupted.instance_id).await.unwrap();
        assert_eq!(InstanceState::Completed, status.state);
        assert_eq!(interrupted.instance_id, harness.record("cat.png").await.instance_id);
    }

    #[tokio::test]
    async fn resuming_a_finished_instance_runs_nothing() {
        let harness: Harness = Harness::new(ScriptedInference::replying("A photo of a cat"));
        let executor: WorkflowExecutor = harness.executor(RetryPolicy::fast(3));

        let instance_id: InstanceId = executor.create(key("cat.png")).await.unwrap();
        executor.wait(&instance_id).await.unwrap();

        let status: InstanceStatus = executor.resume(&instance_id).await.unwrap();
        assert_eq!(InstanceState::Completed, status.state);
        assert_eq!(0, executor.running());
        assert_eq!(1, harness.inference.calls());
    }

    #[tokio::test]
    async fn unknown_instances_are_reported() {
        let harness: Harness = Harness::new(ScriptedInference::replying("unused"));
        let executor: WorkflowExecutor = harness.executor(RetryPolicy::fast(3));

        let result: Result<InstanceStatus, EngineError> =
            executor.status(&InstanceId::from("missing")).await;

        assert!(matches!(result, Err(EngineError::UnknownInstance(_))));
    }

    #[tokio::test]
    async fn create_fails_when_step_log_is_unreachable() {
        let harness: Harness = Harness::new(ScriptedInference::replying("unused"));
        let step_log: Arc<SwitchableStepLog> = Arc::new(SwitchableStepLog::default());
        step_log.set_available(false);

        let executor: WorkflowExecutor = WorkflowExecutor::new(
            step_log,
            Services {
                tracking: harness.tracking.clone(),
                fetcher: harness.fetcher.clone(),
                inference: harness.inference.clone(),
            },
            RetryPolicy::fast(3),
            InferenceSettings::default(),
        );

        let result: Result<InstanceId, EngineError> = executor.create(key("cat.png")).await;

        assert!(matches!(result, Err(EngineError::Unavailable(_))));
        assert_eq!(0, executor.running());
        assert_eq!(0, harness.fetcher.calls());
    }

    #[tokio::test]
    async fn superseded_instance_cannot_store_its_analysis() {
        let harness: Harness = Harness::new(ScriptedInference::never_replying());
        let executor: WorkflowExecutor = harness.executor(RetryPolicy::fast(3));

        let first: InstanceId = executor.create(key("cat.png")).await.unwrap();
        inference_started(&harness.inference).await;
        executor.shutdown();

        // A re-upload takes over the record before the first instance persists
        let second: InstanceId = InstanceId::from("second");
        harness.tracking.upsert(&key("cat.png"), &second).await.unwrap();

        let harness: Harness = Harness {
            inference: Arc::new(ScriptedInference::replying("stale analysis")),
            ..harness
        };
        let restarted: WorkflowExecutor = harness.executor(RetryPolicy::fast(3));
        restarted.resume(&first).await.unwrap();
        let status: InstanceStatus = restarted.wait(&first).await.unwrap();

        assert_eq!(InstanceState::Failed, status.state);
        assert!(status.error.unwrap().contains("persistResult"));

        let record: WorkflowRecord = harness.record("cat.png").await;
        assert_eq!(second, record.instance_id);
        assert_eq!(None, record.analysis_result);
    }

    #[tokio::test]
    async fn analysis_for_a_deleted_record_is_dropped() {
        let harness: Harness = Harness::new(ScriptedInference::never_replying());
        let crashed: WorkflowExecutor = harness.executor(RetryPolicy::fast(3));

        let instance_id: InstanceId = crashed.create(key("cat.png")).await.unwrap();
        inference_started(&harness.inference).await;
        crashed.shutdown();

        // The record is cleared out while inference is outstanding
        assert!(harness.tracking.remove(&key("cat.png")).is_some());

        let harness: Harness = Harness {
            inference: Arc::new(ScriptedInference::replying("A photo of a cat")),
            ..harness
        };
        let restarted: WorkflowExecutor = harness.executor(RetryPolicy::fast(3));
        restarted.resume(&instance_id).await.unwrap();
        let status: InstanceStatus = restarted.wait(&instance_id).await.unwrap();

        assert_eq!(InstanceStatus::new(InstanceState::Completed), status);
        assert_eq!(None, harness.tracking.get(&key("cat.png")).await.unwrap());
        assert!(
            harness
                .step_log
                .completed_steps(&instance_id)
                .contains(&StepName::PersistResult)
        );
    }

    #[tokio::test]
    async fn refused_terminal_write_stays_observable() {
        let harness: Harness = Harness::new(ScriptedInference::replying("A photo of a cat"));
        let step_log: Arc<SwitchableStepLog> = Arc::new(SwitchableStepLog::default());
        step_log.set_terminal_writes_available(false);

        let executor: WorkflowExecutor = WorkflowExecutor::new(
            step_log.clone(),
            Services {
                tracking: harness.tracking.clone(),
                fetcher: harness.fetcher.clone(),
                inference: harness.inference.clone(),
            },
            RetryPolicy::fast(3),
            InferenceSettings::default(),
        );

        let instance_id: InstanceId = executor.create(key("cat.png")).await.unwrap();
        let status: InstanceStatus = executor.wait(&instance_id).await.unwrap();
        assert_eq!(InstanceStatus::new(InstanceState::Completed), status);

        // Only the last intermediate state reached the step log
        let durable: Invocation = step_log.inner().get_invocation(&instance_id).await.unwrap();
        assert_eq!(InstanceState::PersistingResult, durable.status.state);
        assert_eq!(status, executor.status(&instance_id).await.unwrap());
        assert_eq!(status, executor.resume(&instance_id).await.unwrap());
        assert_eq!(0, executor.running());

        assert!(executor.recover().await.unwrap().is_empty());
        assert_eq!(1, harness.inference.calls());

        step_log.set_terminal_writes_available(true);
        assert!(executor.recover().await.unwrap().is_empty());

        let durable: Invocation = step_log.inner().get_invocation(&instance_id).await.unwrap();
        assert_eq!(InstanceState::Completed, durable.status.state);
        assert_eq!(status, executor.status(&instance_id).await.unwrap());
    }
}
