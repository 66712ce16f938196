use crate::error::{StepError, StepFailure};
use crate::registry::InstanceRegistry;
use crate::retry::RetryPolicy;
use lambda_runtime::tracing;
use model::{InstanceId, InstanceStatus, ObjectKey, StepEntry, StepName};
use serde::Serialize;
use serde::de::DeserializeOwned;
use state::{StateError, StepLog};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Handle a running instance uses to execute its steps.
///
/// Each step is looked up in the step log first. A recorded output is replayed
/// without running the step again; otherwise the step runs under the retry
/// policy and its output is recorded before the next step may start.
pub struct StepContext {
    instance_id: InstanceId,
    object_key: ObjectKey,
    step_log: Arc<dyn StepLog>,
    registry: Arc<InstanceRegistry>,
    retry: RetryPolicy,
}

impl StepContext {
    pub(crate) fn new(
        instance_id: InstanceId,
        object_key: ObjectKey,
        step_log: Arc<dyn StepLog>,
        registry: Arc<InstanceRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        StepContext {
            instance_id,
            object_key,
            step_log,
            registry,
            retry,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn object_key(&self) -> &ObjectKey {
        &self.object_key
    }

    /// Run `action` as the step `step`, at most once per instance.
    pub async fn step<T, F, Fut>(&self, step: StepName, mut action: F) -> Result<T, StepFailure>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            tracing::debug!(step = step.as_str(), attempts, "Step attempt");

            let error: StepError =
                match tokio::time::timeout(self.retry.timeout, self.attempt(step, &mut action))
                    .await
                {
                    Ok(Ok(output)) => return Ok(output),
                    Ok(Err(error)) => error,
                    Err(_) => StepError::Transient(format!(
                        "attempt timed out after {}",
                        format_duration(self.retry.timeout)
                    )),
                };

            if !error.is_transient() || !self.retry.has_attempts_left(attempts) {
                return Err(StepFailure {
                    step,
                    attempts,
                    error,
                });
            }

            let delay: Duration = self.retry.delay_for(attempts);
            tracing::warn!(
                "Step {step} attempt {attempts} failed, retrying in {}: {error}",
                format_duration(delay)
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt<T, F, Fut>(&self, step: StepName, action: &mut F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        if let Some(entry) = self.step_log.get_step(&self.instance_id, step).await? {
            tracing::debug!("Replaying recorded output of step {step}");

            return serde_json::from_value(entry.output).map_err(|err| {
                StepError::Fatal(format!("recorded output of step {step} is unreadable: {err}"))
            });
        }

        self.transition(InstanceStatus::new(step.state())).await;
        let output: T = action().await?;

        let recorded: serde_json::Value = serde_json::to_value(&output).map_err(|err| {
            StepError::Fatal(format!("output of step {step} cannot be recorded: {err}"))
        })?;
        // Must be durable before the next step begins
        self.step_log
            .put_step(&StepEntry::new(self.instance_id.clone(), step, recorded))
            .await?;

        Ok(output)
    }

    /// Move the instance to `status`: persisted first, then published.
    ///
    /// A failed intermediate write is only logged, the step log stays
    /// authoritative for replay. Terminal writes are retried under the retry
    /// policy, and one that still fails is held by the registry instead.
    pub(crate) async fn transition(&self, status: InstanceStatus) {
        if status.is_terminal() {
            let persisted: bool = self.persist_terminal(&status).await;
            self.registry.finish(&self.instance_id, status, persisted);
            return;
        }

        if let Err(err) = self.step_log.update_status(&self.instance_id, &status).await {
            tracing::warn!("Could not persist {} for instance: {err}", status.state);
        }
        self.registry.publish(&self.instance_id, status);
    }

    async fn persist_terminal(&self, status: &InstanceStatus) -> bool {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;

            let err: StateError = match self.step_log.update_status(&self.instance_id, status).await {
                Ok(()) => return true,
                Err(err) => err,
            };

            if !err.is_transient() || !self.retry.has_attempts_left(attempts) {
                tracing::error!(
                    "Could not persist {} after {attempts} attempt(s): {err}",
                    status.state
                );
                return false;
            }

            let delay: Duration = self.retry.delay_for(attempts);
            tracing::warn!(
                "Persisting {} failed, retrying in {}: {err}",
                status.state,
                format_duration(delay)
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{InstanceState, Invocation};
    use state_in_memory::InMemoryStepLog;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn context(step_log: Arc<InMemoryStepLog>, retry: RetryPolicy) -> StepContext {
        let instance_id: InstanceId = InstanceId::from("instance");
        let object_key: ObjectKey = ObjectKey::parse("cat.png").unwrap();
        step_log
            .put_invocation(&Invocation::new(instance_id.clone(), object_key.clone()))
            .await
            .unwrap();

        StepContext::new(
            instance_id,
            object_key,
            step_log,
            Arc::new(InstanceRegistry::default()),
            retry,
        )
    }

    #[tokio::test]
    async fn completed_step_is_replayed_not_rerun() {
        let step_log: Arc<InMemoryStepLog> = Arc::new(InMemoryStepLog::default());
        let ctx: StepContext = context(step_log.clone(), RetryPolicy::fast(3)).await;
        let counter: AtomicU32 = AtomicU32::new(0);
        let calls: &AtomicU32 = &counter;

        for _ in 0..2 {
            let output: String = ctx
                .step(StepName::RunInference, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("A photo of a cat".to_string())
                })
                .await
                .unwrap();

            assert_eq!("A photo of a cat", output);
        }

        assert_eq!(1, counter.load(Ordering::SeqCst));
        assert_eq!(vec![StepName::RunInference], step_log.completed_steps(ctx.instance_id()));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_budget() {
        let step_log: Arc<InMemoryStepLog> = Arc::new(InMemoryStepLog::default());
        let ctx: StepContext = context(step_log, RetryPolicy::fast(3)).await;
        let counter: AtomicU32 = AtomicU32::new(0);
        let calls: &AtomicU32 = &counter;

        let output: u32 = ctx
            .step(StepName::FetchObject, move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(StepError::Transient("flaky".to_string())),
                    call => Ok(call),
                }
            })
            .await
            .unwrap();

        assert_eq!(2, output);
    }

    #[tokio::test]
    async fn exhausting_the_budget_reports_attempts() {
        let step_log: Arc<InMemoryStepLog> = Arc::new(InMemoryStepLog::default());
        let ctx: StepContext = context(step_log.clone(), RetryPolicy::fast(3)).await;

        let failure: StepFailure = ctx
            .step(StepName::RunInference, || async {
                Err::<String, _>(StepError::Transient("throttled".to_string()))
            })
            .await
            .unwrap_err();

        assert_eq!(StepName::RunInference, failure.step);
        assert_eq!(3, failure.attempts);
        assert!(step_log.completed_steps(ctx.instance_id()).is_empty());
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let step_log: Arc<InMemoryStepLog> = Arc::new(InMemoryStepLog::default());
        let ctx: StepContext = context(step_log, RetryPolicy::fast(6)).await;
        let counter: AtomicU32 = AtomicU32::new(0);
        let calls: &AtomicU32 = &counter;

        let failure: StepFailure = ctx
            .step(StepName::FetchObject, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Vec<u8>, _>(StepError::Fatal("object 'cat.png' not found".to_string()))
            })
            .await
            .unwrap_err();

        assert_eq!(1, failure.attempts);
        assert_eq!(1, counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn slow_attempts_time_out_as_transient() {
        let step_log: Arc<InMemoryStepLog> = Arc::new(InMemoryStepLog::default());
        let mut retry: RetryPolicy = RetryPolicy::fast(2);
        retry.timeout = Duration::from_millis(20);
        let ctx: StepContext = context(step_log, retry).await;

        let failure: StepFailure = ctx
            .step(StepName::RunInference, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("too late".to_string())
            })
            .await
            .unwrap_err();

        assert_eq!(2, failure.attempts);
        assert!(failure.error.is_transient());
    }

    #[tokio::test]
    async fn transitions_are_persisted() {
        let step_log: Arc<InMemoryStepLog> = Arc::new(InMemoryStepLog::default());
        let ctx: StepContext = context(step_log.clone(), RetryPolicy::fast(1)).await;

        ctx.step(StepName::FetchObject, || async { Ok(()) })
            .await
            .unwrap();

        let invocation: Invocation = step_log.get_invocation(ctx.instance_id()).await.unwrap();
        assert_eq!(InstanceState::FetchingObject, invocation.status.state);
    }
}
