use async_trait::async_trait;
use aws_lambda_events::sqs::SqsMessage;
use model::env::{
    STEP_LOG_TABLE_NAME, STEP_PAYLOAD_BUCKET_NAME, TRACKING_TABLE_NAME, UPLOAD_BUCKET_NAME,
};
use model::{InstanceId, InstanceStatus, Invocation, ObjectKey, StepEntry, StepName};
use queue::{QueueError, QueueMessage, QueueSource};
use service::{InferenceClient, InferenceRequest, ObjectFetcher, ServiceError};
use state::{StateError, StateOperation, StepLog};
use state_in_memory::InMemoryStepLog;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Create a dummy SQS message with an id and a raw body
pub fn sqs_message_with_body(message_id: &str, body: &str) -> SqsMessage {
    let mut message: SqsMessage = SqsMessage::default();
    message.message_id = Some(message_id.to_string());
    message.receipt_handle = Some(format!("receipt-{message_id}"));
    message.body = Some(body.to_string());

    message
}

/// Values for every required pipeline variable
pub const TEST_UPLOAD_BUCKET: &str = "uploads";
pub const TEST_TRACKING_TABLE: &str = "tracking";
pub const TEST_STEP_LOG_TABLE: &str = "step-log";
pub const TEST_STEP_PAYLOAD_BUCKET: &str = "step-payloads";

/// Environment lookup over the required variables plus `overrides`.
pub fn env_lookup(overrides: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
    let mut vars: HashMap<String, String> = [
        (UPLOAD_BUCKET_NAME, TEST_UPLOAD_BUCKET),
        (TRACKING_TABLE_NAME, TEST_TRACKING_TABLE),
        (STEP_LOG_TABLE_NAME, TEST_STEP_LOG_TABLE),
        (STEP_PAYLOAD_BUCKET_NAME, TEST_STEP_PAYLOAD_BUCKET),
    ]
    .into_iter()
    .chain(overrides.iter().copied())
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect();
    vars.retain(|_, value| !value.is_empty());

    move |name: &str| vars.get(name).cloned()
}

/// At-least-once queue held in memory.
///
/// Received messages stay in flight until acked or nacked. `redeliver_in_flight`
/// plays the part of a lapsed visibility timeout: every in-flight message
/// becomes visible again and its old receipt stops working.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    visible: VecDeque<QueueMessage>,
    in_flight: HashMap<String, QueueMessage>,
    acked: Vec<String>,
    sent: usize,
    receipts: usize,
}

impl InMemoryQueue {
    const BATCH_SIZE: usize = 10;
    // Stands in for long polling on an empty queue
    const EMPTY_WAIT: Duration = Duration::from_millis(5);

    /// Enqueue a body, returning the new message id.
    pub fn send(&self, body: &str) -> String {
        let mut state: MutexGuard<QueueState> = self.state();
        state.sent += 1;

        let message_id: String = format!("message-{}", state.sent);
        state.visible.push_back(QueueMessage {
            message_id: message_id.clone(),
            receipt: String::new(),
            body: Some(body.to_string()),
        });

        message_id
    }

    /// Make every in-flight message visible again. Returns how many.
    pub fn redeliver_in_flight(&self) -> usize {
        let mut state: MutexGuard<QueueState> = self.state();
        let lapsed: Vec<QueueMessage> = state.in_flight.drain().map(|(_, message)| message).collect();
        let count: usize = lapsed.len();
        state.visible.extend(lapsed);

        count
    }

    /// Ids of acknowledged messages, in ack order.
    pub fn acked(&self) -> Vec<String> {
        self.state().acked.clone()
    }

    /// Ids of messages waiting to be received.
    pub fn visible_ids(&self) -> Vec<String> {
        self.state()
            .visible
            .iter()
            .map(|message| message.message_id.clone())
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("Queue lock should not be poisoned")
    }

    fn take_batch(&self) -> Vec<QueueMessage> {
        let mut state: MutexGuard<QueueState> = self.state();
        let count: usize = state.visible.len().min(Self::BATCH_SIZE);

        let taken: Vec<QueueMessage> = state.visible.drain(..count).collect();
        let mut batch: Vec<QueueMessage> = Vec::with_capacity(count);
        for mut message in taken {
            state.receipts += 1;
            message.receipt = format!("receipt-{}", state.receipts);
            state.in_flight.insert(message.receipt.clone(), message.clone());
            batch.push(message);
        }

        batch
    }
}

#[async_trait]
impl QueueSource for InMemoryQueue {
    async fn receive(&self) -> Result<Vec<QueueMessage>, QueueError> {
        let batch: Vec<QueueMessage> = self.take_batch();
        if batch.is_empty() {
            tokio::time::sleep(Self::EMPTY_WAIT).await;
        }

        Ok(batch)
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        let mut state: MutexGuard<QueueState> = self.state();
        let message: QueueMessage = state
            .in_flight
            .remove(receipt)
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))?;
        state.acked.push(message.message_id);

        Ok(())
    }

    async fn nack(&self, receipt: &str) -> Result<(), QueueError> {
        let mut state: MutexGuard<QueueState> = self.state();
        let message: QueueMessage = state
            .in_flight
            .remove(receipt)
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))?;
        state.visible.push_back(message);

        Ok(())
    }
}

/// Object fetcher over a fixed set of objects that counts every call.
#[derive(Default)]
pub struct CountingFetcher {
    objects: HashMap<String, Vec<u8>>,
    calls: AtomicUsize,
}

impl CountingFetcher {
    pub fn with_object(mut self, key: &str, bytes: &[u8]) -> Self {
        self.objects.insert(key.to_string(), bytes.to_vec());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectFetcher for CountingFetcher {
    async fn fetch(&self, object_key: &ObjectKey) -> Result<Vec<u8>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        self.objects
            .get(object_key.as_str())
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(object_key.to_string()))
    }
}

/// Inference client that plays back scripted failures before a fixed reply.
pub struct ScriptedInference {
    failures: Mutex<VecDeque<ServiceError>>,
    turns: Mutex<VecDeque<String>>,
    reply: Option<String>,
    calls: AtomicUsize,
    last_request: Mutex<Option<(usize, String, u32)>>,
}

impl ScriptedInference {
    /// Always answers with `reply`.
    pub fn replying(reply: &str) -> Self {
        ScriptedInference {
            failures: Mutex::default(),
            turns: Mutex::default(),
            reply: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
            last_request: Mutex::default(),
        }
    }

    /// Answers with each of `replies` in turn, then keeps repeating the last.
    pub fn replying_in_turn(replies: &[&str]) -> Self {
        let inference: ScriptedInference =
            ScriptedInference::replying(replies.last().copied().unwrap_or_default());
        inference
            .turns
            .lock()
            .expect("Script lock should not be poisoned")
            .extend(replies.iter().map(|reply| reply.to_string()));

        inference
    }

    /// Never answers. Calls hang until the caller gives up.
    pub fn never_replying() -> Self {
        ScriptedInference {
            reply: None,
            ..ScriptedInference::replying("")
        }
    }

    /// Fail with each of `failures`, in order, before replying.
    pub fn with_failures(self, failures: impl IntoIterator<Item = ServiceError>) -> Self {
        self.failures
            .lock()
            .expect("Script lock should not be poisoned")
            .extend(failures);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Image size, prompt and token bound of the latest call.
    pub fn last_request(&self) -> Option<(usize, String, u32)> {
        self.last_request
            .lock()
            .expect("Request lock should not be poisoned")
            .clone()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn infer(&self, request: InferenceRequest<'_>) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .last_request
            .lock()
            .expect("Request lock should not be poisoned") =
            Some((request.image.len(), request.prompt.to_string(), request.max_tokens));

        let failure: Option<ServiceError> = self
            .failures
            .lock()
            .expect("Script lock should not be poisoned")
            .pop_front();
        if let Some(failure) = failure {
            return Err(failure);
        }

        let turn: Option<String> = self
            .turns
            .lock()
            .expect("Script lock should not be poisoned")
            .pop_front();
        if let Some(reply) = turn {
            return Ok(reply);
        }

        match &self.reply {
            Some(reply) => Ok(reply.clone()),
            None => std::future::pending().await,
        }
    }
}

/// In-memory step log that can be switched off to simulate an outage.
pub struct SwitchableStepLog {
    inner: InMemoryStepLog,
    available: AtomicBool,
    terminal_writes: AtomicBool,
}

impl Default for SwitchableStepLog {
    fn default() -> Self {
        SwitchableStepLog {
            inner: InMemoryStepLog::default(),
            available: AtomicBool::new(true),
            terminal_writes: AtomicBool::new(true),
        }
    }
}

impl SwitchableStepLog {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Refuse only status updates to `Completed` or `Failed`.
    pub fn set_terminal_writes_available(&self, available: bool) {
        self.terminal_writes.store(available, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryStepLog {
        &self.inner
    }

    fn check(&self, key: &str, operation: StateOperation) -> Result<(), StateError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StateError::backend(key, operation, "step log unreachable"))
        }
    }
}

#[async_trait]
impl StepLog for SwitchableStepLog {
    async fn put_invocation(&self, invocation: &Invocation) -> Result<(), StateError> {
        self.check(invocation.instance_id.as_str(), StateOperation::PutInvocation)?;
        self.inner.put_invocation(invocation).await
    }

    async fn get_invocation(&self, instance_id: &InstanceId) -> Result<Invocation, StateError> {
        self.check(instance_id.as_str(), StateOperation::GetInvocation)?;
        self.inner.get_invocation(instance_id).await
    }

    async fn update_status(
        &self,
        instance_id: &InstanceId,
        status: &InstanceStatus,
    ) -> Result<(), StateError> {
        self.check(instance_id.as_str(), StateOperation::UpdateStatus)?;
        if status.is_terminal() && !self.terminal_writes.load(Ordering::SeqCst) {
            return Err(StateError::backend(
                instance_id.as_str(),
                StateOperation::UpdateStatus,
                "terminal write refused",
            ));
        }
        self.inner.update_status(instance_id, status).await
    }

    async fn unfinished_invocations(&self) -> Result<Vec<Invocation>, StateError> {
        self.check("*", StateOperation::ListInvocations)?;
        self.inner.unfinished_invocations().await
    }

    async fn put_step(&self, entry: &StepEntry) -> Result<(), StateError> {
        self.check(entry.instance_id.as_str(), StateOperation::PutStep)?;
        self.inner.put_step(entry).await
    }

    async fn get_step(
        &self,
        instance_id: &InstanceId,
        step: StepName,
    ) -> Result<Option<StepEntry>, StateError> {
        self.check(instance_id.as_str(), StateOperation::GetStep)?;
        self.inner.get_step(instance_id, step).await
    }
}
