use ::model::Error;
use async_trait::async_trait;
use model::{
    InstanceId, InstanceStatus, Invocation, ObjectKey, StepEntry, StepName, WorkflowRecord,
};
use std::fmt::{Debug, Display, Formatter};

/// Tracking table keyed by object key.
/// Holds the latest instance started for each object and its analysis once done.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Point the record for `object_key` at `instance_id`, clearing any prior analysis.
    /// Inserts the record if it does not exist yet.
    async fn upsert(&self, object_key: &ObjectKey, instance_id: &InstanceId)
    -> Result<(), StateError>;

    /// Write `analysis` to the record only while it still points at `instance_id`.
    ///
    /// Fails with [`StateErrorReason::StaleInstance`] if a newer instance has
    /// claimed the record in the meantime.
    async fn set_analysis(
        &self,
        object_key: &ObjectKey,
        instance_id: &InstanceId,
        analysis: &str,
    ) -> Result<SetAnalysis, StateError>;

    async fn get(&self, object_key: &ObjectKey) -> Result<Option<WorkflowRecord>, StateError>;
}

/// Outcome of a successful [`TrackingStore::set_analysis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetAnalysis {
    Applied,
    // The record was deleted externally, nothing was written
    MissingRecord,
}

/// Durable log of invocations and their completed steps.
///
/// An invocation is the instance itself, written before any step runs.
/// A step entry is the output of one completed step, replayed on resume.
#[async_trait]
pub trait StepLog: Send + Sync {
    async fn put_invocation(&self, invocation: &Invocation) -> Result<(), StateError>;
    async fn get_invocation(&self, instance_id: &InstanceId) -> Result<Invocation, StateError>;
    async fn update_status(
        &self,
        instance_id: &InstanceId,
        status: &InstanceStatus,
    ) -> Result<(), StateError>;
    /// Every invocation not yet in a terminal state.
    async fn unfinished_invocations(&self) -> Result<Vec<Invocation>, StateError>;

    /// Record a completed step. The first write for a given step wins.
    async fn put_step(&self, entry: &StepEntry) -> Result<(), StateError>;
    async fn get_step(
        &self,
        instance_id: &InstanceId,
        step: StepName,
    ) -> Result<Option<StepEntry>, StateError>;
}

/// Errors arising from reading or writing state.
#[derive(Debug)]
pub struct StateError {
    pub state_key: String,

    pub operation: StateOperation,
    pub reason: StateErrorReason,
}

#[derive(Debug)]
pub enum StateErrorReason {
    // An expected state entry was missing.
    MissingEntry,
    // The state was not of the expected shape
    BadState(String),
    // A newer instance owns the record
    StaleInstance { current: InstanceId },
    // An error from the underlying state store
    BackendFailure(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOperation {
    Upsert,
    SetAnalysis,
    GetRecord,
    PutInvocation,
    GetInvocation,
    UpdateStatus,
    ListInvocations,
    PutStep,
    GetStep,
}

impl StateError {
    pub fn new(
        state_key: impl Into<String>,
        operation: StateOperation,
        reason: StateErrorReason,
    ) -> Self {
        StateError {
            state_key: state_key.into(),
            operation,
            reason,
        }
    }

    pub fn backend(
        state_key: impl Into<String>,
        operation: StateOperation,
        err: impl Into<Error>,
    ) -> Self {
        StateError::new(
            state_key,
            operation,
            StateErrorReason::BackendFailure(err.into()),
        )
    }

    /// Whether repeating the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self.reason, StateErrorReason::BackendFailure(_))
    }
}

impl Display for StateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} of '{}' failed: ", self.operation, self.state_key)?;

        match &self.reason {
            StateErrorReason::MissingEntry => f.write_str("no such entry"),
            StateErrorReason::BadState(detail) => write!(f, "unexpected state: {detail}"),
            StateErrorReason::StaleInstance { current } => {
                write!(f, "record now belongs to instance {current}")
            }
            StateErrorReason::BackendFailure(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.reason {
            StateErrorReason::BackendFailure(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backend_failures_are_transient() {
        let backend: StateError =
            StateError::backend("cat.png", StateOperation::Upsert, "connection reset");
        let stale: StateError = StateError::new(
            "cat.png",
            StateOperation::SetAnalysis,
            StateErrorReason::StaleInstance {
                current: InstanceId::from("b"),
            },
        );

        assert!(backend.is_transient());
        assert!(!stale.is_transient());
        assert_eq!(
            "SetAnalysis of 'cat.png' failed: record now belongs to instance b",
            stale.to_string()
        );
    }
}
