use model::{EventError, InstanceId, StepName};
use service::ServiceError;
use state::StateError;
use thiserror::Error;

/// Outcome of a single failed step attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

impl StepError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }
}

impl From<ServiceError> for StepError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Transient(_) => StepError::Transient(err.to_string()),
            ServiceError::NotFound(_) | ServiceError::Rejected(_) => {
                StepError::Fatal(err.to_string())
            }
        }
    }
}

impl From<StateError> for StepError {
    fn from(err: StateError) -> Self {
        if err.is_transient() {
            StepError::Transient(err.to_string())
        } else {
            StepError::Fatal(err.to_string())
        }
    }
}

/// A step that failed fatally or ran out of attempts. Ends the instance.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("step {step} failed after {attempts} attempt(s): {error}")]
pub struct StepFailure {
    pub step: StepName,
    pub attempts: u32,
    pub error: StepError,
}

#[derive(Debug, Error)]
pub enum EngineError {
    // The step log could not be reached
    #[error("workflow engine unavailable: {0}")]
    Unavailable(#[source] StateError),
    #[error("unknown workflow instance {0}")]
    UnknownInstance(InstanceId),
}

/// Why a queue message was left unacknowledged.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("poison message: {0}")]
    PoisonMessage(#[from] EventError),
    #[error("could not start workflow: {0}")]
    CreateFailed(#[from] EngineError),
}
