use crate::ObjectKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Opaque identifier of one workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn generate() -> Self {
        InstanceId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        InstanceId(value)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        InstanceId(value.to_string())
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of an instance. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Created,
    RecordingInstance,
    FetchingObject,
    RunningInference,
    PersistingResult,
    Completed,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Completed | InstanceState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Created => "Created",
            InstanceState::RecordingInstance => "RecordingInstance",
            InstanceState::FetchingObject => "FetchingObject",
            InstanceState::RunningInference => "RunningInference",
            InstanceState::PersistingResult => "PersistingResult",
            InstanceState::Completed => "Completed",
            InstanceState::Failed => "Failed",
        }
    }
}

impl Display for InstanceState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a status query. `error` is only set for `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstanceStatus {
    pub fn new(state: InstanceState) -> Self {
        InstanceStatus { state, error: None }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        InstanceStatus {
            state: InstanceState::Failed,
            error: Some(reason.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Durable marker of an instance, written before any step runs and
/// rewritten on every state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub instance_id: InstanceId,
    pub object_key: ObjectKey,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invocation {
    pub fn new(instance_id: InstanceId, object_key: ObjectKey) -> Self {
        let now: DateTime<Utc> = Utc::now();

        Invocation {
            instance_id,
            object_key,
            status: InstanceStatus::new(InstanceState::Created),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_completed_and_failed_are_terminal() {
        let terminal: Vec<InstanceState> = [
            InstanceState::Created,
            InstanceState::RecordingInstance,
            InstanceState::FetchingObject,
            InstanceState::RunningInference,
            InstanceState::PersistingResult,
            InstanceState::Completed,
            InstanceState::Failed,
        ]
        .into_iter()
        .filter(InstanceState::is_terminal)
        .collect();

        assert_eq!(vec![InstanceState::Completed, InstanceState::Failed], terminal);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(InstanceId::generate(), InstanceId::generate());
    }

    #[test]
    fn status_omits_error_unless_failed() {
        let running: String =
            serde_json::to_string(&InstanceStatus::new(InstanceState::FetchingObject))
                .expect("Status should serialize");
        let failed: String = serde_json::to_string(&InstanceStatus::failed("boom"))
            .expect("Status should serialize");

        assert_eq!(r#"{"state":"FetchingObject"}"#, running);
        assert_eq!(r#"{"state":"Failed","error":"boom"}"#, failed);
    }
}
