use crate::{InstanceId, InstanceState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// The fixed, ordered steps of the upload analysis workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepName {
    RecordInstance,
    FetchObject,
    RunInference,
    PersistResult,
}

impl StepName {
    pub const ORDER: [StepName; 4] = [
        StepName::RecordInstance,
        StepName::FetchObject,
        StepName::RunInference,
        StepName::PersistResult,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::RecordInstance => "recordInstance",
            StepName::FetchObject => "fetchObject",
            StepName::RunInference => "runInference",
            StepName::PersistResult => "persistResult",
        }
    }

    /// State an instance reports while this step runs.
    pub fn state(&self) -> InstanceState {
        match self {
            StepName::RecordInstance => InstanceState::RecordingInstance,
            StepName::FetchObject => InstanceState::FetchingObject,
            StepName::RunInference => InstanceState::RunningInference,
            StepName::PersistResult => InstanceState::PersistingResult,
        }
    }
}

impl Display for StepName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepName::ORDER
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("unknown step '{s}'"))
    }
}

/// One completed step and the output later attempts replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEntry {
    pub instance_id: InstanceId,
    pub step: StepName,
    pub output: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

impl StepEntry {
    pub fn new(instance_id: InstanceId, step: StepName, output: serde_json::Value) -> Self {
        StepEntry {
            instance_id,
            step,
            output,
            completed_at: Utc::now(),
        }
    }
}
