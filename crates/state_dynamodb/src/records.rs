use chrono::{DateTime, Utc};
use model::{InstanceId, InstanceState, InstanceStatus, Invocation, ObjectKey, StepEntry, StepName};
use serde::{Deserialize, Serialize};

pub(crate) const OBJECT_KEY: &str = "object_key";
pub(crate) const INSTANCE_ID: &str = "instance_id";
pub(crate) const SORT_KEY: &str = "sk";

pub(crate) const INVOCATION_SORT_KEY: &str = "invocation";
const STEP_SORT_KEY_PREFIX: &str = "step#";

pub(crate) fn step_sort_key(step: StepName) -> String {
    format!("{STEP_SORT_KEY_PREFIX}{step}")
}

/// Step log row holding an instance. Shares a partition with its steps.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct InvocationItem {
    pub instance_id: InstanceId,
    pub sk: String,
    pub object_key: ObjectKey,
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Invocation> for InvocationItem {
    fn from(invocation: &Invocation) -> Self {
        InvocationItem {
            instance_id: invocation.instance_id.clone(),
            sk: INVOCATION_SORT_KEY.to_string(),
            object_key: invocation.object_key.clone(),
            state: invocation.status.state,
            error: invocation.status.error.clone(),
            created_at: invocation.created_at,
            updated_at: invocation.updated_at,
        }
    }
}

impl From<InvocationItem> for Invocation {
    fn from(item: InvocationItem) -> Self {
        Invocation {
            instance_id: item.instance_id,
            object_key: item.object_key,
            status: InstanceStatus {
                state: item.state,
                error: item.error,
            },
            created_at: item.created_at,
            updated_at: item.updated_at,
        }
    }
}

/// Step log row holding the output of one completed step.
///
/// The output is JSON text, kept inline when it fits in the item and in the
/// payload bucket otherwise.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StepItem {
    pub instance_id: InstanceId,
    pub sk: String,
    pub step: StepName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    // Object key in the payload bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl StepItem {
    pub(crate) fn new(entry: &StepEntry, output: StoredOutput) -> Self {
        let (output, output_location) = match output {
            StoredOutput::Inline(text) => (Some(text), None),
            StoredOutput::Offloaded(location) => (None, Some(location)),
        };

        StepItem {
            instance_id: entry.instance_id.clone(),
            sk: step_sort_key(entry.step),
            step: entry.step,
            output,
            output_location,
            completed_at: entry.completed_at,
        }
    }

    pub(crate) fn stored_output(&self) -> Option<StoredOutput> {
        match (&self.output, &self.output_location) {
            (Some(text), _) => Some(StoredOutput::Inline(text.clone())),
            (None, Some(location)) => Some(StoredOutput::Offloaded(location.clone())),
            (None, None) => None,
        }
    }

    pub(crate) fn into_entry(self, output: serde_json::Value) -> StepEntry {
        StepEntry {
            instance_id: self.instance_id,
            step: self.step,
            output,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StoredOutput {
    Inline(String),
    Offloaded(String),
}
