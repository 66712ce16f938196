use crate::{InstanceId, ObjectKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latest attempt at analysing one object. There is at most one per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub object_key: ObjectKey,
    pub instance_id: InstanceId,
    // Null until the persist step of `instance_id` writes it
    #[serde(default)]
    pub analysis_result: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new(object_key: ObjectKey, instance_id: InstanceId) -> Self {
        WorkflowRecord {
            object_key,
            instance_id,
            analysis_result: None,
            updated_at: Utc::now(),
        }
    }

    pub fn analysis_complete(&self) -> bool {
        self.analysis_result.is_some()
    }
}
