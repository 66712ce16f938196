use crate::engine::WorkflowExecutor;
use crate::error::EngineError;
use lambda_runtime::tracing;
use model::{InstanceId, InstanceStatus, ObjectKey, WorkflowRecord};
use serde::Serialize;
use state::{StateError, TrackingStore};
use std::sync::Arc;

/// What a status endpoint reports for one uploaded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub instance_id: InstanceId,
    pub analysis_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    // Lifecycle of the owning instance, when the executor knows it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<InstanceStatus>,
}

/// Read-only view over the tracking store for status endpoints.
#[derive(Clone)]
pub struct StatusQuery {
    tracking: Arc<dyn TrackingStore>,
    executor: Option<WorkflowExecutor>,
}

impl StatusQuery {
    pub fn new(tracking: Arc<dyn TrackingStore>) -> Self {
        StatusQuery {
            tracking,
            executor: None,
        }
    }

    /// Also report the owning instance's lifecycle state.
    pub fn with_executor(mut self, executor: WorkflowExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub async fn lookup(&self, object_key: &ObjectKey) -> Result<Option<UploadStatus>, StateError> {
        let Some(record) = self.tracking.get(object_key).await? else {
            return Ok(None);
        };

        let state: Option<InstanceStatus> = match &self.executor {
            Some(executor) => self.instance_state(executor, &record).await,
            None => None,
        };

        let analysis_complete = record.analysis_complete();
        Ok(Some(UploadStatus {
            instance_id: record.instance_id,
            analysis_complete,
            analysis: record.analysis_result,
            state,
        }))
    }

    async fn instance_state(
        &self,
        executor: &WorkflowExecutor,
        record: &WorkflowRecord,
    ) -> Option<InstanceStatus> {
        match executor.status(&record.instance_id).await {
            Ok(status) => Some(status),
            Err(EngineError::UnknownInstance(_)) => None,
            Err(err) => {
                tracing::warn!("No state for {}: {err}", record.object_key);
                None
            }
        }
    }
}
