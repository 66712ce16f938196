use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use model::{
    InstanceId, InstanceStatus, Invocation, ObjectKey, StepEntry, StepName, WorkflowRecord,
};
use state::{SetAnalysis, StateError, StateErrorReason, StateOperation, StepLog, TrackingStore};
use std::sync::RwLock;

#[derive(Default)]
pub struct InMemoryTrackingStore {
    records: DashMap<ObjectKey, WorkflowRecord>,
}

impl InMemoryTrackingStore {
    /// Drop a record, as an operator cleaning up the table would.
    pub fn remove(&self, object_key: &ObjectKey) -> Option<WorkflowRecord> {
        self.records.remove(object_key).map(|(_, record)| record)
    }
}

#[async_trait]
impl TrackingStore for InMemoryTrackingStore {
    async fn upsert(
        &self,
        object_key: &ObjectKey,
        instance_id: &InstanceId,
    ) -> Result<(), StateError> {
        self.records.insert(
            object_key.clone(),
            WorkflowRecord::new(object_key.clone(), instance_id.clone()),
        );

        Ok(())
    }

    async fn set_analysis(
        &self,
        object_key: &ObjectKey,
        instance_id: &InstanceId,
        analysis: &str,
    ) -> Result<SetAnalysis, StateError> {
        let Some(mut record) = self.records.get_mut(object_key) else {
            return Ok(SetAnalysis::MissingRecord);
        };

        if &record.instance_id != instance_id {
            return Err(StateError::new(
                object_key.as_str(),
                StateOperation::SetAnalysis,
                StateErrorReason::StaleInstance {
                    current: record.instance_id.clone(),
                },
            ));
        }

        record.analysis_result = Some(analysis.to_string());
        record.updated_at = Utc::now();

        Ok(SetAnalysis::Applied)
    }

    async fn get(&self, object_key: &ObjectKey) -> Result<Option<WorkflowRecord>, StateError> {
        Ok(self
            .records
            .get(object_key)
            .map(|record| record.value().clone()))
    }
}

/// Step log kept as an append-only arena of entries plus an index on
/// `(instance, step)`.
#[derive(Default)]
pub struct InMemoryStepLog {
    invocations: DashMap<InstanceId, Invocation>,
    entries: RwLock<Vec<StepEntry>>,
    index: DashMap<(InstanceId, StepName), usize>,
}

impl InMemoryStepLog {
    /// Steps recorded for an instance, in workflow order.
    pub fn completed_steps(&self, instance_id: &InstanceId) -> Vec<StepName> {
        StepName::ORDER
            .into_iter()
            .filter(|step| self.index.contains_key(&(instance_id.clone(), *step)))
            .collect()
    }

    /// Number of entries ever appended, across all instances.
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StepLog for InMemoryStepLog {
    async fn put_invocation(&self, invocation: &Invocation) -> Result<(), StateError> {
        self.invocations
            .insert(invocation.instance_id.clone(), invocation.clone());

        Ok(())
    }

    async fn get_invocation(&self, instance_id: &InstanceId) -> Result<Invocation, StateError> {
        self.invocations
            .get(instance_id)
            .map(|invocation| invocation.value().clone())
            .ok_or(StateError::new(
                instance_id.as_str(),
                StateOperation::GetInvocation,
                StateErrorReason::MissingEntry,
            ))
    }

    async fn update_status(
        &self,
        instance_id: &InstanceId,
        status: &InstanceStatus,
    ) -> Result<(), StateError> {
        let mut invocation = self.invocations.get_mut(instance_id).ok_or(StateError::new(
            instance_id.as_str(),
            StateOperation::UpdateStatus,
            StateErrorReason::MissingEntry,
        ))?;

        invocation.status = status.clone();
        invocation.updated_at = Utc::now();

        Ok(())
    }

    async fn unfinished_invocations(&self) -> Result<Vec<Invocation>, StateError> {
        let mut unfinished: Vec<Invocation> = self
            .invocations
            .iter()
            .filter(|invocation| !invocation.status.is_terminal())
            .map(|invocation| invocation.value().clone())
            .collect();
        unfinished.sort_by_key(|invocation| invocation.created_at);

        Ok(unfinished)
    }

    async fn put_step(&self, entry: &StepEntry) -> Result<(), StateError> {
        // Holding the index entry serializes appends for the same step
        let Entry::Vacant(vacant) = self.index.entry((entry.instance_id.clone(), entry.step))
        else {
            return Ok(());
        };

        let mut entries = self.entries.write().map_err(|err| {
            StateError::backend(entry.instance_id.as_str(), StateOperation::PutStep, err.to_string())
        })?;
        entries.push(entry.clone());
        vacant.insert(entries.len() - 1);

        Ok(())
    }

    async fn get_step(
        &self,
        instance_id: &InstanceId,
        step: StepName,
    ) -> Result<Option<StepEntry>, StateError> {
        let Some(position) = self
            .index
            .get(&(instance_id.clone(), step))
            .map(|position| *position)
        else {
            return Ok(None);
        };

        let entries = self.entries.read().map_err(|err| {
            StateError::backend(instance_id.as_str(), StateOperation::GetStep, err.to_string())
        })?;

        Ok(entries.get(position).cloned())
    }
}
