use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use model::{InstanceId, InstanceStatus};
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Instances running in one executor, with a status channel each.
///
/// Entries exist only while an instance runs here, plus the terminal statuses
/// the step log has not accepted yet. Anything else is answered from the step
/// log.
#[derive(Default)]
pub(crate) struct InstanceRegistry {
    instances: DashMap<InstanceId, RegistryEntry>,
    unpersisted: DashMap<InstanceId, InstanceStatus>,
}

struct RegistryEntry {
    status: watch::Sender<InstanceStatus>,
    task: Option<AbortHandle>,
}

impl InstanceRegistry {
    /// Claim `instance_id` for this executor. Fails if it is already running
    /// or already finished here.
    pub(crate) fn try_register(&self, instance_id: &InstanceId, status: InstanceStatus) -> bool {
        if self.unpersisted.contains_key(instance_id) {
            return false;
        }

        match self.instances.entry(instance_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                let (sender, _) = watch::channel(status);
                vacant.insert(RegistryEntry {
                    status: sender,
                    task: None,
                });

                true
            }
        }
    }

    pub(crate) fn attach(&self, instance_id: &InstanceId, task: AbortHandle) {
        // Missing when the instance already finished
        if let Some(mut entry) = self.instances.get_mut(instance_id) {
            entry.task = Some(task);
        }
    }

    pub(crate) fn publish(&self, instance_id: &InstanceId, status: InstanceStatus) {
        if let Some(entry) = self.instances.get(instance_id) {
            entry.status.send_replace(status);
        }
    }

    /// Publish a terminal status and forget the instance. A status the step log
    /// did not accept is kept until [`InstanceRegistry::persisted`].
    pub(crate) fn finish(&self, instance_id: &InstanceId, status: InstanceStatus, persisted: bool) {
        // Recorded before removal so `status` never misses it
        if !persisted {
            self.unpersisted.insert(instance_id.clone(), status.clone());
        }

        if let Some((_, entry)) = self.instances.remove(instance_id) {
            entry.status.send_replace(status);
        }
    }

    pub(crate) fn status(&self, instance_id: &InstanceId) -> Option<InstanceStatus> {
        if let Some(entry) = self.instances.get(instance_id) {
            let status: InstanceStatus = entry.status.borrow().clone();
            return Some(status);
        }

        self.unpersisted
            .get(instance_id)
            .map(|status| status.value().clone())
    }

    /// Terminal statuses still waiting to reach the step log.
    pub(crate) fn unpersisted(&self) -> Vec<(InstanceId, InstanceStatus)> {
        self.unpersisted
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub(crate) fn persisted(&self, instance_id: &InstanceId) {
        self.unpersisted.remove(instance_id);
    }

    pub(crate) fn subscribe(&self, instance_id: &InstanceId) -> Option<watch::Receiver<InstanceStatus>> {
        self.instances
            .get(instance_id)
            .map(|entry| entry.status.subscribe())
    }

    /// Abort every running instance task and forget them all.
    pub(crate) fn abort_all(&self) -> usize {
        let ids: Vec<InstanceId> = self
            .instances
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut aborted: usize = 0;
        for instance_id in ids {
            if let Some((_, entry)) = self.instances.remove(&instance_id) {
                if let Some(task) = entry.task {
                    task.abort();
                }
                aborted += 1;
            }
        }

        aborted
    }

    pub(crate) fn len(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::InstanceState;

    #[test]
    fn an_instance_is_registered_once() {
        let registry: InstanceRegistry = InstanceRegistry::default();
        let instance_id: InstanceId = InstanceId::from("a");

        assert!(registry.try_register(&instance_id, InstanceStatus::new(InstanceState::Created)));
        assert!(!registry.try_register(&instance_id, InstanceStatus::new(InstanceState::Created)));
    }

    #[tokio::test]
    async fn subscribers_see_the_terminal_status_after_finish() {
        let registry: InstanceRegistry = InstanceRegistry::default();
        let instance_id: InstanceId = InstanceId::from("a");
        registry.try_register(&instance_id, InstanceStatus::new(InstanceState::Created));

        let mut receiver: watch::Receiver<InstanceStatus> =
            registry.subscribe(&instance_id).unwrap();
        registry.publish(&instance_id, InstanceStatus::new(InstanceState::FetchingObject));
        registry.finish(&instance_id, InstanceStatus::new(InstanceState::Completed), true);

        let status: InstanceStatus = receiver
            .wait_for(InstanceStatus::is_terminal)
            .await
            .map(|status| status.clone())
            .unwrap();

        assert_eq!(InstanceState::Completed, status.state);
        assert_eq!(None, registry.status(&instance_id));
        assert_eq!(0, registry.len());
    }

    #[test]
    fn unpersisted_terminal_status_outlives_the_instance() {
        let registry: InstanceRegistry = InstanceRegistry::default();
        let instance_id: InstanceId = InstanceId::from("a");
        let failed: InstanceStatus = InstanceStatus::failed("boom");
        registry.try_register(&instance_id, InstanceStatus::new(InstanceState::Created));

        registry.finish(&instance_id, failed.clone(), false);

        assert_eq!(Some(failed.clone()), registry.status(&instance_id));
        assert_eq!(vec![(instance_id.clone(), failed)], registry.unpersisted());
        assert!(!registry.try_register(&instance_id, InstanceStatus::new(InstanceState::Created)));
        assert_eq!(0, registry.len());

        registry.persisted(&instance_id);
        assert_eq!(None, registry.status(&instance_id));
        assert!(registry.try_register(&instance_id, InstanceStatus::new(InstanceState::Created)));
    }
}
