//! Event routing: translate cache view notifications into work admissions.
//!
//! All work funnels through deploy config keys. Dependents never carry
//! enough state to be reconciled on their own; a change on one only means
//! "re-evaluate the owning config".

use std::sync::Arc;

use steer_core::{DeployConfig, Keyed, Pod, ReplicaController, ViewEvent};
use steer_queue::WorkQueue;
use tracing::{debug, warn};

use crate::OwnerIndex;

pub struct Router {
    queue: Arc<WorkQueue>,
    owners: OwnerIndex,
}

impl Router {
    pub fn new(queue: Arc<WorkQueue>, owners: OwnerIndex) -> Self {
        Self { queue, owners }
    }

    pub fn primary_event(&self, ev: ViewEvent<DeployConfig>) {
        match ev {
            ViewEvent::Added(config) => {
                debug!(key = %config.key(), "adding deploy config");
                self.queue.add(config.key().to_string());
            }
            ViewEvent::Updated { old, new } => {
                // A periodic relist resends every known config unchanged.
                if old.meta.resource_version == new.meta.resource_version {
                    return;
                }
                debug!(key = %new.key(), "updating deploy config");
                self.queue.add(new.key().to_string());
            }
            ViewEvent::Deleted(del) => match del.recover() {
                Some(config) => {
                    debug!(key = %config.key(), "deleting deploy config");
                    self.queue.add(config.key().to_string());
                }
                None => warn!("could not recover deploy config from tombstone"),
            },
        }
    }

    pub fn replica_event(&self, ev: ViewEvent<ReplicaController>) {
        self.dependent_event("replica controller", ev);
    }

    pub fn pod_event(&self, ev: ViewEvent<Pod>) {
        self.dependent_event("pod", ev);
    }

    fn dependent_event<T: Keyed>(&self, kind: &'static str, ev: ViewEvent<T>) {
        match ev {
            // A freshly created dependent is the result of a reconcile that
            // already held the owner's key; nothing new to schedule.
            ViewEvent::Added(_) => {}
            ViewEvent::Updated { old, new } => {
                if old.meta().resource_version == new.meta().resource_version {
                    return;
                }
                if let Some(owner) = self.owners.resolve_owner(new.meta()) {
                    debug!(kind, dependent = %new.key(), owner = %owner, "dependent changed");
                    self.queue.add(owner.to_string());
                }
            }
            ViewEvent::Deleted(del) => match del.recover() {
                Some(obj) => {
                    if let Some(owner) = self.owners.resolve_owner(obj.meta()) {
                        debug!(kind, dependent = %obj.key(), owner = %owner, "dependent deleted");
                        self.queue.add(owner.to_string());
                    }
                }
                None => warn!(kind, "could not recover dependent from tombstone"),
            },
        }
    }
}
