//! Steer in-RAM object views: point lookups, change notifications, and the
//! startup sync gate that holds workers back until every mirror has seen a
//! full snapshot.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use steer_core::{CacheError, Deletion, Keyed, ObjectKey, ViewEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How often the sync gate re-polls readiness probes. Kept short so startup
/// does not hot-loop but still reacts quickly once mirrors fill.
pub const SYNC_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Read-side contract of a cache view. Lookup errors are distinct from
/// "object not found"; callers treat them as retryable.
pub trait ObjectView<T>: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<T>>, CacheError>;

    /// True once the local mirror reflects at least one full remote snapshot.
    fn has_synced(&self) -> bool;
}

/// In-memory mirror of one object kind. Mutations emit [`ViewEvent`]s to a
/// single subscriber, the same shape a watch-backed mirror would deliver.
pub struct MemStore<T> {
    objects: RwLock<FxHashMap<ObjectKey, Arc<T>>>,
    synced: AtomicBool,
    events: RwLock<Option<mpsc::UnboundedSender<ViewEvent<T>>>>,
}

impl<T: Keyed> MemStore<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: RwLock::new(FxHashMap::default()),
            synced: AtomicBool::new(false),
            events: RwLock::new(None),
        })
    }

    /// Register the single event subscriber. Later calls replace the sender,
    /// detaching the previous receiver.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ViewEvent<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.write().expect("events lock") = Some(tx);
        rx
    }

    fn emit(&self, ev: ViewEvent<T>) {
        if let Some(tx) = self.events.read().expect("events lock").as_ref() {
            let _ = tx.send(ev);
        }
    }

    /// Insert or replace an object, emitting Added or Updated.
    pub fn apply(&self, obj: T) {
        let obj = Arc::new(obj);
        let key = obj.key();
        let old = self.objects.write().expect("objects lock").insert(key.clone(), Arc::clone(&obj));
        match old {
            Some(old) => {
                debug!(key = %key, "store update");
                self.emit(ViewEvent::Updated { old, new: obj });
            }
            None => {
                debug!(key = %key, "store add");
                self.emit(ViewEvent::Added(obj));
            }
        }
    }

    /// Remove an object, emitting a delete carrying the last-known state.
    /// Removing an unknown key is a no-op.
    pub fn remove(&self, key: &ObjectKey) {
        let old = self.objects.write().expect("objects lock").remove(key);
        if let Some(old) = old {
            debug!(key = %key, "store delete");
            self.emit(ViewEvent::Deleted(Deletion::Object(old)));
        }
    }

    /// Remove an object the way a relist notices a missed delete: the event
    /// carries a tombstone, whose payload may already be gone.
    pub fn remove_as_tombstone(&self, key: &ObjectKey, keep_object: bool) {
        let old = self.objects.write().expect("objects lock").remove(key);
        let object = if keep_object { old } else { None };
        debug!(key = %key, recovered = object.is_some(), "store delete via tombstone");
        self.emit(ViewEvent::Deleted(Deletion::Tombstone { key: key.to_string(), object }));
    }

    /// Flip the readiness probe; called once the initial snapshot is loaded.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.read().expect("objects lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Keyed + Send + Sync> ObjectView<T> for MemStore<T> {
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<T>>, CacheError> {
        Ok(self.objects.read().expect("objects lock").get(key).cloned())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Block until every readiness probe reports true, polling at
/// [`SYNC_POLL_PERIOD`]. Returns false if the stop token fires first.
pub async fn wait_for_sync(probes: &[&(dyn Fn() -> bool + Send + Sync)], stop: &CancellationToken) -> bool {
    let mut tick = tokio::time::interval(SYNC_POLL_PERIOD);
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                info!("shutdown requested before caches synced");
                return false;
            }
            _ = tick.tick() => {
                if probes.iter().all(|p| p()) {
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steer_core::{DeployConfig, ObjectMeta};

    fn config(ns: &str, name: &str, rv: &str) -> DeployConfig {
        DeployConfig {
            meta: ObjectMeta { namespace: ns.into(), name: name.into(), resource_version: rv.into(), ..Default::default() },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn apply_emits_added_then_updated() {
        let store = MemStore::new();
        let mut rx = store.subscribe();
        store.apply(config("ns", "app", "1"));
        store.apply(config("ns", "app", "2"));
        match rx.recv().await.expect("event") {
            ViewEvent::Added(c) => assert_eq!(c.meta.resource_version, "1"),
            _ => panic!("expected Added"),
        }
        match rx.recv().await.expect("event") {
            ViewEvent::Updated { old, new } => {
                assert_eq!(old.meta.resource_version, "1");
                assert_eq!(new.meta.resource_version, "2");
            }
            _ => panic!("expected Updated"),
        }
    }

    #[tokio::test]
    async fn remove_emits_delete_with_last_known_state() {
        let store = MemStore::new();
        let mut rx = store.subscribe();
        store.apply(config("ns", "app", "1"));
        let key = ObjectKey::new("ns", "app");
        store.remove(&key);
        let _ = rx.recv().await;
        match rx.recv().await.expect("event") {
            ViewEvent::Deleted(d) => assert!(d.recover().is_some()),
            _ => panic!("expected Deleted"),
        }
        assert!(store.get(&key).expect("lookup").is_none());
    }

    #[tokio::test]
    async fn tombstone_removal_may_drop_payload() {
        let store = MemStore::new();
        let mut rx = store.subscribe();
        store.apply(config("ns", "app", "1"));
        let _ = rx.recv().await;
        store.remove_as_tombstone(&ObjectKey::new("ns", "app"), false);
        match rx.recv().await.expect("event") {
            ViewEvent::Deleted(Deletion::Tombstone { key, object }) => {
                assert_eq!(key, "ns/app");
                assert!(object.is_none());
            }
            _ => panic!("expected tombstone delete"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sync_gate_waits_for_all_probes() {
        let store_a: Arc<MemStore<DeployConfig>> = MemStore::new();
        let store_b: Arc<MemStore<DeployConfig>> = MemStore::new();
        store_a.mark_synced();
        let stop = CancellationToken::new();
        {
            let b = Arc::clone(&store_b);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                b.mark_synced();
            });
        }
        let a = Arc::clone(&store_a);
        let b = Arc::clone(&store_b);
        let pa = move || a.has_synced();
        let pb = move || b.has_synced();
        assert!(wait_for_sync(&[&pa, &pb], &stop).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_gate_aborts_on_stop() {
        let store: Arc<MemStore<DeployConfig>> = MemStore::new();
        let stop = CancellationToken::new();
        {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                stop.cancel();
            });
        }
        let s = Arc::clone(&store);
        let probe = move || s.has_synced();
        assert!(!wait_for_sync(&[&probe], &stop).await);
    }
}
