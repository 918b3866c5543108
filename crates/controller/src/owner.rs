//! Owner resolution: map a dependent back to the deploy config that owns it.

use std::sync::Arc;

use steer_core::{DeployConfig, ObjectKey, ObjectMeta};
use steer_store::ObjectView;
use tracing::{debug, warn};

/// Pure lookup over the primary view; no side effects.
pub struct OwnerIndex {
    configs: Arc<dyn ObjectView<DeployConfig>>,
}

impl OwnerIndex {
    pub fn new(configs: Arc<dyn ObjectView<DeployConfig>>) -> Self {
        Self { configs }
    }

    /// Resolve the deploy config owning `meta`, if any.
    ///
    /// Best-effort: a missing or malformed reference, an unknown owner, or a
    /// lookup failure all resolve to `None`. Callers never fail on this path.
    pub fn resolve_owner(&self, meta: &ObjectMeta) -> Option<ObjectKey> {
        let name = meta.owner_name()?;
        if name.is_empty() {
            warn!(dependent = %meta.key(), "empty owner reference; ignoring");
            return None;
        }
        let key = ObjectKey::new(meta.namespace.clone(), name);
        match self.configs.get(&key) {
            Ok(Some(_)) => Some(key),
            Ok(None) => {
                debug!(dependent = %meta.key(), owner = %key, "owner not in cache; ignoring");
                None
            }
            Err(e) => {
                warn!(dependent = %meta.key(), owner = %key, error = %e, "owner lookup failed; ignoring");
                None
            }
        }
    }
}
