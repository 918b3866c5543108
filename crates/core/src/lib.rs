//! Steer core types: object keys, metadata, and the watch event model.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Annotation carried by dependents naming the deploy config that owns them.
pub const OWNER_ANNOTATION: &str = "steer.io/deploy-config";

/// Namespace-qualified object identity. Rendered as `namespace/name` when
/// carried through the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Parse the `namespace/name` string form back into a key.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::new(*ns, *name)),
            _ => Err(KeyError::Invalid(s.to_string())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid object key {0:?} (expect namespace/name)")]
    Invalid(String),
}

/// Metadata shared by every mirrored object.
///
/// `resource_version` is a change-detection token: compared for equality
/// only, never ordered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Name of the owning deploy config, if the object carries the owner
    /// annotation. Dependents created outside a rollout may not have one.
    pub fn owner_name(&self) -> Option<&str> {
        self.annotations.get(OWNER_ANNOTATION).map(String::as_str)
    }
}

/// Anything mirrored by a cache view.
pub trait Keyed {
    fn meta(&self) -> &ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

/// Primary object: the declared rollout state an operator edits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    pub meta: ObjectMeta,
    pub replicas: i32,
    /// Rollout generation; bumped by the actor that triggers a new rollout.
    pub latest_version: i64,
}

/// Dependent: the replica-managing controller a rollout materializes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaController {
    pub meta: ObjectMeta,
    pub replicas: i32,
}

/// Dependent: a pod supervised by a replica controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pod {
    pub meta: ObjectMeta,
    pub phase: String,
}

impl Keyed for DeployConfig {
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
}
impl Keyed for ReplicaController {
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
}
impl Keyed for Pod {
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
}

/// Last-known state delivered with a delete notification.
///
/// When a relist notices an object vanished without a watch delete, the
/// view only retains a tombstone, and recovery of the full object may fail.
#[derive(Debug, Clone)]
pub enum Deletion<T> {
    Object(Arc<T>),
    Tombstone { key: String, object: Option<Arc<T>> },
}

impl<T> Deletion<T> {
    /// Recover the last-known object, if the notification kept one.
    pub fn recover(&self) -> Option<&Arc<T>> {
        match self {
            Deletion::Object(o) => Some(o),
            Deletion::Tombstone { object, .. } => object.as_ref(),
        }
    }
}

/// Change notification emitted by a cache view.
#[derive(Debug, Clone)]
pub enum ViewEvent<T> {
    Added(Arc<T>),
    Updated { old: Arc<T>, new: Arc<T> },
    Deleted(Deletion<T>),
}

/// Lookup failure inside a cache view, distinct from "object not found".
#[derive(Debug, Error)]
#[error("cache lookup failed for {key}: {reason}")]
pub struct CacheError {
    pub key: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_and_parse_round_trip() {
        let k = ObjectKey::new("ns", "app");
        assert_eq!(k.to_string(), "ns/app");
        assert_eq!(ObjectKey::parse("ns/app").expect("ok"), k);
    }

    #[test]
    fn key_parse_rejects_malformed() {
        assert!(ObjectKey::parse("bare").is_err());
        assert!(ObjectKey::parse("a/b/c").is_err());
        assert!(ObjectKey::parse("/name").is_err());
        assert!(ObjectKey::parse("ns/").is_err());
        assert!(ObjectKey::parse("").is_err());
    }

    #[test]
    fn owner_name_reads_annotation() {
        let mut meta = ObjectMeta { namespace: "ns".into(), name: "app-1".into(), ..Default::default() };
        assert_eq!(meta.owner_name(), None);
        meta.annotations.insert(OWNER_ANNOTATION.to_string(), "app".to_string());
        assert_eq!(meta.owner_name(), Some("app"));
    }

    #[test]
    fn tombstone_recovery_may_fail() {
        let pod = Arc::new(Pod { meta: ObjectMeta { namespace: "ns".into(), name: "p".into(), ..Default::default() }, phase: "Running".into() });
        let d = Deletion::Tombstone { key: "ns/p".into(), object: Some(pod.clone()) };
        assert!(d.recover().is_some());
        let d: Deletion<Pod> = Deletion::Tombstone { key: "ns/p".into(), object: None };
        assert!(d.recover().is_none());
    }
}
