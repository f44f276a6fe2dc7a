//! Annowatch core types: resource identity, cached objects and the capabilities
//! that connect an event source, a cache and a controller.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod predicate;

pub use predicate::{HasAnnotation, InNamespace, SelectionPredicate};

pub type Uid = [u8; 16];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid resource key: {0:?} (expect name or namespace/name)")]
    InvalidKey(String),
    #[error("object missing {0}")]
    MissingField(&'static str),
    #[error("invalid uid {uid:?}: {reason}")]
    InvalidUid { uid: String, reason: String },
}

/// Identity of a watched object. Cluster-scoped objects carry no namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self { Self::new(Some(namespace), name) }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new(None, name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::namespaced(ns, name)),
            _ => Err(CoreError::InvalidKey(s.to_string())),
        }
    }
}

/// Last-known server representation of one object, as held by the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedObject {
    pub key: ResourceKey,
    pub uid: Option<Uid>,
    /// Opaque server version; only compared when both sides are numeric.
    pub resource_version: Option<String>,
    pub generation: Option<i64>,
    pub creation_ts: i64,
    /// Kubernetes labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
    /// Kubernetes annotations as key/value pairs.
    pub annotations: SmallVec<[(String, String); 4]>,
    /// Raw object with `metadata.managedFields` stripped.
    pub raw: serde_json::Value,
}

impl CachedObject {
    /// Bare object with only an identity; the converters fill in the rest.
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            uid: None,
            resource_version: None,
            generation: None,
            creation_ts: 0,
            labels: SmallVec::new(),
            annotations: SmallVec::new(),
            raw: serde_json::Value::Null,
        }
    }

    pub fn namespace(&self) -> Option<&str> { self.key.namespace() }
    pub fn name(&self) -> &str { &self.key.name }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// True when `self` is an older version of the same object than `current`.
    pub fn is_older_than(&self, current: &CachedObject) -> bool {
        if self.uid.is_none() || self.uid != current.uid {
            return false;
        }
        let parse = |rv: &Option<String>| rv.as_deref().and_then(|s| s.parse::<u64>().ok());
        match (parse(&self.resource_version), parse(&current.resource_version)) {
            (Some(mine), Some(theirs)) => mine < theirs,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// One change fed into the cache by the event source.
#[derive(Debug, Clone)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: CachedObject,
}

impl Delta {
    pub fn applied(object: CachedObject) -> Self { Self { kind: DeltaKind::Applied, object } }
    pub fn deleted(object: CachedObject) -> Self { Self { kind: DeltaKind::Deleted, object } }
}

/// Subscription capability the event source drives. Implementations must not
/// block; they run on the event source's task.
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, obj: &Arc<CachedObject>);
    fn on_update(&self, old: &Arc<CachedObject>, new: &Arc<CachedObject>);
    fn on_delete(&self, obj: &Arc<CachedObject>);
}

/// Read access to objects of the watched kind.
pub trait ObjectLister: Send + Sync {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<CachedObject>>;
    /// All objects, or only those in `namespace` when given.
    fn list(&self, namespace: Option<&str>) -> Vec<Arc<CachedObject>>;
}

pub mod prelude {
    pub use super::{
        CachedObject, CoreError, Delta, DeltaKind, HasAnnotation, InNamespace, ObjectLister, ResourceEventHandler,
        ResourceKey, SelectionPredicate, Uid,
    };
}
