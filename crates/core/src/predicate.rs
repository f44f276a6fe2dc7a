//! Selection predicates: pure checks deciding whether an object is of interest.

use crate::CachedObject;

pub trait SelectionPredicate: Send + Sync {
    fn matches(&self, obj: &CachedObject) -> bool;
}

impl<F> SelectionPredicate for F
where
    F: Fn(&CachedObject) -> bool + Send + Sync,
{
    fn matches(&self, obj: &CachedObject) -> bool { self(obj) }
}

/// Selects objects carrying the annotation key, whatever its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HasAnnotation {
    key: String,
}

impl HasAnnotation {
    pub fn new(key: impl Into<String>) -> Self { Self { key: key.into() } }
    pub fn key(&self) -> &str { &self.key }
}

impl SelectionPredicate for HasAnnotation {
    fn matches(&self, obj: &CachedObject) -> bool { obj.annotation(&self.key).is_some() }
}

/// Selects objects in one namespace; `None` selects everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InNamespace(pub Option<String>);

impl SelectionPredicate for InNamespace {
    fn matches(&self, obj: &CachedObject) -> bool {
        match &self.0 {
            Some(ns) => obj.namespace() == Some(ns.as_str()),
            None => true,
        }
    }
}
