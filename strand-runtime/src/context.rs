//! Service Context
//!
//! A [`Context`] is an immutable type map of services available to an effect.
//! It lives in the `current_context` fiber ref, so it is inherited at fork and
//! merged at join through [`ContextDiffer`].
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::{Context, Effect};
//!
//! #[derive(Clone)]
//! struct Database { url: String }
//!
//! let program = Effect::<Database>::service().map(|db| db.url.len());
//! let provided = program.provide_context(
//!     Context::empty().with(Database { url: "postgres://".into() }),
//! );
//! ```

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::differ::Differ;
use crate::value::{erase, unerase, AnyValue, Value};

/// An immutable map from service type to service value.
#[derive(Clone, Default)]
pub struct Context {
    services: Arc<HashMap<TypeId, (AnyValue, &'static str)>>,
}

impl Context {
    /// The empty context.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A copy of this context with `service` added, replacing any service of
    /// the same type.
    pub fn with<S: Value>(&self, service: S) -> Self {
        let mut next = self.clone();
        next.insert(service);
        next
    }

    /// Add `service` in place.
    pub fn insert<S: Value>(&mut self, service: S) {
        Arc::make_mut(&mut self.services)
            .insert(TypeId::of::<S>(), (erase(service), type_name::<S>()));
    }

    pub(crate) fn insert_erased(&mut self, service: AnyValue, name: &'static str) {
        let id = (*service).type_id();
        Arc::make_mut(&mut self.services).insert(id, (service, name));
    }

    /// Look up a service.
    pub fn get<S: Value>(&self) -> Option<S> {
        self.services
            .get(&TypeId::of::<S>())
            .and_then(|(value, _)| unerase(value))
    }

    /// Check if a service is present.
    pub fn contains<S: Value>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<S>())
    }

    /// A copy of this context without the service `S`.
    pub fn without<S: Value>(&self) -> Self {
        let mut next = self.clone();
        if next.contains::<S>() {
            Arc::make_mut(&mut next.services).remove(&TypeId::of::<S>());
        }
        next
    }

    /// Combine two contexts; services in `other` win.
    pub fn merge(&self, other: &Context) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        let mut next = self.clone();
        let services = Arc::make_mut(&mut next.services);
        for (id, entry) in other.services.iter() {
            services.insert(*id, entry.clone());
        }
        next
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Check if the context holds no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Names of the service types, sorted.
    pub fn service_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.services.values().map(|(_, name)| *name).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("services", &self.service_names())
            .finish()
    }
}

/// One step of a [`ContextDiffer`] patch.
#[derive(Clone)]
pub enum ContextOp {
    /// Add or replace a service.
    Add(TypeId, AnyValue, &'static str),
    /// Remove a service.
    Remove(TypeId),
}

impl fmt::Debug for ContextOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextOp::Add(_, _, name) => write!(f, "Add({})", name),
            ContextOp::Remove(id) => write!(f, "Remove({:?})", id),
        }
    }
}

/// Per-service differ for [`Context`]. Services are compared by identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextDiffer;

impl Differ for ContextDiffer {
    type Value = Context;
    type Patch = Vec<ContextOp>;

    fn empty(&self) -> Self::Patch {
        Vec::new()
    }

    fn diff(&self, old: &Context, new: &Context) -> Self::Patch {
        if Arc::ptr_eq(&old.services, &new.services) {
            return Vec::new();
        }
        let mut ops = Vec::new();
        for (id, (value, name)) in new.services.iter() {
            let unchanged = old
                .services
                .get(id)
                .is_some_and(|(prev, _)| Arc::ptr_eq(prev, value));
            if !unchanged {
                ops.push(ContextOp::Add(*id, value.clone(), *name));
            }
        }
        for id in old.services.keys() {
            if !new.services.contains_key(id) {
                ops.push(ContextOp::Remove(*id));
            }
        }
        ops
    }

    fn combine(&self, mut first: Self::Patch, second: Self::Patch) -> Self::Patch {
        first.extend(second);
        first
    }

    fn patch(&self, patch: &Self::Patch, old: &Context) -> Context {
        if patch.is_empty() {
            return old.clone();
        }
        let mut next = old.clone();
        let services = Arc::make_mut(&mut next.services);
        for op in patch {
            match op {
                ContextOp::Add(id, value, name) => {
                    services.insert(*id, (value.clone(), *name));
                }
                ContextOp::Remove(id) => {
                    services.remove(id);
                }
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Port(u16);

    #[derive(Debug, Clone, PartialEq)]
    struct Host(String);

    #[test]
    fn test_with_and_get() {
        let ctx = Context::empty().with(Port(80));
        assert_eq!(ctx.get::<Port>(), Some(Port(80)));
        assert_eq!(ctx.get::<Host>(), None);

        let replaced = ctx.with(Port(443));
        assert_eq!(replaced.get::<Port>(), Some(Port(443)));
        assert_eq!(ctx.get::<Port>(), Some(Port(80)));
        assert_eq!(replaced.len(), 1);
    }

    #[test]
    fn test_merge_and_without() {
        let a = Context::empty().with(Port(1));
        let b = Context::empty().with(Port(2)).with(Host("h".into()));
        let merged = a.merge(&b);
        assert_eq!(merged.get::<Port>(), Some(Port(2)));
        assert!(merged.contains::<Host>());
        assert!(!merged.without::<Host>().contains::<Host>());
    }

    #[test]
    fn test_differ_replays_child_changes() {
        let d = ContextDiffer;
        let base = Context::empty().with(Port(1));
        let child = base.with(Host("child".into()));
        let patch = d.diff(&base, &child);

        let parent = base.with(Port(9));
        let merged = d.patch(&patch, &parent);
        assert_eq!(merged.get::<Port>(), Some(Port(9)));
        assert_eq!(merged.get::<Host>(), Some(Host("child".into())));
        assert!(d.diff(&child, &child).is_empty());
    }
}
