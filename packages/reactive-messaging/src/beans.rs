//! Typed bean registry.
//!
//! The host registers the instances connectors need (connection factories,
//! codecs, ...) before the runtime starts. Lookups are by type, optionally
//! narrowed by name. The registry is read-only once the runtime is built.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
struct BeanEntry {
    type_id: TypeId,
    type_name: &'static str,
    name: Option<String>,
    instance: Arc<dyn Any + Send + Sync>,
}

/// Instances available to connectors, looked up by type and name.
#[derive(Clone, Default)]
pub struct BeanRegistry {
    entries: Vec<BeanEntry>,
}

/// A bean of type `T` together with its registration name.
#[derive(Debug)]
pub struct NamedBean<T> {
    /// Name given at registration, if any.
    pub name: Option<String>,
    /// The instance.
    pub bean: Arc<T>,
}

impl BeanRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an unnamed bean.
    pub fn register<T: Send + Sync + 'static>(&mut self, bean: T) -> &mut Self {
        self.push(None, bean);
        self
    }

    /// Register a bean under a name.
    pub fn register_named<T: Send + Sync + 'static>(
        &mut self,
        name: impl Into<String>,
        bean: T,
    ) -> &mut Self {
        self.push(Some(name.into()), bean);
        self
    }

    fn push<T: Send + Sync + 'static>(&mut self, name: Option<String>, bean: T) {
        self.entries.push(BeanEntry {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            name,
            instance: Arc::new(bean),
        });
    }

    /// Every bean of type `T`, in registration order.
    pub fn select_all<T: Send + Sync + 'static>(&self) -> Vec<NamedBean<T>> {
        self.entries
            .iter()
            .filter(|entry| entry.type_id == TypeId::of::<T>())
            .filter_map(|entry| {
                entry
                    .instance
                    .clone()
                    .downcast::<T>()
                    .ok()
                    .map(|bean| NamedBean {
                        name: entry.name.clone(),
                        bean,
                    })
            })
            .collect()
    }

    /// The bean of type `T` when exactly one is registered.
    pub fn select<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let mut all = self.select_all::<T>();
        if all.len() == 1 {
            all.pop().map(|named| named.bean)
        } else {
            None
        }
    }

    /// The bean of type `T` registered under `name`.
    pub fn select_named<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.select_all::<T>()
            .into_iter()
            .find(|named| named.name.as_deref() == Some(name))
            .map(|named| named.bean)
    }

    /// Whether no bean of type `T` is registered.
    pub fn is_unsatisfied<T: Send + Sync + 'static>(&self) -> bool {
        !self
            .entries
            .iter()
            .any(|entry| entry.type_id == TypeId::of::<T>())
    }
}

impl fmt::Debug for BeanRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| match &entry.name {
                Some(name) => format!("{} ({name})", entry.type_name),
                None => entry.type_name.to_string(),
            }))
            .finish()
    }
}
