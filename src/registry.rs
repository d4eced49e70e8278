use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

use crate::short_name;

/// Opaque service instance as stored in the registry.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Concurrent store of named services.
///
/// Writes to one name are serialized against reads and writes of that same
/// name. Other names stay readable while a write is in flight, because the
/// map is sharded.
///
/// Re-registering a name replaces the instance atomically: every lookup sees
/// either the old or the new instance, never anything in between.
#[derive(Default)]
pub struct CapabilityRegistry {
    services: DashMap<String, Instance>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `instance` under `name`, returning whatever was stored there
    /// before. Overwriting is allowed; it is up to the caller to warn about it.
    pub fn register<T: Any + Send + Sync>(
        &self,
        name: impl Into<String>,
        instance: T,
    ) -> Option<Instance> {
        self.register_instance(name, Arc::new(instance))
    }

    /// Like `register`, for an instance that is already shared.
    pub fn register_instance(&self, name: impl Into<String>, instance: Instance) -> Option<Instance> {
        let name = name.into();
        tracing::debug!(service = %name, "registering service");
        self.services.insert(name, instance)
    }

    /// Looks up the instance stored under `name`.
    pub fn get(&self, name: &str) -> Option<Instance> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    /// Looks up `name` and converts it to `T`.
    ///
    /// Returns `None` both when nothing is registered under `name` and when
    /// the stored instance is not a `T`.
    pub fn get_typed<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let instance = self.get(name)?;
        match instance.downcast::<T>() {
            Ok(typed) => Some(typed),
            Err(_) => {
                tracing::debug!(
                    service = %name,
                    expected = %short_name::<T>(),
                    "registered service has a different type"
                );
                None
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
