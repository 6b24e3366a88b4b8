//! Read-only caches of the watched collections

use crate::{CoreError, Result};
use aggregator_api::{APIService, Service};
use kube::Resource;
use kube_runtime::reflector::{ObjectRef, Store};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cache key of an object: `namespace/name`, or `name` when cluster-scoped
pub fn object_key<K: Resource>(obj: &K) -> Result<String> {
    let meta = obj.meta();
    let name = match meta.name.as_deref() {
        Some(name) if !name.is_empty() => name,
        _ => {
            return Err(CoreError::MissingName(
                std::any::type_name::<K>().rsplit("::").next().unwrap_or("object").to_string(),
            ))
        }
    };
    Ok(match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    })
}

fn object_ref_from_key<K>(key: &str) -> ObjectRef<K>
where
    K: Resource,
    K::DynamicType: Default,
{
    match key.split_once('/') {
        Some((namespace, name)) => ObjectRef::new(name).within(namespace),
        None => ObjectRef::new(key),
    }
}

/// Lookup of APIService registrations by key
pub trait RegistrationLister: Send + Sync {
    /// Registration stored under `key`, `None` if it does not exist
    fn get(&self, key: &str) -> Result<Option<Arc<APIService>>>;
    /// All known registrations
    fn list(&self) -> Result<Vec<Arc<APIService>>>;
}

/// Lookup of backing Services
pub trait ServiceLister: Send + Sync {
    /// Service `namespace/name`, `None` if it does not exist
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>>;
}

impl RegistrationLister for Store<APIService> {
    fn get(&self, key: &str) -> Result<Option<Arc<APIService>>> {
        Ok(Store::get(self, &object_ref_from_key(key)))
    }

    fn list(&self) -> Result<Vec<Arc<APIService>>> {
        Ok(self.state())
    }
}

impl ServiceLister for Store<Service> {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>> {
        Ok(Store::get(self, &ObjectRef::new(name).within(namespace)))
    }
}

/// Reports whether a cache has completed its initial list
pub trait HasSynced: Send + Sync {
    fn has_synced(&self) -> bool;
}

/// HasSynced backed by an atomic flag
#[derive(Debug, Default)]
pub struct SyncFlag(AtomicBool);

impl SyncFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_synced(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl HasSynced for SyncFlag {
    fn has_synced(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// In-memory cache keyed by [`object_key`]
pub struct MemoryStore<K> {
    objects: RwLock<BTreeMap<String, Arc<K>>>,
}

impl<K: Resource> MemoryStore<K> {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert or replace an object
    pub fn insert(&self, obj: K) -> Result<()> {
        let key = object_key(&obj)?;
        self.objects.write().insert(key, Arc::new(obj));
        Ok(())
    }

    /// Remove the object stored under `key`
    pub fn remove(&self, key: &str) -> Option<Arc<K>> {
        self.objects.write().remove(key)
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        self.objects.read().get(key).cloned()
    }

    pub fn list_all(&self) -> Vec<Arc<K>> {
        self.objects.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Resource> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationLister for MemoryStore<APIService> {
    fn get(&self, key: &str) -> Result<Option<Arc<APIService>>> {
        Ok(self.get_by_key(key))
    }

    fn list(&self) -> Result<Vec<Arc<APIService>>> {
        Ok(self.list_all())
    }
}

impl ServiceLister for MemoryStore<Service> {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>> {
        Ok(self.get_by_key(&format!("{}/{}", namespace, name)))
    }
}
