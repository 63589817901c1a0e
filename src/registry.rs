//! Read-mostly instance registry.
//!
//! Requests resolve instances against an immutable map; reconfiguration
//! builds a fresh map and swaps the inner pointer. A request that already
//! holds its `Arc<InstanceConfig>` keeps seeing the configuration it was
//! admitted under, however long it streams.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::RwLock;

use crate::config::InstanceConfig;

type InstanceMap = HashMap<String, Arc<InstanceConfig>>;

/// Lookup table `name → InstanceConfig`.
pub struct InstanceRegistry {
    inner: RwLock<Arc<InstanceMap>>,
}

impl InstanceRegistry {
    pub fn new(instances: &BTreeMap<String, InstanceConfig>) -> Self {
        Self {
            inner: RwLock::new(Arc::new(build_map(instances))),
        }
    }

    /// Resolve an instance by name.
    pub fn get(&self, name: &str) -> Option<Arc<InstanceConfig>> {
        self.inner.read().get(name).cloned()
    }

    /// Replace the whole table atomically. In-flight requests keep their
    /// snapshot; new requests see the new table.
    pub fn replace_all(&self, instances: &BTreeMap<String, InstanceConfig>) {
        let map = Arc::new(build_map(instances));
        *self.inner.write() = map;
    }

    /// A consistent snapshot of the current table (debug endpoint, logging).
    pub fn snapshot(&self) -> Arc<InstanceMap> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

fn build_map(instances: &BTreeMap<String, InstanceConfig>) -> InstanceMap {
    instances
        .iter()
        .map(|(name, config)| (name.clone(), Arc::new(config.clone())))
        .collect()
}
