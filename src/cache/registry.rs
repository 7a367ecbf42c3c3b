use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::engine::Cache;
use crate::error::{CacheError, CacheResult};
use crate::identity::FunctionIdentity;
use crate::storage::Storage;

/// A computation wrapped by a cache, and where its entries live.
#[derive(Debug, Clone)]
pub struct RegisteredFunction {
    pub identity: FunctionIdentity,
    pub storage: Arc<dyn Storage>,
}

/// Live computations of one cache, keyed by function hash.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: RwLock<BTreeMap<String, RegisteredFunction>>,
}

impl FunctionRegistry {
    /// Returns `false` when the hash was already registered; the newer
    /// registration wins.
    pub fn register(&self, function_hash: String, function: RegisteredFunction) -> bool {
        self.functions.write().insert(function_hash, function).is_none()
    }

    pub fn unregister(&self, function_hash: &str) -> Option<RegisteredFunction> {
        self.functions.write().remove(function_hash)
    }

    pub fn get(&self, function_hash: &str) -> Option<RegisteredFunction> {
        self.functions.read().get(function_hash).cloned()
    }

    /// Every registration of `identity`. One identity may be registered
    /// under several hashers.
    pub fn find(&self, identity: &FunctionIdentity) -> Vec<(String, RegisteredFunction)> {
        self.functions
            .read()
            .iter()
            .filter(|(_, function)| &function.identity == identity)
            .map(|(hash, function)| (hash.clone(), function.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<(String, RegisteredFunction)> {
        self.functions
            .read()
            .iter()
            .map(|(hash, function)| (hash.clone(), function.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }
}

static GLOBAL: Lazy<CacheRegistry> = Lazy::new(CacheRegistry::new);

/// Named cache instances, so a cache can be looked up by name from anywhere
/// in the program.
#[derive(Debug, Default)]
pub struct CacheRegistry {
    caches: Mutex<BTreeMap<String, Cache>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Binds `cache` to its name. Registering the same instance twice is a
    /// no-op; a different instance under a taken name is rejected.
    pub fn register(&self, cache: &Cache) -> CacheResult<()> {
        match self.caches.lock().entry(cache.name().to_string()) {
            Entry::Occupied(existing) if existing.get().same_instance(cache) => Ok(()),
            Entry::Occupied(existing) => Err(CacheError::IdentityUnresolvable {
                reason: format!(
                    "cache name `{}` is already bound to another cache instance",
                    existing.key()
                ),
            }),
            Entry::Vacant(slot) => {
                debug!(cache = %cache.name(), "cache registered");
                slot.insert(cache.clone());
                Ok(())
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Cache> {
        self.caches.lock().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Cache> {
        self.caches.lock().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.caches.lock().keys().cloned().collect()
    }
}
