//! Cache instances and the read-through state machine.
//!
//! Every call binds its arguments, derives a [`CacheKey`] and then either
//! replays a stored artifact or runs the computation, stores its result and
//! replays that. Callers always get the replayed form back, so a first call
//! and a cached call return exactly the same thing.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::computation::Computation;
use super::expire::Expire;
use super::inventory::remove_keys;
use super::metadata::CacheRecord;
use super::path::{artifact_prefix, metadata_prefix};
use super::registry::{CacheRegistry, FunctionRegistry, RegisteredFunction};
use crate::config::{CacheSection, Config, ExpireSetting, env_disabled};
use crate::error::{CacheError, CacheResult};
use crate::formatter::{self, Artifact, Formatter, JsonFormatter, Records, Stored};
use crate::hasher::{self, Hasher, Sha256Hasher};
use crate::identity::{
    BoundArguments, CacheKey, CallArgs, ExecutionIdentity, FunctionIdentity, Signature,
};
use crate::runtime::{DEFAULT_CAPACITY, StreamBridge};
use crate::storage::Storage;

/// A named cache: default components plus the computations wrapped by it.
///
/// Cloning is cheap and clones share their registry.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    name: String,
    storage: Arc<dyn Storage>,
    formatter: Arc<dyn Formatter>,
    hasher: Arc<dyn Hasher>,
    disable: bool,
    section: CacheSection,
    stream_capacity: usize,
    functions: FunctionRegistry,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.inner.name)
            .field("storage", &self.inner.storage)
            .field("formatter", &self.inner.formatter.name())
            .field("hasher", &self.inner.hasher.name())
            .field("disable", &self.inner.disable)
            .field("functions", &self.inner.functions.len())
            .finish()
    }
}

pub struct CacheBuilder {
    name: String,
    storage: Option<Arc<dyn Storage>>,
    formatter: Option<Arc<dyn Formatter>>,
    hasher: Option<Arc<dyn Hasher>>,
    disable: Option<bool>,
    config: Option<Config>,
    stream_capacity: usize,
}

impl CacheBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: None,
            formatter: None,
            hasher: None,
            disable: None,
            config: None,
            stream_capacity: DEFAULT_CAPACITY,
        }
    }

    #[must_use]
    pub fn storage(self, storage: impl Storage + 'static) -> Self {
        self.shared_storage(Arc::new(storage))
    }

    #[must_use]
    pub fn shared_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn formatter(mut self, formatter: impl Formatter + 'static) -> Self {
        self.formatter = Some(Arc::new(formatter));
        self
    }

    #[must_use]
    pub fn hasher(mut self, hasher: impl Hasher + 'static) -> Self {
        self.hasher = Some(Arc::new(hasher));
        self
    }

    #[must_use]
    pub fn disable(mut self, disable: bool) -> Self {
        self.disable = Some(disable);
        self
    }

    /// Uses `config` instead of discovering configuration files.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Items buffered between a streaming computation and the store.
    #[must_use]
    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> CacheResult<Cache> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(CacheError::IdentityUnresolvable {
                reason: "a cache needs a non-empty name".to_string(),
            });
        }

        let config = match self.config {
            Some(config) => config,
            None => Config::load(None)?,
        };
        let section = config.cache(&name).cloned().unwrap_or_default();

        let storage = match self.storage {
            Some(storage) => storage,
            None => Arc::new(section.local_storage()?),
        };
        let formatter = match self.formatter {
            Some(formatter) => formatter,
            None => match section.formatter.as_deref() {
                Some(configured) => formatter::by_name(configured)?,
                None => Arc::new(JsonFormatter),
            },
        };
        let hasher = match self.hasher {
            Some(hasher) => hasher,
            None => match section.hasher.as_deref() {
                Some(configured) => hasher::by_name(configured)?,
                None => Arc::new(Sha256Hasher),
            },
        };
        let disable = self
            .disable
            .or(section.disable)
            .unwrap_or_else(env_disabled);

        info!(
            cache = %name,
            storage = ?storage,
            formatter = formatter.name(),
            hasher = hasher.name(),
            disable,
            "cache ready"
        );

        Ok(Cache {
            inner: Arc::new(CacheInner {
                name,
                storage,
                formatter,
                hasher,
                disable,
                section,
                stream_capacity: self.stream_capacity,
                functions: FunctionRegistry::default(),
            }),
        })
    }
}

/// Per-computation overrides; unset fields fall back to configuration and
/// then to the cache.
#[derive(Debug, Clone, Default)]
pub struct WrapOptions {
    storage: Option<Arc<dyn Storage>>,
    formatter: Option<Arc<dyn Formatter>>,
    hasher: Option<Arc<dyn Hasher>>,
    ignore: Option<BTreeSet<String>>,
    expire: Option<Expire>,
    disable: Option<bool>,
}

impl WrapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    #[must_use]
    pub fn formatter(mut self, formatter: impl Formatter + 'static) -> Self {
        self.formatter = Some(Arc::new(formatter));
        self
    }

    #[must_use]
    pub fn hasher(mut self, hasher: impl Hasher + 'static) -> Self {
        self.hasher = Some(Arc::new(hasher));
        self
    }

    /// Parameters left out of the execution identity.
    #[must_use]
    pub fn ignore<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore = Some(names.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn expire(mut self, expire: impl Into<Expire>) -> Self {
        self.expire = Some(expire.into());
        self
    }

    #[must_use]
    pub fn disable(mut self, disable: bool) -> Self {
        self.disable = Some(disable);
        self
    }
}

impl Cache {
    pub fn builder(name: impl Into<String>) -> CacheBuilder {
        CacheBuilder::new(name)
    }

    /// A cache previously bound with [`CacheRegistry::register`] on the
    /// global registry.
    pub fn by_name(name: &str) -> Option<Self> {
        CacheRegistry::global().lookup(name)
    }

    /// Binds this cache to its name in the global registry.
    pub fn register(&self) -> CacheResult<()> {
        CacheRegistry::global().register(self)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.disable
    }

    pub(crate) fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn wrap<F>(&self, computation: Computation<F>) -> CacheResult<Cached<F>> {
        self.wrap_with(computation, WrapOptions::default())
    }

    /// Wraps `computation` and registers it as live, so [`Cache::prune`]
    /// keeps its entries.
    pub fn wrap_with<F>(
        &self,
        computation: Computation<F>,
        options: WrapOptions,
    ) -> CacheResult<Cached<F>> {
        let signature = computation.def().signature().clone();
        signature.validate()?;
        let identity = computation.identity().clone();
        let configured = self
            .inner
            .section
            .function(&identity.qualified_name)
            .cloned()
            .unwrap_or_default();

        let storage = options
            .storage
            .unwrap_or_else(|| Arc::clone(&self.inner.storage));
        let formatter = options
            .formatter
            .unwrap_or_else(|| Arc::clone(&self.inner.formatter));
        let hasher = options
            .hasher
            .unwrap_or_else(|| Arc::clone(&self.inner.hasher));

        let ignore = options
            .ignore
            .or_else(|| configured.ignore_set())
            .unwrap_or_default();
        for name in ignore.iter().filter(|name| !signature.contains(name)) {
            warn!(
                function = %identity.qualified_name,
                parameter = %name,
                "ignored parameter is not part of the signature"
            );
        }

        let expire = match options.expire {
            Some(expire) => Some(expire),
            None => configured
                .expire
                .as_ref()
                .map(ExpireSetting::to_expire)
                .transpose()?,
        };
        let expired_at = expire.map(|expire| expire.resolve(Utc::now()));
        let disable = options
            .disable
            .or(configured.disable)
            .unwrap_or(self.inner.disable);

        let function_hash = identity.hash(hasher.as_ref())?;
        let fresh = self.inner.functions.register(
            function_hash.clone(),
            RegisteredFunction {
                identity: identity.clone(),
                storage: Arc::clone(&storage),
            },
        );
        debug!(
            cache = %self.inner.name,
            function = %identity.qualified_name,
            function_hash = %function_hash,
            fresh,
            "computation wrapped"
        );

        Ok(Cached {
            computation,
            handle: Arc::new(FunctionHandle {
                identity,
                function_hash,
                signature,
                storage,
                formatter,
                hasher,
                ignore,
                expired_at,
                disable,
                stream_capacity: self.inner.stream_capacity,
            }),
        })
    }

    /// Whether any unexpired entry of `identity` is stored.
    pub fn exists(&self, identity: &FunctionIdentity) -> CacheResult<bool> {
        let now = Utc::now();
        for (function_hash, storage) in self.locations(identity)? {
            for metadata_key in storage.filter(&metadata_prefix(&function_hash))? {
                let Some(key) = CacheKey::parse(&metadata_key) else {
                    continue;
                };
                match CacheRecord::read_from(storage.as_ref(), &metadata_key) {
                    Ok(record) if !record.is_expired_at(now) && storage.exists(&key.to_string()) => {
                        return Ok(true);
                    }
                    Ok(_) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(false)
    }

    /// Removes stored entries of `identity`, optionally only those whose
    /// execution hash starts with `execution_prefix`. Returns how many keys
    /// were deleted.
    pub fn remove(
        &self,
        identity: &FunctionIdentity,
        execution_prefix: Option<&str>,
    ) -> CacheResult<usize> {
        let suffix = execution_prefix.unwrap_or_default();
        let mut removed = 0;
        for (function_hash, storage) in self.locations(identity)? {
            let mut keys = storage.filter(&format!("{}{suffix}", artifact_prefix(&function_hash)))?;
            keys.extend(storage.filter(&format!("{}{suffix}", metadata_prefix(&function_hash)))?);
            removed += remove_keys(storage.as_ref(), keys)?.len();
        }
        info!(
            cache = %self.inner.name,
            function = %identity.qualified_name,
            removed,
            "entries removed"
        );
        Ok(removed)
    }

    /// Keys that [`Cache::prune`] would delete: everything in the cache's
    /// stores that belongs to no live computation.
    pub fn stale_keys(&self) -> CacheResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .sweep_plan()?
            .into_iter()
            .flat_map(|(_, keys)| keys)
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Deletes every stored key that belongs to no live computation and
    /// returns the deleted keys.
    pub fn prune(&self) -> CacheResult<Vec<String>> {
        let mut removed = Vec::new();
        for (storage, keys) in self.sweep_plan()? {
            removed.extend(remove_keys(storage.as_ref(), keys)?);
        }
        removed.sort();
        info!(cache = %self.inner.name, removed = removed.len(), "cache pruned");
        Ok(removed)
    }

    /// Live computations, ordered by qualified name.
    pub fn functions(&self) -> Vec<FunctionIdentity> {
        let mut identities: Vec<FunctionIdentity> = self
            .inner
            .functions
            .snapshot()
            .into_iter()
            .map(|(_, function)| function.identity)
            .collect();
        identities.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        identities.dedup();
        identities
    }

    /// Metadata of every stored entry of `identity`, oldest first.
    pub fn info(&self, identity: &FunctionIdentity) -> CacheResult<Vec<CacheRecord>> {
        let mut records = Vec::new();
        for (function_hash, storage) in self.locations(identity)? {
            for metadata_key in storage.filter(&metadata_prefix(&function_hash))? {
                match CacheRecord::read_from(storage.as_ref(), &metadata_key) {
                    Ok(record) => records.push(record),
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
        }
        records.sort_by_key(|record| record.executed_at);
        Ok(records)
    }

    /// Forgets `identity`, so the next prune deletes its entries. Returns
    /// whether it was registered.
    pub fn unregister(&self, identity: &FunctionIdentity) -> bool {
        let registrations = self.inner.functions.find(identity);
        for (function_hash, _) in &registrations {
            self.inner.functions.unregister(function_hash);
        }
        !registrations.is_empty()
    }

    /// Where entries of `identity` live: every registration, or the cache
    /// defaults for a computation that was never wrapped here.
    fn locations(&self, identity: &FunctionIdentity) -> CacheResult<Vec<(String, Arc<dyn Storage>)>> {
        let registrations = self.inner.functions.find(identity);
        if registrations.is_empty() {
            let function_hash = identity.hash(self.inner.hasher.as_ref())?;
            return Ok(vec![(function_hash, Arc::clone(&self.inner.storage))]);
        }
        Ok(registrations
            .into_iter()
            .map(|(function_hash, function)| (function_hash, function.storage))
            .collect())
    }

    fn sweep_plan(&self) -> CacheResult<Vec<(Arc<dyn Storage>, Vec<String>)>> {
        let live = self.inner.functions.snapshot();
        let prefixes: Vec<String> = live
            .iter()
            .flat_map(|(function_hash, _)| {
                [artifact_prefix(function_hash), metadata_prefix(function_hash)]
            })
            .collect();

        let mut storages: Vec<Arc<dyn Storage>> = vec![Arc::clone(&self.inner.storage)];
        for (_, function) in live {
            if !storages.iter().any(|known| same_storage(known, &function.storage)) {
                storages.push(function.storage);
            }
        }

        storages
            .into_iter()
            .map(|storage| {
                let stale = storage
                    .all()?
                    .into_iter()
                    .filter(|key| !prefixes.iter().any(|prefix| key.starts_with(prefix)))
                    .collect();
                Ok((storage, stale))
            })
            .collect()
    }
}

fn same_storage(a: &Arc<dyn Storage>, b: &Arc<dyn Storage>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Resolved settings of one wrapped computation.
struct FunctionHandle {
    identity: FunctionIdentity,
    function_hash: String,
    signature: Signature,
    storage: Arc<dyn Storage>,
    formatter: Arc<dyn Formatter>,
    hasher: Arc<dyn Hasher>,
    ignore: BTreeSet<String>,
    expired_at: Option<DateTime<Utc>>,
    disable: bool,
    stream_capacity: usize,
}

enum Lookup {
    Bypass(BoundArguments),
    Hit(CacheKey),
    Miss {
        key: CacheKey,
        bound: BoundArguments,
        execution: ExecutionIdentity,
    },
}

impl FunctionHandle {
    fn lookup(&self, args: &CallArgs) -> CacheResult<Lookup> {
        let bound = self.signature.bind(&self.identity.qualified_name, args)?;
        if self.disable {
            debug!(function = %self.identity.qualified_name, "caching disabled; calling through");
            return Ok(Lookup::Bypass(bound));
        }

        let execution = ExecutionIdentity::build(&bound, &self.ignore);
        let key = CacheKey::new(
            self.function_hash.clone(),
            execution.hash(self.hasher.as_ref())?,
        );

        if self.is_fresh(&key)? {
            debug!(function = %self.identity.qualified_name, key = %key, "cache hit");
            Ok(Lookup::Hit(key))
        } else {
            debug!(function = %self.identity.qualified_name, key = %key, "cache miss");
            Ok(Lookup::Miss {
                key,
                bound,
                execution,
            })
        }
    }

    /// A usable entry needs unexpired metadata and its artifact. Expired
    /// entries are evicted on the way.
    fn is_fresh(&self, key: &CacheKey) -> CacheResult<bool> {
        let metadata_key = key.metadata_key();
        if !self.storage.exists(&metadata_key) {
            return Ok(false);
        }

        let record = match CacheRecord::read_from(self.storage.as_ref(), &metadata_key) {
            Ok(record) => record,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err @ CacheError::Serialization { .. }) => {
                warn!(key = %key, error = %err, "unreadable cache record; evicting entry");
                self.evict(key)?;
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        if record.is_expired_at(Utc::now()) {
            info!(
                function = %self.identity.qualified_name,
                key = %key,
                expired_at = ?record.expired_at,
                "evicting expired entry"
            );
            self.evict(key)?;
            return Ok(false);
        }

        Ok(self.storage.exists(&key.to_string()))
    }

    fn evict(&self, key: &CacheKey) -> CacheResult<()> {
        remove_keys(
            self.storage.as_ref(),
            vec![key.to_string(), key.metadata_key()],
        )
        .map(drop)
    }

    /// Writes metadata, then the artifact. A failed artifact write takes
    /// its metadata with it.
    fn store(
        &self,
        key: &CacheKey,
        execution: &ExecutionIdentity,
        artifact: Artifact<'_>,
    ) -> CacheResult<()> {
        let metadata_key = key.metadata_key();
        CacheRecord::new(self.identity.clone(), execution, self.expired_at)
            .write_to(self.storage.as_ref(), &metadata_key)?;

        match self.write_artifact(key, artifact) {
            Ok(records) => {
                info!(
                    function = %self.identity.qualified_name,
                    key = %key,
                    records,
                    "artifact stored"
                );
                Ok(())
            }
            Err(err) => {
                if let Err(cleanup) = self.storage.remove(&metadata_key) {
                    if !cleanup.is_not_found() {
                        warn!(key = %metadata_key, error = %cleanup, "failed to drop orphaned metadata");
                    }
                }
                Err(err)
            }
        }
    }

    /// Stores a freshly computed value and serves the stored copy. A value
    /// whose encoded form would not decode back is returned uncached.
    fn store_value<T>(&self, key: &CacheKey, execution: &ExecutionIdentity, value: T) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let encoded = match encode_record(&value) {
            Ok(encoded) => encoded,
            Err(err @ CacheError::Serialization { .. }) => {
                warn!(
                    function = %self.identity.qualified_name,
                    key = %key,
                    error = %err,
                    "result cannot be stored faithfully; returning it uncached"
                );
                return Ok(value);
            }
            Err(err) => return Err(err),
        };
        self.store(key, execution, Artifact::Value(encoded))?;
        self.load_value(key)
    }

    fn write_artifact(&self, key: &CacheKey, artifact: Artifact<'_>) -> CacheResult<usize> {
        let key = key.to_string();
        let mut writer = self
            .storage
            .open(&key, self.formatter.write_mode())?
            .into_writer(&key)?;
        let records = formatter::write(self.formatter.as_ref(), &mut writer, artifact)
            .map_err(|err| err.located(&key))?;
        writer.commit()?;
        Ok(records)
    }

    fn load(&self, key: &CacheKey) -> CacheResult<Stored> {
        let key = key.to_string();
        let reader = self
            .storage
            .open(&key, self.formatter.read_mode())?
            .into_reader(&key)?;
        formatter::read(Arc::clone(&self.formatter), reader).map_err(|err| err.located(&key))
    }

    fn load_value<T: DeserializeOwned>(&self, key: &CacheKey) -> CacheResult<T> {
        let stored = self.load(key)?.into_value().map_err(|err| err.located(key.to_string()))?;
        decode(stored)
    }

    fn load_records<T>(&self, key: &CacheKey) -> CacheResult<TypedRecords<T>> {
        Ok(TypedRecords {
            records: self.load(key)?.into_records()?,
            key: key.to_string(),
            _marker: PhantomData,
        })
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> CacheResult<Value> {
    serde_json::to_value(value).map_err(CacheError::serialization)
}

/// Encodes `value` and checks that the encoding decodes back into `T`.
/// Non-finite floats, for one, encode as `null` and would not.
fn encode_record<T: Serialize + DeserializeOwned>(value: &T) -> CacheResult<Value> {
    let encoded = encode(value)?;
    decode::<T>(encoded.clone())?;
    Ok(encoded)
}

fn decode<T: DeserializeOwned>(value: Value) -> CacheResult<T> {
    serde_json::from_value(value).map_err(CacheError::serialization)
}

/// A computation wrapped by a [`Cache`].
///
/// Which calling convention applies follows from the body: [`Cached::call`]
/// for plain results, [`Cached::call_iter`] for sequences,
/// [`Cached::call_async`] for futures and [`Cached::call_stream`] for
/// futures resolving to streams.
pub struct Cached<F> {
    computation: Computation<F>,
    handle: Arc<FunctionHandle>,
}

impl<F> fmt::Debug for Cached<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cached")
            .field("function", &self.handle.identity.qualified_name)
            .field("function_hash", &self.handle.function_hash)
            .field("expired_at", &self.handle.expired_at)
            .field("disable", &self.handle.disable)
            .finish_non_exhaustive()
    }
}

impl<F> Cached<F> {
    pub fn computation(&self) -> &Computation<F> {
        &self.computation
    }

    pub fn identity(&self) -> &FunctionIdentity {
        &self.handle.identity
    }

    pub fn function_hash(&self) -> &str {
        &self.handle.function_hash
    }

    pub fn expired_at(&self) -> Option<DateTime<Utc>> {
        self.handle.expired_at
    }

    pub fn is_disabled(&self) -> bool {
        self.handle.disable
    }

    /// The key a call with `args` reads and writes.
    pub fn key_for(&self, args: &CallArgs) -> CacheResult<CacheKey> {
        let bound = self.handle.signature.bind(&self.handle.identity.qualified_name, args)?;
        let execution = ExecutionIdentity::build(&bound, &self.handle.ignore);
        Ok(CacheKey::new(
            self.handle.function_hash.clone(),
            execution.hash(self.handle.hasher.as_ref())?,
        ))
    }

    pub fn call<T>(&self, args: CallArgs) -> CacheResult<T>
    where
        F: Fn(BoundArguments) -> anyhow::Result<T>,
        T: Serialize + DeserializeOwned,
    {
        let body = self.computation.body();
        match self.handle.lookup(&args)? {
            Lookup::Bypass(bound) => body(bound).map_err(CacheError::from_computation),
            Lookup::Hit(key) => self.handle.load_value(&key),
            Lookup::Miss {
                key,
                bound,
                execution,
            } => {
                let value = body(bound).map_err(CacheError::from_computation)?;
                self.handle.store_value(&key, &execution, value)
            }
        }
    }

    /// Lazy sequences are stored element by element as the body's iterator
    /// drains; the returned iterator replays the stored artifact.
    pub fn call_iter<I, T>(&self, args: CallArgs) -> CacheResult<ArtifactIter<T>>
    where
        F: Fn(BoundArguments) -> anyhow::Result<I>,
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
        T: Serialize + DeserializeOwned + 'static,
    {
        let body = self.computation.body();
        match self.handle.lookup(&args)? {
            Lookup::Bypass(bound) => {
                let items = body(bound).map_err(CacheError::from_computation)?;
                Ok(ArtifactIter {
                    source: Source::Direct(Box::new(items.into_iter())),
                })
            }
            Lookup::Hit(key) => Ok(ArtifactIter::stored(self.handle.load_records(&key)?)),
            Lookup::Miss {
                key,
                bound,
                execution,
            } => {
                let items = body(bound).map_err(CacheError::from_computation)?;
                let records = items.into_iter().map(|item| encode_record(&item));
                self.handle
                    .store(&key, &execution, Artifact::Sequence(Box::new(records)))?;
                Ok(ArtifactIter::stored(self.handle.load_records(&key)?))
            }
        }
    }

    pub async fn call_async<Fut, T>(&self, args: CallArgs) -> CacheResult<T>
    where
        F: Fn(BoundArguments) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        T: Serialize + DeserializeOwned,
    {
        let body = self.computation.body();
        match self.handle.lookup(&args)? {
            Lookup::Bypass(bound) => body(bound).await.map_err(CacheError::from_computation),
            Lookup::Hit(key) => self.handle.load_value(&key),
            Lookup::Miss {
                key,
                bound,
                execution,
            } => {
                let value = body(bound).await.map_err(CacheError::from_computation)?;
                self.handle.store_value(&key, &execution, value)
            }
        }
    }

    /// The body's stream is drained on a producer thread through a
    /// [`StreamBridge`] while a blocking worker stores it. The returned
    /// stream replays the stored artifact.
    pub async fn call_stream<Fut, S, T>(&self, args: CallArgs) -> CacheResult<ArtifactStream<T>>
    where
        F: Fn(BoundArguments) -> Fut,
        Fut: Future<Output = anyhow::Result<S>>,
        S: Stream<Item = T> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let body = self.computation.body();
        match self.handle.lookup(&args)? {
            Lookup::Bypass(bound) => {
                let items = body(bound).await.map_err(CacheError::from_computation)?;
                Ok(items.map(Ok).boxed())
            }
            Lookup::Hit(key) => Ok(stream::iter(self.handle.load_records::<T>(&key)?).boxed()),
            Lookup::Miss {
                key,
                bound,
                execution,
            } => {
                let items = body(bound).await.map_err(CacheError::from_computation)?;
                let handle = Arc::clone(&self.handle);
                let target = key.clone();
                let store = move || handle.store_stream(&target, &execution, items);

                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => runtime.spawn_blocking(store).await.map_err(|err| {
                        CacheError::Background {
                            reason: format!("stream store worker failed: {err}"),
                        }
                    })??,
                    Err(_) => store()?,
                }
                Ok(stream::iter(self.handle.load_records::<T>(&key)?).boxed())
            }
        }
    }
}

impl FunctionHandle {
    fn store_stream<S, T>(&self, key: &CacheKey, execution: &ExecutionIdentity, items: S) -> CacheResult<()>
    where
        S: Stream<Item = T> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let mut bridge = StreamBridge::spawn(items, self.stream_capacity)?;
        let records = bridge.by_ref().map(|item| encode_record(&item));
        let stored = self.store(key, execution, Artifact::Sequence(Box::new(records)));
        let finished = bridge.finish();
        stored.and(finished)
    }
}

/// Stored records decoded one at a time.
struct TypedRecords<T> {
    records: Records,
    key: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Iterator for TypedRecords<T> {
    type Item = CacheResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next().map(|record| {
            record
                .map_err(|err| err.located(&self.key))
                .and_then(decode)
        })
    }
}

/// Replays a sequence result element by element.
pub struct ArtifactIter<T> {
    source: Source<T>,
}

enum Source<T> {
    Stored(TypedRecords<T>),
    /// Caching disabled: the body's own iterator.
    Direct(Box<dyn Iterator<Item = T>>),
}

impl<T> ArtifactIter<T> {
    fn stored(records: TypedRecords<T>) -> Self {
        Self {
            source: Source::Stored(records),
        }
    }
}

impl<T: DeserializeOwned> Iterator for ArtifactIter<T> {
    type Item = CacheResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            Source::Stored(records) => records.next(),
            Source::Direct(items) => items.next().map(Ok),
        }
    }
}

impl<T> fmt::Debug for ArtifactIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            Source::Stored(_) => "stored",
            Source::Direct(_) => "direct",
        };
        f.debug_struct("ArtifactIter").field("source", &source).finish()
    }
}

/// Replays a streamed result element by element.
pub type ArtifactStream<T> = BoxStream<'static, CacheResult<T>>;
