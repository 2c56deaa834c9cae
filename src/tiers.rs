//! Two explicit cache tiers behind one type: a bounded in-process near-cache over a distributed cache.
//!
//! The near-cache is optional. Invalidation of near-caches held by other repository instances (other nodes) goes
//! through the distributed backend's [`publish`](DistributedCache::publish)/[`subscribe`](DistributedCache::subscribe)
//! hooks.
//!
//! Writes of the same key made through one instance are serialized with a striped lock, so the order in which values
//! reach the caches is the order in which they reach the database.

use std::fmt::Debug;
use std::hash::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use moka::future::Cache;
use moka::ops::compute::Op;
use moka::policy::EvictionPolicy;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::MutexGuard;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::codec;
use crate::entry::CacheEntry;
use crate::strategy::CacheStrategy;
use crate::traits::DistributedCache;
use crate::types::CacheKey;
use crate::types::Invalidation;
use crate::types::InvalidationTarget;

const WRITE_LOCK_STRIPES: usize = 64;

pub struct TwoLevelCache<E>
where
    E: Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    namespace:   String,
    origin:      u64,
    near:        Option<Cache<String, CacheEntry<E>>>,
    remote:      Arc<dyn DistributedCache>,
    strategy:    CacheStrategy,
    listener:    Mutex<Option<JoinHandle<()>>>,
    write_locks: Vec<tokio::sync::Mutex<()>>,
}

impl<E> TwoLevelCache<E>
where
    E: Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new<S: ToString>(namespace: S, remote: Arc<dyn DistributedCache>, strategy: CacheStrategy) -> Self {
        let namespace = namespace.to_string();
        let near = strategy.near_cache_enabled().then(|| {
            let mut builder = Cache::builder()
                .name(&namespace)
                .max_capacity(strategy.near_cache_capacity())
                .eviction_policy(EvictionPolicy::tiny_lfu());
            if !strategy.ttl().is_zero() {
                builder = builder.time_to_live(strategy.ttl());
            }
            builder.build()
        });

        Self {
            namespace,
            origin: rand::random(),
            near,
            remote,
            strategy,
            listener: Mutex::new(None),
            write_locks: (0..WRITE_LOCK_STRIPES).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Random identity of this instance in invalidation notices.
    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn key_for<I: std::fmt::Display + ?Sized>(&self, id: &I) -> CacheKey {
        CacheKey::new(&self.namespace, id)
    }

    fn stripe(&self, key: &CacheKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.as_str().hash(&mut hasher);
        (hasher.finish() % self.write_locks.len() as u64) as usize
    }

    /// Hold off other writers of the key until the guard is dropped.
    pub async fn lock_key(&self, key: &CacheKey) -> MutexGuard<'_, ()> {
        self.write_locks[self.stripe(key)].lock().await
    }

    /// Lock several keys at once. Stripes are always taken in the same order.
    pub async fn lock_keys<'k, I>(&self, keys: I) -> Vec<MutexGuard<'_, ()>>
    where
        I: IntoIterator<Item = &'k CacheKey>,
    {
        let mut stripes = keys.into_iter().map(|key| self.stripe(key)).collect::<Vec<_>>();
        stripes.sort_unstable();
        stripes.dedup();

        let mut guards = Vec::with_capacity(stripes.len());
        for stripe in stripes {
            guards.push(self.write_locks[stripe].lock().await);
        }
        guards
    }

    pub fn near(&self) -> Option<&Cache<String, CacheEntry<E>>> {
        self.near.as_ref()
    }

    pub async fn get_near(&self, key: &CacheKey) -> Option<CacheEntry<E>> {
        match self.near {
            Some(ref near) => near.get(key.as_str()).await,
            None => None,
        }
    }

    pub async fn contains_near(&self, key: &CacheKey) -> bool {
        self.near.as_ref().is_some_and(|near| near.contains_key(key.as_str()))
    }

    /// Read the distributed tier. Backend failures and undecodable values are both a miss.
    #[instrument(level = "trace", skip(self), fields(ns = %self.namespace))]
    pub async fn get_remote(&self, key: &CacheKey) -> Option<CacheEntry<E>> {
        let bytes = match self.remote.get(key.as_str()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!("[{}] distributed cache read of '{key}' failed, falling through: {err}", self.namespace);
                return None;
            }
        };

        match codec::decode::<E>(&bytes) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("[{}] dropping undecodable value of '{key}': {err}", self.namespace);
                if let Err(err) = self.remote.delete(key.as_str()).await {
                    debug!("[{}] could not delete '{key}': {err}", self.namespace);
                }
                None
            }
        }
    }

    pub async fn put_near(&self, key: &CacheKey, entry: CacheEntry<E>) {
        if let Some(ref near) = self.near {
            near.insert(key.as_str().to_string(), entry).await;
        }
    }

    /// Store the entry in the distributed tier. Returns `false` if the backend didn't take it.
    pub async fn put_remote(&self, key: &CacheKey, entry: &CacheEntry<E>) -> bool {
        let bytes = match codec::encode(entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("[{}] cannot encode '{key}': {err}", self.namespace);
                return false;
            }
        };

        if let Err(err) = self.remote.set(key.as_str(), bytes, self.strategy.ttl()).await {
            warn!("[{}] distributed cache write of '{key}' skipped: {err}", self.namespace);
            return false;
        }

        true
    }

    /// Write both tiers after a change of the entity. Other instances are told to drop their near copies.
    pub async fn put(&self, key: &CacheKey, entry: CacheEntry<E>) {
        if self.put_remote(key, &entry).await {
            self.notify(Invalidation::key(self.origin, key)).await;
        }
        self.put_near(key, entry).await;
    }

    pub async fn evict(&self, key: &CacheKey) {
        if let Some(ref near) = self.near {
            near.invalidate(key.as_str()).await;
        }

        match self.remote.delete(key.as_str()).await {
            Ok(_) => self.notify(Invalidation::key(self.origin, key)).await,
            Err(err) => warn!("[{}] eviction of '{key}' from distributed cache failed: {err}", self.namespace),
        }
    }

    /// Drop the whole namespace from both tiers. Returns the number of distributed keys removed.
    pub async fn evict_all(&self) -> usize {
        if let Some(ref near) = self.near {
            near.invalidate_all();
        }

        let keys = match self.remote.scan_prefix(&CacheKey::prefix(&self.namespace)).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("[{}] cannot scan distributed cache: {err}", self.namespace);
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            match self.remote.delete(&key).await {
                Ok(true) => removed += 1,
                Ok(false) => (),
                Err(err) => warn!("[{}] eviction of '{key}' failed: {err}", self.namespace),
            }
        }

        self.notify(Invalidation::namespace(self.origin, &self.namespace)).await;
        debug!("[{}] evicted {removed} distributed entries", self.namespace);
        removed
    }

    /// Clear the dirty flag of a near-cache entry, but only if it still holds the flushed value. A newer save might
    /// have replaced it in the meantime.
    pub async fn mark_clean(&self, key: &CacheKey, flushed: &E) {
        let Some(ref near) = self.near
        else {
            return;
        };

        near.entry(key.as_str().to_string())
            .and_compute_with(|entry| async move {
                match entry {
                    Some(entry) if entry.value().is_dirty() && entry.value().entity() == flushed => {
                        Op::Put(entry.into_value().into_clean())
                    }
                    _ => Op::Nop,
                }
            })
            .await;
    }

    /// Evict the key if the cache still serves `stale`. The near copy is checked first; without it the distributed one.
    pub async fn evict_if_holds(&self, key: &CacheKey, stale: &E) {
        let cached = match self.get_near(key).await {
            Some(entry) => Some(entry),
            None => self.get_remote(key).await,
        };

        if cached.is_some_and(|entry| entry.entity() == stale) {
            self.evict(key).await;
        }
    }

    pub fn clear_near(&self) {
        if let Some(ref near) = self.near {
            near.invalidate_all();
        }
    }

    async fn notify(&self, invalidation: Invalidation) {
        if let Err(err) = self.remote.publish(invalidation).await {
            debug!("[{}] invalidation notice not published: {err}", self.namespace);
        }
    }

    /// Start listening to invalidation notices from other instances, unless already listening. Does nothing if there is
    /// no near-cache to keep coherent or the backend has no pub/sub.
    pub fn start_listening(&self) {
        let mut listener = self.listener.lock();
        if listener.is_none() {
            *listener = self.listen();
        }
    }

    pub fn stop_listening(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
    }

    fn listen(&self) -> Option<JoinHandle<()>> {
        let near = self.near.clone()?;
        let mut notices = self.remote.subscribe()?;
        let origin = self.origin;
        let namespace = self.namespace.clone();
        let prefix = CacheKey::prefix(&namespace);

        Some(tokio::spawn(async move {
            debug!("[{namespace}] listening to invalidations");
            loop {
                match notices.recv().await {
                    Ok(Invalidation {
                        target: InvalidationTarget::All,
                        ..
                    }) => {
                        debug!("[{namespace}] clearing near-cache on backend request");
                        near.invalidate_all();
                    }
                    Ok(notice) if notice.origin == origin => (),
                    Ok(notice) => match notice.target {
                        InvalidationTarget::Key(key) if key.starts_with(&prefix) => near.invalidate(&key).await,
                        InvalidationTarget::Namespace(ns) if ns == namespace => near.invalidate_all(),
                        _ => (),
                    },
                    Err(RecvError::Lagged(missed)) => {
                        // Can't tell which keys were touched.
                        warn!("[{namespace}] missed {missed} invalidation notices, clearing near-cache");
                        near.invalidate_all();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("[{namespace}] invalidation listener stopped");
        }))
    }
}

impl<E> Drop for TwoLevelCache<E>
where
    E: Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.stop_listening();
    }
}

impl<E> Debug for TwoLevelCache<E>
where
    E: Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoLevelCache")
            .field("namespace", &self.namespace)
            .field("near", &self.near.is_some())
            .finish()
    }
}
