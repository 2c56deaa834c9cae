use std::fmt::Debug;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use tokio::sync::broadcast;

use crate::error::CacheUnavailableError;
use crate::traits::DistributedCache;
use crate::types::Invalidation;

const NOTICE_CAPACITY: usize = 1024;

#[derive(Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    ttl:   Duration,
}

// Every value carries its own time-to-live.
struct PerValueTtl;

impl Expiry<String, StoredValue> for PerValueTtl {
    fn expire_after_create(&self, _key: &String, value: &StoredValue, _created_at: Instant) -> Option<Duration> {
        (!value.ttl.is_zero()).then_some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        (!value.ttl.is_zero()).then_some(value.ttl)
    }
}

/// In-process stand-in for a distributed cache.
///
/// Repositories sharing one `MemoryCache` (cloning shares it too) behave like nodes sharing a Redis server, including
/// invalidation notices. Useful for tests and for single-process deployments.
#[derive(Clone)]
pub struct MemoryCache {
    values:  Cache<String, StoredValue>,
    notices: broadcast::Sender<Invalidation>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(100_000)
    }

    pub fn with_capacity(max_capacity: u64) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            values: Cache::builder()
                .name("distributed")
                .max_capacity(max_capacity)
                .expire_after(PerValueTtl)
                .build(),
            notices,
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.values.entry_count()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Put raw bytes under a key, bypassing any encoding.
    pub async fn set_raw(&self, key: &str, bytes: Vec<u8>) {
        self.values
            .insert(
                key.to_string(),
                StoredValue {
                    bytes,
                    ttl: Duration::ZERO,
                },
            )
            .await;
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.values.entry_count())
            .field("subscribers", &self.notices.receiver_count())
            .finish()
    }
}

#[async_trait]
impl DistributedCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheUnavailableError> {
        Ok(self.values.get(key).await.map(|value| value.bytes))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheUnavailableError> {
        self.values
            .insert(key.to_string(), StoredValue { bytes: value, ttl })
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheUnavailableError> {
        Ok(self.values.remove(key).await.is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheUnavailableError> {
        Ok(self
            .values
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.as_ref().clone())
            .collect())
    }

    async fn publish(&self, invalidation: Invalidation) -> Result<(), CacheUnavailableError> {
        // No subscribers is not an error.
        let _ = self.notices.send(invalidation);
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Invalidation>> {
        Some(self.notices.subscribe())
    }
}
