//! Cache strategy policy.
//!
//! A [`CacheStrategy`] is picked once, when a repository is built, and is never changed afterwards. It is read by the
//! repository and by the write-behind buffer to choose their code paths.
//!
//! | Mode | Reads | Writes |
//! | ---- | ----- | ------ |
//! | `ReadOnly` | near → distributed → DB | rejected |
//! | `ReadThrough` | near → distributed → DB | DB first, then caches |
//! | `WriteThrough` | near → distributed → DB | DB first, then caches |
//! | `WriteBehind` | near → distributed → DB | caches first, DB in background batches |

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RepositoryError;
use crate::types::CacheMode;

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_NEAR_CACHE_CAPACITY: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStrategy {
    mode:                CacheMode,
    near_cache_enabled:  bool,
    near_cache_capacity: u64,
    /// Time-to-live of cached entries, both tiers. Zero means entries never expire.
    ttl:                 Duration,
    /// The delay between two consecutive background flushes of a write-behind buffer.
    flush_interval:      Duration,
    max_batch_size:      usize,
    /// How many times a failed write-behind batch item is attempted before it is dead-lettered.
    max_retries:         u32,
}

impl CacheStrategy {
    pub const fn new(mode: CacheMode) -> Self {
        Self {
            mode,
            near_cache_enabled: true,
            near_cache_capacity: DEFAULT_NEAR_CACHE_CAPACITY,
            ttl: DEFAULT_TTL,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub const fn read_only() -> Self {
        Self::new(CacheMode::ReadOnly)
    }

    pub const fn read_through() -> Self {
        Self::new(CacheMode::ReadThrough)
    }

    pub const fn write_through() -> Self {
        Self::new(CacheMode::WriteThrough)
    }

    pub const fn write_behind() -> Self {
        Self::new(CacheMode::WriteBehind)
    }

    pub const fn with_near_cache(mut self, enabled: bool) -> Self {
        self.near_cache_enabled = enabled;
        self
    }

    pub const fn with_near_cache_capacity(mut self, capacity: u64) -> Self {
        self.near_cache_capacity = capacity;
        self
    }

    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub const fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub const fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn near_cache_enabled(&self) -> bool {
        self.near_cache_enabled
    }

    pub fn near_cache_capacity(&self) -> u64 {
        self.near_cache_capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn validate(&self) -> Result<(), RepositoryError> {
        if self.near_cache_enabled && self.near_cache_capacity == 0 {
            return Err(RepositoryError::Config(
                "near-cache capacity must be positive when the near-cache is enabled".into(),
            ));
        }
        if self.mode.is_write_behind() {
            if self.max_batch_size == 0 {
                return Err(RepositoryError::Config("max batch size must be at least 1".into()));
            }
            if self.max_retries == 0 {
                return Err(RepositoryError::Config("max retries must be at least 1".into()));
            }
            if self.flush_interval.is_zero() {
                return Err(RepositoryError::Config(
                    "flush interval of a write-behind repository cannot be zero".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for CacheStrategy {
    fn default() -> Self {
        Self::read_through()
    }
}
