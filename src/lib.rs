//! # cache-repo
//!
//! A repository layer that puts two cache tiers in front of a database:
//!
//! - a bounded in-process **near-cache** ([moka](https://crates.io/crates/moka)), optional;
//! - a **distributed cache** shared by all instances of the service, e.g. Redis;
//! - the **database**, the system of record.
//!
//! Reads go near → distributed → database and populate the tiers on the way back. Writes follow the repository's
//! [`CacheMode`]: rejected, written to the database first (write-through), or written to the caches first and flushed
//! to the database later in batches (write-behind).
//!
//! # Entities and Mappers
//!
//! The repository is generic over an [`EntityMapper`]. The mapper defines the ID and entity types and converts between
//! database rows and entities, and entities and write statements. Row and statement types are opaque to the
//! repository; they only travel between the mapper and the [`Database`] implementation. With the `sea-orm` feature
//! [`store::SeaOrmDatabase`] covers any SeaORM entity.
//!
//! # Write-Behind
//!
//! A write-behind repository acknowledges a `save` as soon as both cache tiers hold the new value. A background task
//! coalesces repeated writes of the same entity, flushes the queue in FIFO batches every `flush_interval` or as soon as
//! `max_batch_size` writes are pending, and retries failed batches. A write that fails `max_retries` times is
//! dead-lettered: reported to the [`Observer`] and logged, and evicted from the caches. Closing the repository drains
//! the queue.
//!
//! # Failures
//!
//! A distributed cache outage is never an error for the caller: reads fall through to the database and cache writes
//! are skipped, with a warning in the log. Database failures are returned to the caller, except in write-behind mode
//! where they go to the [`Observer`].
//!
//! # Logging
//!
//! The crate logs with [tracing](https://crates.io/crates/tracing). Messages are prefixed with the repository
//! namespace in square brackets; public operations are instrumented at the `trace` level.

pub mod backend;
pub mod codec;
pub mod entry;
pub mod error;
pub mod repository;
pub mod store;
pub mod strategy;
pub mod tiers;
pub mod traits;
pub mod types;
pub mod write_behind;

#[doc(inline)]
pub use error::RepositoryError;
#[doc(inline)]
pub use repository::CacheRepository;
#[doc(inline)]
pub use strategy::CacheStrategy;
#[doc(inline)]
pub use traits::Database;
#[doc(inline)]
pub use traits::DistributedCache;
#[doc(inline)]
pub use traits::EntityMapper;
#[doc(inline)]
pub use traits::Observer;
#[doc(inline)]
pub use types::CacheMode;

pub mod prelude {
    pub use crate::backend::MemoryCache;
    pub use crate::entry::CacheEntry;
    pub use crate::error::CacheUnavailableError;
    pub use crate::error::DataAccessError;
    pub use crate::error::RepositoryError;
    pub use crate::repository::CacheRepository;
    pub use crate::strategy::CacheStrategy;
    pub use crate::traits::*;
    pub use crate::types::*;
}
