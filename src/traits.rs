use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Debug;
use std::fmt::Display;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::CacheUnavailableError;
use crate::error::DataAccessError;
use crate::error::RepositoryError;
use crate::types::BatchReport;
use crate::types::DeadLetter;
use crate::types::Invalidation;

/// Maps database rows into entities and entities into write statements.
///
/// The mapper also defines the types the repository works with. `Row` and `Statement` are opaque to the repository;
/// they only travel between the mapper and the [`Database`] implementation.
pub trait EntityMapper: Sized + Send + Sync + 'static {
    type Id: Debug + Display + Hash + Clone + Eq + Send + Sync + 'static;
    /// Entities are stored in the distributed cache, hence serde. Equality is used to tell whether a flushed value is
    /// still the one cached.
    type Entity: Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Row: Send + 'static;
    type Statement: Debug + Send + Sync + 'static;

    fn id_of(&self, entity: &Self::Entity) -> Self::Id;
    fn row_to_entity(&self, row: Self::Row) -> Result<Self::Entity, DataAccessError>;
    fn insert_statement(&self, entity: &Self::Entity) -> Self::Statement;
    fn update_statement(&self, entity: &Self::Entity) -> Self::Statement;
}

/// The system of record.
#[async_trait]
pub trait Database<M>: Send + Sync + 'static
where
    M: EntityMapper,
{
    async fn fetch_row(&self, id: &M::Id) -> Result<Option<M::Row>, DataAccessError>;

    /// Returns the subset of `ids` having a row in the database.
    async fn existing_ids(&self, ids: &[M::Id]) -> Result<HashSet<M::Id>, DataAccessError>;

    async fn execute(&self, statement: M::Statement) -> Result<(), DataAccessError>;

    /// Execute all statements within a single transaction. Either all of them are applied or none.
    async fn execute_batch(&self, statements: Vec<M::Statement>) -> Result<(), DataAccessError>;
}

/// A distributed key-value cache client.
#[async_trait]
pub trait DistributedCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheUnavailableError>;

    /// Store a value. Zero `ttl` means the value doesn't expire.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheUnavailableError>;

    /// Returns `true` if there was a value under the key.
    async fn delete(&self, key: &str) -> Result<bool, CacheUnavailableError>;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheUnavailableError>;

    /// Tell other clients that their local copies of a key are stale. Backends without pub/sub ignore it.
    async fn publish(&self, _invalidation: Invalidation) -> Result<(), CacheUnavailableError> {
        Ok(())
    }

    /// Subscribe to invalidation notices. `None` if the backend doesn't support them.
    fn subscribe(&self) -> Option<broadcast::Receiver<Invalidation>> {
        None
    }
}

/// Out-of-band reporting channel of a repository. Mostly important for write-behind repositories where database
/// errors cannot be returned to the caller.
#[async_trait]
pub trait Observer<M>: Send + Sync + 'static
where
    M: EntityMapper,
{
    async fn on_flush(&self, _report: &BatchReport) {}
    async fn on_dead_letter(&self, _dead_letter: &DeadLetter<M>) {}
    async fn on_error(&self, _error: &RepositoryError) {}
}
