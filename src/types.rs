use std::fmt::Debug;
use std::fmt::Display;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

use crate::error::DataAccessError;
use crate::traits::EntityMapper;

/// Consistency policy of a repository.
///
/// `ReadThrough` and `WriteThrough` share the same write path: the database is written synchronously and the caches
/// are only updated after the write succeeded. The two names are kept to document intent at the construction site.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CacheMode {
    /// Reads are cached, writes are rejected.
    ReadOnly,
    #[default]
    ReadThrough,
    WriteThrough,
    /// Writes land in the caches immediately and reach the database later, in batches.
    WriteBehind,
}

impl CacheMode {
    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::ReadOnly)
    }

    pub fn is_write_behind(&self) -> bool {
        matches!(self, Self::WriteBehind)
    }
}

/// Namespaced key of an entity in the distributed tier: `<namespace>:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new<I: Display + ?Sized>(namespace: &str, id: &I) -> Self {
        Self(format!("{namespace}:{id}"))
    }

    /// The common prefix of every key within the namespace.
    pub fn prefix(namespace: &str) -> String {
        format!("{namespace}:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum WriteKind {
    Insert,
    Update,
}

impl WriteKind {
    /// Kind of a write that replaces a not yet persisted one for the same entity. A row that was never inserted still
    /// needs an insert, no matter what the newer write thinks.
    pub fn merge(self, newer: WriteKind) -> WriteKind {
        match (self, newer) {
            (WriteKind::Insert, _) | (_, WriteKind::Insert) => WriteKind::Insert,
            _ => WriteKind::Update,
        }
    }
}

/// A write that exhausted its retries and was taken out of the write-behind buffer.
pub struct DeadLetter<M>
where
    M: EntityMapper,
{
    pub id:          M::Id,
    pub entity:      M::Entity,
    pub kind:        WriteKind,
    pub attempts:    u32,
    pub enqueued_at: Instant,
    pub error:       DataAccessError,
}

impl<M> Debug for DeadLetter<M>
where
    M: EntityMapper,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetter")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("attempts", &self.attempts)
            .field("error", &self.error)
            .finish()
    }
}

/// Outcome of a single successfully written batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub size:    usize,
    pub inserts: usize,
    pub updates: usize,
    pub elapsed: Duration,
}

/// Summary of a manual flush or of the shutdown drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Batches successfully written.
    pub batches:       usize,
    /// Writes persisted.
    pub written:       usize,
    /// Writes that failed and went back to the queue.
    pub failed:        usize,
    /// Writes given up on.
    pub dead_lettered: usize,
    /// Writes still pending after the flush.
    pub remaining:     usize,
}

impl FlushReport {
    pub(crate) fn absorb(&mut self, other: FlushReport) {
        self.batches += other.batches;
        self.written += other.written;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.remaining = other.remaining;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationTarget {
    Key(String),
    /// Everything under the namespace.
    Namespace(String),
    /// Everything in every namespace. Raised locally by a backend which may have missed notices.
    All,
}

/// Near-cache invalidation notice exchanged between repository instances sharing a distributed cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    /// Identifies the repository instance that caused the change; instances ignore their own notices.
    pub origin: u64,
    pub target: InvalidationTarget,
}

impl Invalidation {
    pub fn key(origin: u64, key: &CacheKey) -> Self {
        Self {
            origin,
            target: InvalidationTarget::Key(key.as_str().to_string()),
        }
    }

    pub fn namespace<S: ToString>(origin: u64, namespace: S) -> Self {
        Self {
            origin,
            target: InvalidationTarget::Namespace(namespace.to_string()),
        }
    }

    /// Tell every listener to drop its whole near-cache, including the listeners of this very process.
    pub fn everything() -> Self {
        Self {
            origin: 0,
            target: InvalidationTarget::All,
        }
    }
}
