use serde::Deserialize;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;
use std::time::SystemTime;

/// A cached copy of an entity.
///
/// The same record is kept in both tiers; the distributed one receives it encoded with [`codec`](crate::codec). The
/// dirty flag is local to the near-cache of a write-behind repository and is never encoded: whatever comes from the
/// distributed tier is considered clean.
#[derive(Clone, Serialize, Deserialize)]
pub struct CacheEntry<E> {
    entity:      E,
    inserted_at: SystemTime,
    #[serde(skip)]
    dirty:       bool,
}

impl<E> CacheEntry<E> {
    pub fn new(entity: E) -> Self {
        Self {
            entity,
            inserted_at: SystemTime::now(),
            dirty: false,
        }
    }

    /// An entry ahead of the database.
    pub fn dirty(entity: E) -> Self {
        Self {
            entity,
            inserted_at: SystemTime::now(),
            dirty: true,
        }
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn into_entity(self) -> E {
        self.entity
    }

    pub fn inserted_at(&self) -> SystemTime {
        self.inserted_at
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn age(&self) -> Duration {
        self.inserted_at.elapsed().unwrap_or(Duration::ZERO)
    }

    pub(crate) fn into_clean(mut self) -> Self {
        self.dirty = false;
        self
    }
}

impl<E> Debug for CacheEntry<E>
where
    E: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("entity", &self.entity)
            .field("inserted_at", &self.inserted_at)
            .field("dirty", &self.dirty)
            .finish()
    }
}
