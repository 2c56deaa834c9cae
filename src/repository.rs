use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use fieldx_plus::fx_plus;
use parking_lot::Mutex;
use tracing::debug;
use tracing::instrument;

use crate::entry::CacheEntry;
use crate::error::RepositoryError;
use crate::strategy::CacheStrategy;
use crate::tiers::TwoLevelCache;
use crate::traits::Database;
use crate::traits::DistributedCache;
use crate::traits::EntityMapper;
use crate::traits::Observer;
use crate::types::CacheKey;
use crate::types::CacheMode;
use crate::types::FlushReport;
use crate::types::WriteKind;
use crate::write_behind::PendingWrite;
use crate::write_behind::WriteBehindBuffer;

// Outcome of a cold load which doesn't produce a cache entry.
enum LoadMiss {
    NotFound,
    Failed(RepositoryError),
}

/// A repository of entities of one kind, put behind a near-cache and a distributed cache.
///
/// ```ignore
/// let accounts = CacheRepository::<AccountMapper>::builder()
///     .namespace("accounts")
///     .mapper(Arc::new(AccountMapper))
///     .database(database)
///     .cache_backend(Arc::new(MemoryCache::new()))
///     .strategy(CacheStrategy::write_behind().with_flush_interval(Duration::from_millis(200)))
///     .build()?;
///
/// let account = accounts.get_by_id(&42).await?;
/// accounts.save(account.deposit(100)).await?;
/// accounts.close().await?;
/// ```
///
/// What happens on reads and writes is decided by the [mode](CacheMode) of its [`CacheStrategy`], see
/// [`strategy`](crate::strategy) for the table.
///
/// Database lookups which find nothing are not cached.
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`CacheRepository`].", "", "See [`CacheRepository::builder()`] method."),
        method_doc("Implement builder pattern for [`CacheRepository`]."),
    )
)]
pub struct CacheRepository<M>
where
    M: EntityMapper,
{
    /// Cache namespace, usually the name of the entity's table. Prefixes all distributed-cache keys of the repository.
    #[fieldx(get, builder(required, into))]
    namespace: String,

    #[fieldx(vis(pub(crate)), builder(vis(pub), required), get(clone))]
    mapper: Arc<M>,

    #[fieldx(vis(pub(crate)), builder(vis(pub), required), get(clone))]
    database: Arc<dyn Database<M>>,

    #[fieldx(vis(pub(crate)), builder(vis(pub), required), get(clone))]
    cache_backend: Arc<dyn DistributedCache>,

    #[fieldx(get(copy), default(CacheStrategy::read_through()))]
    strategy: CacheStrategy,

    #[fieldx(optional, get(clone))]
    observer: Arc<dyn Observer<M>>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    tiers: Arc<TwoLevelCache<M::Entity>>,

    // Spawned with the first write of a write-behind repository.
    #[fieldx(private, lazy, lock, clearer, get(clone), builder(off))]
    write_buffer: Arc<WriteBehindBuffer<M>>,

    #[fieldx(lock, private, get(copy), set, builder(off), default(false))]
    closed: bool,

    // Closing and spawning the write buffer don't overlap.
    #[fieldx(private, get, builder(off), default(Mutex::new(())))]
    lifecycle: Mutex<()>,
}

impl<M> CacheRepository<M>
where
    M: EntityMapper,
{
    fn build_tiers(&self) -> Arc<TwoLevelCache<M::Entity>> {
        let tiers = Arc::new(TwoLevelCache::new(
            self.namespace(),
            self.cache_backend(),
            self.strategy(),
        ));
        tiers.start_listening();
        tiers
    }

    fn build_write_buffer(&self) -> Arc<WriteBehindBuffer<M>> {
        Arc::new(WriteBehindBuffer::spawn(
            self.mapper(),
            self.database(),
            self.tiers(),
            self.observer(),
            self.strategy(),
        ))
    }

    pub fn mode(&self) -> CacheMode {
        self.strategy().mode()
    }

    pub fn is_closed(&self) -> bool {
        self.closed()
    }

    /// Look up an entity by its ID. `None` if the database doesn't have it either.
    ///
    /// Concurrent cold lookups of the same key are collapsed into a single database query when the near-cache is
    /// enabled.
    #[instrument(level = "trace", skip(self), fields(ns = %self.namespace()))]
    pub async fn find_by_id(&self, id: &M::Id) -> Result<Option<M::Entity>, RepositoryError> {
        self.strategy().validate()?;

        let tiers = self.tiers();
        let key = tiers.key_for(id);

        let Some(near) = tiers.near()
        else {
            return match self.load(&tiers, id, &key).await {
                Ok(entry) => Ok(Some(entry.into_entity())),
                Err(LoadMiss::NotFound) => Ok(None),
                Err(LoadMiss::Failed(err)) => Err(err),
            };
        };

        match near
            .try_get_with(key.as_str().to_string(), self.load(&tiers, id, &key))
            .await
        {
            Ok(entry) => Ok(Some(entry.into_entity())),
            Err(miss) => match miss.as_ref() {
                LoadMiss::NotFound => Ok(None),
                LoadMiss::Failed(err) => Err(err.clone()),
            },
        }
    }

    /// Like [`find_by_id`](Self::find_by_id) but a missing entity is an error.
    pub async fn get_by_id(&self, id: &M::Id) -> Result<M::Entity, RepositoryError> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| RepositoryError::EntityNotFound(id.to_string()))
    }

    // Everything below the near-cache. The result lands in the near-cache via try_get_with.
    async fn load(
        &self,
        tiers: &TwoLevelCache<M::Entity>,
        id: &M::Id,
        key: &CacheKey,
    ) -> Result<CacheEntry<M::Entity>, LoadMiss> {
        if let Some(entry) = tiers.get_remote(key).await {
            debug!("[{}] distributed hit '{key}'", self.namespace());
            return Ok(entry);
        }

        let row = self
            .database()
            .fetch_row(id)
            .await
            .map_err(|err| LoadMiss::Failed(err.into()))?;

        let Some(row) = row
        else {
            debug!("[{}] '{key}' not found in the database", self.namespace());
            return Err(LoadMiss::NotFound);
        };

        let entity = self
            .mapper()
            .row_to_entity(row)
            .map_err(|err| LoadMiss::Failed(err.into()))?;
        let entry = CacheEntry::new(entity);
        tiers.put_remote(key, &entry).await;
        Ok(entry)
    }

    /// Persist an entity according to the repository mode. Returns the saved entity.
    #[instrument(level = "trace", skip(self, entity), fields(ns = %self.namespace()))]
    pub async fn save(&self, entity: M::Entity) -> Result<M::Entity, RepositoryError> {
        self.ensure_writable("save")?;

        if self.mode().is_write_behind() {
            self.save_behind(entity).await
        }
        else {
            self.save_through(entity).await
        }
    }

    /// Persist a group of entities. A write-through repository writes them all in one transaction; a write-behind one
    /// simply enqueues each of them.
    #[instrument(level = "trace", skip(self, entities), fields(ns = %self.namespace()))]
    pub async fn save_all(&self, entities: Vec<M::Entity>) -> Result<Vec<M::Entity>, RepositoryError> {
        self.ensure_writable("save_all")?;

        if self.mode().is_write_behind() {
            let mut saved = Vec::with_capacity(entities.len());
            for entity in entities {
                saved.push(self.save_behind(entity).await?);
            }
            return Ok(saved);
        }

        if entities.is_empty() {
            return Ok(entities);
        }

        let tiers = self.tiers();
        let mapper = self.mapper();

        let ids = entities
            .iter()
            .map(|entity| {
                let id = mapper.id_of(entity);
                let key = tiers.key_for(&id);
                (id, key)
            })
            .collect::<Vec<_>>();
        let _guards = tiers.lock_keys(ids.iter().map(|(_, key)| key)).await;

        let mut keyed = Vec::with_capacity(ids.len());
        let mut unknown = Vec::new();
        for (id, key) in ids {
            let cached = self.is_cached(&tiers, &key).await;
            if !cached {
                unknown.push(id.clone());
            }
            keyed.push((id, key, cached));
        }

        let existing = if unknown.is_empty() {
            HashSet::new()
        }
        else {
            self.database().existing_ids(&unknown).await?
        };

        // A repeated ID is an update of the row inserted earlier in the same batch.
        let mut seen = HashSet::with_capacity(keyed.len());
        let statements = keyed
            .iter()
            .zip(entities.iter())
            .map(|((id, _, cached), entity)| {
                let first = seen.insert(id.clone());
                if first && !cached && !existing.contains(id) {
                    mapper.insert_statement(entity)
                }
                else {
                    mapper.update_statement(entity)
                }
            })
            .collect::<Vec<_>>();

        self.database().execute_batch(statements).await?;

        for ((_, key, _), entity) in keyed.iter().zip(entities.iter()) {
            tiers.put(key, CacheEntry::new(entity.clone())).await;
        }

        Ok(entities)
    }

    async fn save_through(&self, entity: M::Entity) -> Result<M::Entity, RepositoryError> {
        let tiers = self.tiers();
        let mapper = self.mapper();
        let id = mapper.id_of(&entity);
        let key = tiers.key_for(&id);
        let _guard = tiers.lock_key(&key).await;

        let statement = match self.resolve_kind(&tiers, &id, &key).await? {
            WriteKind::Insert => mapper.insert_statement(&entity),
            WriteKind::Update => mapper.update_statement(&entity),
        };

        // Nothing gets cached unless the database accepted the write.
        self.database().execute(statement).await?;
        tiers.put(&key, CacheEntry::new(entity.clone())).await;

        Ok(entity)
    }

    async fn save_behind(&self, entity: M::Entity) -> Result<M::Entity, RepositoryError> {
        let tiers = self.tiers();
        let id = self.mapper().id_of(&entity);
        let key = tiers.key_for(&id);
        // Same-key saves must reach the caches in the order they are enqueued.
        let _guard = tiers.lock_key(&key).await;
        let buffer = self.running_write_buffer()?;

        // A guess; the flusher checks inserts against the database.
        let kind = if tiers.contains_near(&key).await {
            WriteKind::Update
        }
        else {
            WriteKind::Insert
        };

        tiers.put(&key, CacheEntry::dirty(entity.clone())).await;

        if let Err(err) = buffer.enqueue(PendingWrite::new(kind, id, entity.clone())) {
            tiers.evict(&key).await;
            return Err(err);
        }

        Ok(entity)
    }

    // The write buffer, spawning it if needed. Never spawns one for a closed repository.
    fn running_write_buffer(&self) -> Result<Arc<WriteBehindBuffer<M>>, RepositoryError> {
        let _lifecycle = self.lifecycle().lock();
        if self.closed() {
            return Err(RepositoryError::Closed);
        }
        Ok(self.write_buffer())
    }

    async fn resolve_kind(
        &self,
        tiers: &TwoLevelCache<M::Entity>,
        id: &M::Id,
        key: &CacheKey,
    ) -> Result<WriteKind, RepositoryError> {
        if self.is_cached(tiers, key).await {
            return Ok(WriteKind::Update);
        }

        let existing = self.database().existing_ids(std::slice::from_ref(id)).await?;
        Ok(if existing.contains(id) {
            WriteKind::Update
        }
        else {
            WriteKind::Insert
        })
    }

    async fn is_cached(&self, tiers: &TwoLevelCache<M::Entity>, key: &CacheKey) -> bool {
        tiers.contains_near(key).await || tiers.get_remote(key).await.is_some()
    }

    fn ensure_writable(&self, operation: &'static str) -> Result<(), RepositoryError> {
        let mode = self.mode();
        if !mode.is_writable() {
            return Err(RepositoryError::UnsupportedOperation { operation, mode });
        }
        if self.closed() {
            return Err(RepositoryError::Closed);
        }
        self.strategy().validate()
    }

    /// Drop the entity from both cache tiers. The database is not touched.
    #[instrument(level = "trace", skip(self), fields(ns = %self.namespace()))]
    pub async fn evict(&self, id: &M::Id) {
        let tiers = self.tiers();
        tiers.evict(&tiers.key_for(id)).await;
    }

    /// Drop the whole namespace from both cache tiers. Returns the number of distributed-cache keys removed.
    #[instrument(level = "trace", skip(self), fields(ns = %self.namespace()))]
    pub async fn evict_all(&self) -> usize {
        self.tiers().evict_all().await
    }

    /// Write all pending write-behind changes to the database now. Other modes have nothing to flush.
    pub async fn flush(&self) -> Result<FlushReport, RepositoryError> {
        self.strategy().validate()?;
        if !self.mode().is_write_behind() {
            return Ok(FlushReport::default());
        }
        self.running_write_buffer()?.flush().await
    }

    /// Stop the repository. Pending writes are drained first; the report tells how many of them made it to the
    /// database. Further writes fail with [`RepositoryError::Closed`], reads are still served.
    pub async fn close(&self) -> Result<FlushReport, RepositoryError> {
        let buffer = {
            let _lifecycle = self.lifecycle().lock();
            if self.closed() {
                return Ok(FlushReport::default());
            }
            self.set_closed(true);
            self.clear_write_buffer()
        };

        let report = match buffer {
            Some(buffer) => buffer.shutdown().await?,
            None => FlushReport::default(),
        };

        self.tiers().clear_near();

        debug!(
            "[{}] closed; written={}, dead-lettered={}",
            self.namespace(),
            report.written,
            report.dead_lettered
        );
        Ok(report)
    }
}

impl<M> Debug for CacheRepository<M>
where
    M: EntityMapper,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRepository")
            .field("namespace", self.namespace())
            .field("strategy", &self.strategy())
            .field("closed", &self.closed())
            .finish()
    }
}
