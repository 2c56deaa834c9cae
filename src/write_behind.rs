//! Write-behind buffer.
//!
//! Every write-behind repository owns one background task. Callers never touch its state; they talk to it over an
//! unbounded channel. The task keeps the pending writes in a [`PendingQueue`] and flushes them to the database in
//! batches, either on a timer or when the queue grows to the batch size, whichever happens first.
//!
//! A pending write goes through `Pending → Flushing → {Flushed | Pending(retry)}`. Draining a batch removes its items
//! from the queue, so a write arriving while the batch is in flight starts a new, independent pending slot.
//!
//! After a failed batch the queue size no longer triggers flushes; the failed writes wait for the next tick. While
//! draining on shutdown, failed writes go to the back of the queue instead of the front.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::error::DataAccessError;
use crate::error::RepositoryError;
use crate::strategy::CacheStrategy;
use crate::tiers::TwoLevelCache;
use crate::traits::Database;
use crate::traits::EntityMapper;
use crate::traits::Observer;
use crate::types::BatchReport;
use crate::types::DeadLetter;
use crate::types::FlushReport;
use crate::types::WriteKind;

pub struct PendingWrite<M>
where
    M: EntityMapper,
{
    kind:        WriteKind,
    id:          M::Id,
    entity:      M::Entity,
    enqueued_at: Instant,
    attempts:    u32,
}

impl<M> PendingWrite<M>
where
    M: EntityMapper,
{
    pub fn new(kind: WriteKind, id: M::Id, entity: M::Entity) -> Self {
        Self {
            kind,
            id,
            entity,
            enqueued_at: Instant::now(),
            attempts: 0,
        }
    }

    pub fn kind(&self) -> WriteKind {
        self.kind
    }

    pub fn id(&self) -> &M::Id {
        &self.id
    }

    pub fn entity(&self) -> &M::Entity {
        &self.entity
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    // The slot keeps its queue position and attempt count; only the payload is replaced.
    fn supersede(&mut self, newer: PendingWrite<M>) {
        self.kind = self.kind.merge(newer.kind);
        self.entity = newer.entity;
    }

    fn into_dead_letter(self, error: DataAccessError) -> DeadLetter<M> {
        DeadLetter {
            id: self.id,
            entity: self.entity,
            kind: self.kind,
            attempts: self.attempts,
            enqueued_at: self.enqueued_at,
            error,
        }
    }
}

impl<M> Debug for PendingWrite<M>
where
    M: EntityMapper,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWrite")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Pending writes in the order of their first enqueue, at most one per entity ID.
pub(crate) struct PendingQueue<M>
where
    M: EntityMapper,
{
    order: VecDeque<M::Id>,
    slots: HashMap<M::Id, PendingWrite<M>>,
}

impl<M> PendingQueue<M>
where
    M: EntityMapper,
{
    pub(crate) fn new() -> Self {
        Self {
            order: VecDeque::new(),
            slots: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns `true` if the write was coalesced into an already pending one.
    pub(crate) fn push(&mut self, write: PendingWrite<M>) -> bool {
        if let Some(pending) = self.slots.get_mut(&write.id) {
            pending.supersede(write);
            return true;
        }

        self.order.push_back(write.id.clone());
        self.slots.insert(write.id.clone(), write);
        false
    }

    /// Take up to `max` oldest writes out of the queue.
    pub(crate) fn drain(&mut self, max: usize) -> Vec<PendingWrite<M>> {
        let mut batch = Vec::with_capacity(max.min(self.len()));
        while batch.len() < max {
            let Some(id) = self.order.pop_front()
            else {
                break;
            };
            if let Some(write) = self.slots.remove(&id) {
                batch.push(write);
            }
        }
        batch
    }

    /// Put failed writes back in front of the queue, preserving their order. A write for an ID that got a newer pending
    /// slot in the meantime is superseded by it and dropped. Returns the number of dropped writes.
    pub(crate) fn requeue(&mut self, failed: Vec<PendingWrite<M>>) -> usize {
        let mut superseded = 0;
        for write in failed.into_iter().rev() {
            if let Some(newer) = self.slots.get_mut(&write.id) {
                newer.kind = write.kind.merge(newer.kind);
                superseded += 1;
                continue;
            }
            self.order.push_front(write.id.clone());
            self.slots.insert(write.id.clone(), write);
        }
        superseded
    }

    /// Like [`requeue`](Self::requeue), but failed writes go to the back of the queue.
    pub(crate) fn requeue_back(&mut self, failed: Vec<PendingWrite<M>>) -> usize {
        let mut superseded = 0;
        for write in failed {
            if let Some(newer) = self.slots.get_mut(&write.id) {
                newer.kind = write.kind.merge(newer.kind);
                superseded += 1;
                continue;
            }
            self.order.push_back(write.id.clone());
            self.slots.insert(write.id.clone(), write);
        }
        superseded
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: &M::Id) -> Option<&PendingWrite<M>> {
        self.slots.get(id)
    }
}

pub(crate) enum Command<M>
where
    M: EntityMapper,
{
    Enqueue(PendingWrite<M>),
    Flush(oneshot::Sender<FlushReport>),
    Shutdown(oneshot::Sender<FlushReport>),
}

/// Handle of the background flush task.
pub struct WriteBehindBuffer<M>
where
    M: EntityMapper,
{
    name:     String,
    commands: mpsc::UnboundedSender<Command<M>>,
    task:     Mutex<Option<JoinHandle<()>>>,
}

impl<M> WriteBehindBuffer<M>
where
    M: EntityMapper,
{
    pub(crate) fn spawn(
        mapper: Arc<M>,
        database: Arc<dyn Database<M>>,
        tiers: Arc<TwoLevelCache<M::Entity>>,
        observer: Option<Arc<dyn Observer<M>>>,
        strategy: CacheStrategy,
    ) -> Self {
        let name = tiers.namespace().to_string();
        let (commands, receiver) = mpsc::unbounded_channel();

        let flusher = Flusher {
            name: name.clone(),
            mapper,
            database,
            tiers,
            observer,
            strategy,
            queue: PendingQueue::new(),
            retry_pending: false,
            draining: false,
        };

        debug!(
            "[{name}] starting write-behind task; interval={:?}, batch={}",
            strategy.flush_interval(),
            strategy.max_batch_size()
        );

        Self {
            name,
            commands,
            task: Mutex::new(Some(tokio::spawn(flusher.run(receiver)))),
        }
    }

    /// Hand a write over to the background task. Never waits for the database.
    pub fn enqueue(&self, write: PendingWrite<M>) -> Result<(), RepositoryError> {
        self.commands
            .send(Command::Enqueue(write))
            .map_err(|_| RepositoryError::Closed)
    }

    /// Flush everything pending right now.
    pub async fn flush(&self) -> Result<FlushReport, RepositoryError> {
        let (reply, report) = oneshot::channel();
        self.commands
            .send(Command::Flush(reply))
            .map_err(|_| RepositoryError::Closed)?;
        report.await.map_err(|_| RepositoryError::Closed)
    }

    /// Drain the queue and stop the background task.
    pub async fn shutdown(&self) -> Result<FlushReport, RepositoryError> {
        let (reply, report) = oneshot::channel();
        let sent = self.commands.send(Command::Shutdown(reply)).is_ok();
        let report = if sent {
            report.await.map_err(|_| RepositoryError::Closed)
        }
        else {
            Err(RepositoryError::Closed)
        };

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!("[{}] write-behind task failed: {err}", self.name);
            }
        }

        report
    }
}

impl<M> Debug for WriteBehindBuffer<M>
where
    M: EntityMapper,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WriteBehindBuffer {{ {} }}", self.name)
    }
}

struct Flusher<M>
where
    M: EntityMapper,
{
    name:     String,
    mapper:   Arc<M>,
    database: Arc<dyn Database<M>>,
    tiers:    Arc<TwoLevelCache<M::Entity>>,
    observer: Option<Arc<dyn Observer<M>>>,
    strategy: CacheStrategy,
    queue:    PendingQueue<M>,
    // A batch failed since the last tick. Retries wait for the timer, the queue size doesn't trigger them.
    retry_pending: bool,
    // Failed writes rotate to the back of the queue so every pending write gets its share of the attempts.
    draining: bool,
}

impl<M> Flusher<M>
where
    M: EntityMapper,
{
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command<M>>) {
        let interval = self.strategy.flush_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Enqueue(write)) => {
                        if self.queue.push(write) {
                            debug!("[{}] coalesced a pending write", self.name);
                        }
                        if !self.retry_pending && self.queue.len() >= self.strategy.max_batch_size() {
                            self.flush_batch().await;
                            // Size-triggered flush restarts the timer.
                            ticker.reset();
                        }
                    }
                    Some(Command::Flush(reply)) => {
                        let report = self.flush_pending().await;
                        ticker.reset();
                        let _ = reply.send(report);
                    }
                    Some(Command::Shutdown(reply)) => {
                        let report = self.shutdown(&mut commands).await;
                        let _ = reply.send(report);
                        break;
                    }
                    None => {
                        self.shutdown(&mut commands).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.retry_pending = false;
                    if !self.queue.is_empty() {
                        self.flush_pending().await;
                    }
                }
            }
        }

        debug!("[{}] write-behind task stopped", self.name);
    }

    // Flush what is pending now. Stops at the first failed batch; its items are back in the queue waiting for the
    // next cycle.
    async fn flush_pending(&mut self) -> FlushReport {
        let mut report = FlushReport {
            remaining: self.queue.len(),
            ..Default::default()
        };

        while !self.queue.is_empty() {
            let batch = self.flush_batch().await;
            let failed = batch.failed > 0 || batch.dead_lettered > 0;
            report.absorb(batch);
            if failed {
                break;
            }
        }

        report
    }

    async fn shutdown(&mut self, commands: &mut mpsc::UnboundedReceiver<Command<M>>) -> FlushReport {
        self.draining = true;

        // Writes racing with the shutdown request still get their chance.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Enqueue(write) => {
                    self.queue.push(write);
                }
                Command::Flush(reply) | Command::Shutdown(reply) => {
                    let _ = reply.send(FlushReport {
                        remaining: self.queue.len(),
                        ..Default::default()
                    });
                }
            }
        }

        info!("[{}] draining {} pending writes", self.name, self.queue.len());

        // Every failure brings a write closer to its retry limit, so this loop ends.
        let mut report = FlushReport::default();
        while !self.queue.is_empty() {
            report.absorb(self.flush_batch().await);
        }

        if report.dead_lettered > 0 {
            warn!(
                "[{}] {} writes were lost while draining the buffer",
                self.name, report.dead_lettered
            );
        }

        report
    }

    #[instrument(level = "trace", skip(self), fields(ns = %self.name))]
    async fn flush_batch(&mut self) -> FlushReport {
        let batch = self.queue.drain(self.strategy.max_batch_size());
        if batch.is_empty() {
            return FlushReport {
                remaining: self.queue.len(),
                ..Default::default()
            };
        }

        let started = Instant::now();
        match self.write_batch(&batch).await {
            Ok((inserts, updates)) => {
                for write in &batch {
                    self.tiers
                        .mark_clean(&self.tiers.key_for(&write.id), &write.entity)
                        .await;
                }

                let report = BatchReport {
                    size: batch.len(),
                    inserts,
                    updates,
                    elapsed: started.elapsed(),
                };
                debug!(
                    "[{}] flushed {} writes ({inserts} inserts, {updates} updates) in {:?}",
                    self.name, report.size, report.elapsed
                );
                if self.queue.is_empty() {
                    self.retry_pending = false;
                }
                if let Some(ref observer) = self.observer {
                    observer.on_flush(&report).await;
                }

                FlushReport {
                    batches: 1,
                    written: batch.len(),
                    remaining: self.queue.len(),
                    ..Default::default()
                }
            }
            Err(err) => {
                warn!("[{}] flush of {} writes failed: {err}", self.name, batch.len());
                if let Some(ref observer) = self.observer {
                    observer.on_error(&RepositoryError::DataAccess(err.clone())).await;
                }

                let mut retry = Vec::with_capacity(batch.len());
                let mut dead_lettered = 0;
                for mut write in batch {
                    write.attempts += 1;
                    if write.attempts >= self.strategy.max_retries() {
                        self.dead_letter(write, err.clone()).await;
                        dead_lettered += 1;
                    }
                    else {
                        retry.push(write);
                    }
                }

                let failed = retry.len();
                self.retry_pending = true;
                let superseded = if self.draining {
                    self.queue.requeue_back(retry)
                }
                else {
                    self.queue.requeue(retry)
                };
                if superseded > 0 {
                    debug!("[{}] {superseded} failed writes superseded by newer ones", self.name);
                }

                FlushReport {
                    failed,
                    dead_lettered,
                    remaining: self.queue.len(),
                    ..Default::default()
                }
            }
        }
    }

    // Compose one transactional batch. Inserts are only a guess made from the near-cache, so the rows that already
    // exist are written as updates.
    async fn write_batch(&self, batch: &[PendingWrite<M>]) -> Result<(usize, usize), DataAccessError> {
        let unverified = batch
            .iter()
            .filter(|w| w.kind == WriteKind::Insert)
            .map(|w| w.id.clone())
            .collect::<Vec<_>>();

        let existing = if unverified.is_empty() {
            HashSet::new()
        }
        else {
            self.database.existing_ids(&unverified).await?
        };

        let mut statements = Vec::with_capacity(batch.len());
        let (mut inserts, mut updates) = (0, 0);
        for write in batch {
            if write.kind == WriteKind::Insert && !existing.contains(&write.id) {
                inserts += 1;
                statements.push(self.mapper.insert_statement(&write.entity));
            }
            else {
                updates += 1;
                statements.push(self.mapper.update_statement(&write.entity));
            }
        }

        self.database.execute_batch(statements).await?;
        Ok((inserts, updates))
    }

    async fn dead_letter(&self, write: PendingWrite<M>, error: DataAccessError) {
        error!(
            "[{}] giving up on {} of '{}' after {} attempts: {error}",
            self.name, write.kind, write.id, write.attempts
        );

        // Don't let the caches keep serving a value the database will never see.
        self.tiers
            .evict_if_holds(&self.tiers.key_for(&write.id), &write.entity)
            .await;

        let dead_letter = write.into_dead_letter(error);
        if let Some(ref observer) = self.observer {
            observer.on_dead_letter(&dead_letter).await;
        }
    }
}
