#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cache_repo::prelude::*;
use cache_repo::test::AccountMapper;
use cache_repo::test::MemoryDatabase;
use cache_repo::test::RecordingObserver;

pub type AccountRepository = Arc<CacheRepository<AccountMapper>>;

pub fn repository(
    database: &Arc<MemoryDatabase>,
    cache: Arc<dyn DistributedCache>,
    strategy: CacheStrategy,
) -> AccountRepository {
    CacheRepository::<AccountMapper>::builder()
        .namespace("accounts")
        .mapper(Arc::new(AccountMapper))
        .database(database.clone())
        .cache_backend(cache)
        .strategy(strategy)
        .build()
        .expect("account repository")
}

/// Write-behind strategy which only flushes when asked to.
pub fn manual_write_behind() -> CacheStrategy {
    CacheStrategy::write_behind().with_flush_interval(Duration::from_secs(3600))
}

/// Give background tasks a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn observed_repository(
    database: &Arc<MemoryDatabase>,
    observer: &Arc<RecordingObserver>,
    strategy: CacheStrategy,
) -> AccountRepository {
    CacheRepository::<AccountMapper>::builder()
        .namespace("accounts")
        .mapper(Arc::new(AccountMapper))
        .database(database.clone())
        .cache_backend(Arc::new(MemoryCache::new()))
        .strategy(strategy)
        .observer(observer.clone())
        .build()
        .expect("observed account repository")
}
