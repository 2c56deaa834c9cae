mod common;

use std::sync::Arc;
use std::time::Duration;

use cache_repo::prelude::*;
use cache_repo::test::Account;
use cache_repo::test::FlakyCache;
use cache_repo::test::MemoryDatabase;
use common::manual_write_behind;
use common::repository;
use common::settle;

#[tokio::test]
async fn writes_invalidate_other_instances() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts([Account::new(1, "alice", 10)]);
    let shared = MemoryCache::new();
    let node_a = repository(&db, Arc::new(shared.clone()), CacheStrategy::write_through());
    let node_b = repository(&db, Arc::new(shared.clone()), CacheStrategy::write_through());

    assert_eq!(node_a.get_by_id(&1).await?.balance, 10);

    node_b.save(Account::new(1, "alice", 50)).await?;
    settle().await;

    assert_eq!(node_a.get_by_id(&1).await?.balance, 50);
    assert_eq!(db.fetches(), 1);

    Ok(())
}

#[tokio::test]
async fn write_behind_saves_invalidate_other_instances() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts([Account::new(1, "alice", 10)]);
    let shared = MemoryCache::new();
    let reader = repository(&db, Arc::new(shared.clone()), CacheStrategy::read_only());
    let writer = repository(&db, Arc::new(shared.clone()), manual_write_behind());

    reader.get_by_id(&1).await?;
    writer.save(Account::new(1, "alice", 70)).await?;
    settle().await;

    // Served from the distributed tier before it reaches the database.
    assert_eq!(reader.get_by_id(&1).await?.balance, 70);
    assert_eq!(db.account(1).map(|a| a.balance), Some(10));

    writer.close().await?;
    assert_eq!(db.account(1).map(|a| a.balance), Some(70));

    Ok(())
}

#[tokio::test]
async fn evict_all_reaches_other_instances() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts([Account::new(1, "alice", 10)]);
    let shared = MemoryCache::new();
    let node_a = repository(&db, Arc::new(shared.clone()), CacheStrategy::read_through());
    let node_b = repository(&db, Arc::new(shared.clone()), CacheStrategy::read_through());

    node_a.get_by_id(&1).await?;
    assert_eq!(node_b.evict_all().await, 1);
    settle().await;

    node_a.get_by_id(&1).await?;
    assert_eq!(db.fetches(), 2);

    Ok(())
}

#[tokio::test]
async fn own_notices_are_ignored() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::new();
    let cache = FlakyCache::new();
    let repo = repository(&db, cache.clone(), CacheStrategy::write_through());

    repo.save(Account::new(1, "alice", 10)).await?;
    settle().await;

    let reads = cache.reads();
    repo.get_by_id(&1).await?;
    assert_eq!(cache.reads(), reads);

    Ok(())
}

#[tokio::test]
async fn entries_expire() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts([Account::new(1, "alice", 10)]);
    let strategy = CacheStrategy::read_through().with_ttl(Duration::from_millis(100));
    let repo = repository(&db, Arc::new(MemoryCache::new()), strategy);

    repo.get_by_id(&1).await?;
    repo.get_by_id(&1).await?;
    assert_eq!(db.fetches(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    repo.get_by_id(&1).await?;
    assert_eq!(db.fetches(), 2);

    Ok(())
}

#[tokio::test]
async fn clear_everything_notice_empties_the_near_cache() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts([Account::new(1, "alice", 10)]);
    let cache = FlakyCache::new();
    let repo = repository(&db, cache.clone(), CacheStrategy::read_through());

    repo.get_by_id(&1).await?;
    let reads = cache.reads();
    repo.get_by_id(&1).await?;
    assert_eq!(cache.reads(), reads);

    // What a backend sends once its interrupted notice stream is back.
    cache.publish(Invalidation::everything()).await?;
    settle().await;

    repo.get_by_id(&1).await?;
    assert_eq!(cache.reads(), reads + 1);
    assert_eq!(db.fetches(), 1);

    Ok(())
}
