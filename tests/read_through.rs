mod common;

use std::sync::Arc;
use std::time::Duration;

use cache_repo::codec;
use cache_repo::prelude::*;
use cache_repo::test::Account;
use cache_repo::test::AccountRow;
use cache_repo::test::FlakyCache;
use cache_repo::test::MemoryDatabase;
use common::repository;
use tokio::task::JoinSet;

fn accounts() -> Vec<Account> {
    (1..=5).map(|id| Account::new(id, format!("owner{id}"), 100 * id as i64)).collect()
}

#[tokio::test]
async fn cold_read_populates_both_tiers() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts(accounts());
    let cache = FlakyCache::new();
    let repo = repository(&db, cache.clone(), CacheStrategy::read_through());

    let account = repo.get_by_id(&3).await?;
    assert_eq!(account.balance, 300);
    assert_eq!(db.fetches(), 1);
    assert_eq!(cache.writes(), 1);
    assert!(cache.inner().contains("accounts:3"));

    // Near-cache hit: neither the distributed cache nor the database are asked.
    let reads = cache.reads();
    assert_eq!(repo.get_by_id(&3).await?, account);
    assert_eq!(db.fetches(), 1);
    assert_eq!(cache.reads(), reads);

    Ok(())
}

#[tokio::test]
async fn distributed_hit_spares_the_database() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts(accounts());
    let shared = MemoryCache::new();
    let first = repository(&db, Arc::new(shared.clone()), CacheStrategy::read_through());
    let second = repository(&db, Arc::new(shared.clone()), CacheStrategy::read_through());

    first.get_by_id(&1).await?;
    assert_eq!(db.fetches(), 1);

    let account = second.get_by_id(&1).await?;
    assert_eq!(account.owner, "owner1");
    assert_eq!(db.fetches(), 1);

    Ok(())
}

#[tokio::test]
async fn missing_entities_are_not_cached() {
    let db = MemoryDatabase::new();
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::read_through());

    assert_eq!(repo.find_by_id(&42).await.unwrap(), None);
    assert_eq!(repo.find_by_id(&42).await.unwrap(), None);
    assert_eq!(db.fetches(), 2);

    let err = repo.get_by_id(&42).await.unwrap_err();
    assert!(matches!(err, RepositoryError::EntityNotFound(ref id) if id == "42"));
}

#[tokio::test]
async fn concurrent_cold_reads_load_once() {
    let db = MemoryDatabase::with_accounts(accounts());
    db.set_latency(Duration::from_millis(50));
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::read_through());

    let mut readers = JoinSet::new();
    for _ in 0..10 {
        let repo = repo.clone();
        readers.spawn(async move { repo.get_by_id(&2).await });
    }

    while let Some(result) = readers.join_next().await {
        assert_eq!(result.unwrap().unwrap().balance, 200);
    }
    assert_eq!(db.fetches(), 1);
}

#[tokio::test]
async fn database_failure_reaches_the_caller() {
    let db = MemoryDatabase::with_accounts(accounts());
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::read_through());

    db.fail_reads(true);
    let err = repo.find_by_id(&1).await.unwrap_err();
    assert!(err.is_data_access());

    // Failures are not cached either.
    db.fail_reads(false);
    assert_eq!(repo.get_by_id(&1).await.unwrap().owner, "owner1");
}

#[tokio::test]
async fn malformed_row_is_a_data_access_error() {
    let db = MemoryDatabase::new();
    db.put_row(AccountRow {
        id:      9,
        owner:   String::new(),
        email:   String::new(),
        balance: 0,
    });
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::read_through());

    assert!(repo.find_by_id(&9).await.unwrap_err().is_data_access());
}

#[tokio::test]
async fn cache_outage_falls_through_to_the_database() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts(accounts());
    let cache = FlakyCache::new();
    cache.set_down(true);
    let repo = repository(&db, cache.clone(), CacheStrategy::read_through().with_near_cache(false));

    assert_eq!(repo.get_by_id(&4).await?.balance, 400);
    assert_eq!(repo.get_by_id(&4).await?.balance, 400);
    assert_eq!(db.fetches(), 2);

    cache.set_down(false);
    repo.get_by_id(&4).await?;
    repo.get_by_id(&4).await?;
    assert_eq!(db.fetches(), 3);

    Ok(())
}

#[tokio::test]
async fn undecodable_value_is_replaced() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts(accounts());
    let shared = MemoryCache::new();
    shared.set_raw("accounts:5", vec![0xff, 0xff, 0xff]).await;
    let repo = repository(&db, Arc::new(shared.clone()), CacheStrategy::read_through());

    assert_eq!(repo.get_by_id(&5).await?.balance, 500);
    assert_eq!(db.fetches(), 1);

    let bytes = shared.get("accounts:5").await?.expect("repopulated value");
    let entry = codec::decode::<Account>(&bytes)?;
    assert_eq!(entry.entity().owner, "owner5");

    Ok(())
}

#[tokio::test]
async fn reads_without_near_cache_go_to_the_distributed_tier() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts(accounts());
    let cache = FlakyCache::new();
    let repo = repository(&db, cache.clone(), CacheStrategy::read_only().with_near_cache(false));

    for _ in 0..3 {
        repo.get_by_id(&1).await?;
    }
    assert_eq!(db.fetches(), 1);
    assert_eq!(cache.reads(), 3);

    Ok(())
}

#[tokio::test]
async fn invalid_strategy_is_a_config_error() {
    let db = MemoryDatabase::new();
    let repo = repository(
        &db,
        Arc::new(MemoryCache::new()),
        CacheStrategy::read_through().with_near_cache_capacity(0),
    );
    assert!(matches!(repo.find_by_id(&1).await, Err(RepositoryError::Config(_))));
}
