mod common;

use std::sync::Arc;

use cache_repo::prelude::*;
use cache_repo::test::Account;
use cache_repo::test::FlakyCache;
use cache_repo::test::MemoryDatabase;
use common::repository;

#[tokio::test]
async fn new_entity_is_inserted_then_cached() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::new();
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::write_through());

    let saved = repo.save(Account::new(1, "alice", 10)).await?;
    assert_eq!(db.account(1), Some(saved.clone()));
    assert_eq!(db.existence_checks(), 1);

    assert_eq!(repo.get_by_id(&1).await?, saved);
    assert_eq!(db.fetches(), 0);

    Ok(())
}

#[tokio::test]
async fn uncached_existing_row_is_updated() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts([Account::new(1, "alice", 10)]);
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::write_through());

    repo.save(Account::new(1, "alice", 25)).await?;
    assert_eq!(db.account(1).map(|a| a.balance), Some(25));
    assert_eq!(db.row_count(), 1);

    Ok(())
}

#[tokio::test]
async fn cached_entity_skips_the_existence_check() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts([Account::new(1, "alice", 10)]);
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::write_through());

    let account = repo.get_by_id(&1).await?;
    repo.save(account.deposit(5)).await?;
    assert_eq!(db.existence_checks(), 0);
    assert_eq!(db.account(1).map(|a| a.balance), Some(15));

    Ok(())
}

#[tokio::test]
async fn failed_write_leaves_caches_alone() {
    let db = MemoryDatabase::with_accounts([Account::new(1, "alice", 10)]);
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::write_through());

    let account = repo.get_by_id(&1).await.unwrap();
    db.fail_writes(true);
    let err = repo.save(account.clone().deposit(90)).await.unwrap_err();
    assert!(err.is_data_access());

    assert_eq!(repo.get_by_id(&1).await.unwrap(), account);
    assert_eq!(db.account(1), Some(account));
}

#[tokio::test]
async fn read_through_writes_like_write_through() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::new();
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::read_through());

    repo.save(Account::new(7, "grace", 70)).await?;
    assert_eq!(db.account(7).map(|a| a.owner), Some("grace".to_string()));

    Ok(())
}

#[tokio::test]
async fn save_all_is_one_transaction() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts([Account::new(1, "alice", 10)]);
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::write_through());

    let saved = repo
        .save_all(vec![
            Account::new(1, "alice", 11),
            Account::new(2, "bob", 20),
            Account::new(2, "bob", 21),
        ])
        .await?;
    assert_eq!(saved.len(), 3);

    let batches = db.batches();
    assert_eq!(batches.len(), 1);
    let kinds = batches[0]
        .iter()
        .map(|s| (s.id(), s.is_insert()))
        .collect::<Vec<_>>();
    assert_eq!(kinds, vec![(1, false), (2, true), (2, false)]);

    assert_eq!(db.account(2).map(|a| a.balance), Some(21));
    assert_eq!(repo.get_by_id(&2).await?.balance, 21);
    assert_eq!(db.fetches(), 0);

    Ok(())
}

#[tokio::test]
async fn failed_save_all_writes_nothing() {
    let db = MemoryDatabase::with_accounts([Account::new(1, "alice", 10)]);
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::write_through());

    db.fail_next_writes(1);
    let result = repo
        .save_all(vec![Account::new(2, "bob", 20), Account::new(3, "carol", 30)])
        .await;
    assert!(result.unwrap_err().is_data_access());
    assert_eq!(db.row_count(), 1);
    assert_eq!(repo.find_by_id(&2).await.unwrap(), None);
}

#[tokio::test]
async fn read_only_rejects_writes() {
    let db = MemoryDatabase::new();
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::read_only());

    let err = repo.save(Account::new(1, "alice", 10)).await.unwrap_err();
    assert!(err.is_unsupported());
    assert_eq!(
        err.to_string(),
        "operation 'save' is not supported by a read-only repository"
    );
    assert!(repo.save_all(vec![]).await.unwrap_err().is_unsupported());
    assert_eq!(db.executes(), 0);
}

#[tokio::test]
async fn cache_outage_does_not_fail_writes() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::new();
    let cache = FlakyCache::new();
    cache.set_down(true);
    let repo = repository(&db, cache.clone(), CacheStrategy::write_through());

    repo.save(Account::new(1, "alice", 10)).await?;
    assert_eq!(db.row_count(), 1);

    Ok(())
}

#[tokio::test]
async fn eviction_forces_a_reload() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::with_accounts((1..=3).map(|id| Account::new(id, format!("u{id}"), 0)));
    let shared = MemoryCache::new();
    let repo = repository(&db, Arc::new(shared.clone()), CacheStrategy::read_through());

    for id in 1..=3 {
        repo.get_by_id(&id).await?;
    }
    assert_eq!(db.fetches(), 3);

    repo.evict(&2).await;
    assert!(!shared.contains("accounts:2"));
    repo.get_by_id(&2).await?;
    assert_eq!(db.fetches(), 4);

    // Another namespace must survive.
    shared.set("orders:1", vec![1], std::time::Duration::ZERO).await?;
    assert_eq!(repo.evict_all().await, 3);
    assert!(shared.contains("orders:1"));

    repo.get_by_id(&1).await?;
    assert_eq!(db.fetches(), 5);

    Ok(())
}

#[tokio::test]
async fn closed_repository_rejects_writes() {
    let db = MemoryDatabase::with_accounts([Account::new(1, "alice", 10)]);
    let repo = repository(&db, Arc::new(MemoryCache::new()), CacheStrategy::write_through());

    assert_eq!(repo.close().await.unwrap(), FlushReport::default());
    assert!(repo.is_closed());
    assert!(matches!(
        repo.save(Account::new(2, "bob", 1)).await,
        Err(RepositoryError::Closed)
    ));
    // Reads are still served.
    assert_eq!(repo.get_by_id(&1).await.unwrap().owner, "alice");
}
