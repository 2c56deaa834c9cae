//! Runs a stream of random account updates through a cached repository and reports what reached the database.
//!
//! ```text
//! RUST_LOG=cache_repo=debug cargo run --example write_behind --features demo -- --updates 5000 --mode write-behind
//! ```

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use cache_repo::prelude::*;
use cache_repo::test::Account;
use cache_repo::test::AccountMapper;
use cache_repo::test::MemoryDatabase;
use cache_repo::test::RecordingObserver;
use clap::Parser;
use rand::Rng;
use tracing::info;

#[derive(Debug, Clone, Parser)]
#[clap(about, version, author, name = "write_behind")]
struct Cli {
    /// Repository mode: read-only, read-through, write-through or write-behind.
    #[clap(long, env = "CACHE_REPO_MODE", default_value = "write-behind")]
    mode: CacheMode,

    /// Number of accounts to create.
    #[clap(long, env = "CACHE_REPO_ACCOUNTS", default_value_t = 100)]
    accounts: u64,

    /// Number of random updates to perform.
    #[clap(long, env = "CACHE_REPO_UPDATES", default_value_t = 1_000)]
    updates: u64,

    /// Simulated database latency, milliseconds.
    #[clap(long, env = "CACHE_REPO_DB_LATENCY", default_value_t = 2)]
    db_latency: u64,

    /// Write-behind flush interval, milliseconds.
    #[clap(long, env = "CACHE_REPO_FLUSH_INTERVAL", default_value_t = 200)]
    flush_interval: u64,

    #[clap(long, env = "CACHE_REPO_MAX_BATCH_SIZE", default_value_t = 100)]
    max_batch_size: usize,

    #[clap(long, env = "CACHE_REPO_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Cache entry time-to-live, seconds. 0 disables expiration.
    #[clap(long, env = "CACHE_REPO_TTL", default_value_t = 600)]
    ttl: u64,

    /// Disable the in-process near-cache.
    #[clap(long, env = "CACHE_REPO_NO_NEAR_CACHE", default_value_t = false)]
    no_near_cache: bool,

    /// Redis URL. The in-memory distributed cache is used if not set.
    #[cfg(feature = "redis")]
    #[clap(long, env = "CACHE_REPO_REDIS_URL")]
    redis_url: Option<String>,
}

impl Cli {
    fn strategy(&self) -> CacheStrategy {
        CacheStrategy::new(self.mode)
            .with_near_cache(!self.no_near_cache)
            .with_ttl(Duration::from_secs(self.ttl))
            .with_flush_interval(Duration::from_millis(self.flush_interval))
            .with_max_batch_size(self.max_batch_size)
            .with_max_retries(self.max_retries)
    }

    async fn cache_backend(&self) -> Result<Arc<dyn DistributedCache>> {
        #[cfg(feature = "redis")]
        if let Some(ref url) = self.redis_url {
            info!("Using Redis at {url}");
            return Ok(Arc::new(cache_repo::backend::RedisCache::connect(url).await?));
        }

        Ok(Arc::new(MemoryCache::new()))
    }
}

fn setup_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::from_default_env();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    info!("Tracing initialized");

    Ok(())
}

async fn run_updates(repo: &CacheRepository<AccountMapper>, cli: &Cli) -> Result<u64> {
    let mut done = 0;
    for _ in 0..cli.updates {
        let id = rand::rng().random_range(1..=cli.accounts);
        let amount = rand::rng().random_range(-50..=100);
        let account = repo.get_by_id(&id).await?;
        if repo.mode().is_writable() {
            repo.save(account.deposit(amount)).await?;
        }
        done += 1;
    }
    Ok(done)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing()?;

    let db = MemoryDatabase::with_accounts((1..=cli.accounts).map(Account::fake));
    db.set_latency(Duration::from_millis(cli.db_latency));
    let observer = RecordingObserver::new();

    let repo = CacheRepository::<AccountMapper>::builder()
        .namespace("accounts")
        .mapper(Arc::new(AccountMapper))
        .database(db.clone())
        .cache_backend(cli.cache_backend().await?)
        .strategy(cli.strategy())
        .observer(observer.clone())
        .build()?;

    info!("Running {} updates over {} accounts in {} mode", cli.updates, cli.accounts, cli.mode);
    let started = Instant::now();

    let updates = tokio::select! {
        result = run_updates(&repo, &cli) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            0
        }
    };
    let elapsed = started.elapsed();

    let report = repo.close().await?;
    let flushes = observer.flushes();

    println!("updates:            {updates} in {elapsed:?}");
    println!("database reads:     {}", db.fetches());
    println!("database writes:    {}", db.executes());
    println!("write-behind flushes: {} ({} rows)", flushes.len(), flushes.iter().map(|f| f.size).sum::<usize>());
    println!("drained on close:   {} written, {} dead-lettered", report.written, report.dead_lettered);
    println!("dead letters:       {}", observer.dead_letters().len());

    Ok(())
}
