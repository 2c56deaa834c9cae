use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use redis::Client;
use redis::RedisResult;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::debug;
use tracing::warn;

use crate::error::CacheUnavailableError;
use crate::traits::DistributedCache;
use crate::types::Invalidation;

const DEFAULT_CHANNEL: &str = "cache-repo:invalidations";
const NOTICE_CAPACITY: usize = 1024;
const RECONNECT_MIN: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

// Doubling delay between pub/sub reconnect attempts.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self { next: RECONNECT_MIN }
    }

    fn reset(&mut self) {
        self.next = RECONNECT_MIN;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(RECONNECT_MAX);
        delay
    }
}

/// Redis client. Invalidation notices travel over a pub/sub channel.
pub struct RedisCache {
    client:     Client,
    connection: ConnectionManager,
    channel:    String,
    notices:    broadcast::Sender<Invalidation>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheUnavailableError> {
        let client = Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Ok(Self {
            client,
            connection,
            channel: DEFAULT_CHANNEL.to_string(),
            notices,
            subscriber: Mutex::new(None),
        })
    }

    /// Use a different pub/sub channel for invalidation notices.
    pub fn with_channel<S: ToString>(mut self, channel: S) -> Self {
        self.channel = channel.to_string();
        self
    }

    fn start_subscriber(&self) -> JoinHandle<()> {
        let client = self.client.clone();
        let channel = self.channel.clone();
        let notices = self.notices.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::new();
            let mut resync = false;
            loop {
                match relay(&client, &channel, &notices, resync).await {
                    Ok(()) => {
                        warn!("[redis] pub/sub connection for '{channel}' lost, reconnecting");
                        backoff.reset();
                    }
                    Err(err) => warn!("[redis] cannot subscribe to '{channel}': {err}"),
                }
                // Notices published while we were away are gone for good.
                resync = true;
                tokio::time::sleep(backoff.next_delay()).await;
            }
        })
    }
}

// Forward invalidation notices until the pub/sub connection drops. With `resync`, listeners are told to clear their
// near-caches as soon as the subscription is back.
async fn relay(
    client: &Client,
    channel: &str,
    notices: &broadcast::Sender<Invalidation>,
    resync: bool,
) -> RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    debug!("[redis] subscribed to '{channel}'");

    if resync {
        let _ = notices.send(Invalidation::everything());
    }

    let mut messages = pubsub.into_on_message();
    while let Some(message) = messages.next().await {
        let payload = match message.get_payload::<Vec<u8>>() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("[redis] bad invalidation message: {err}");
                continue;
            }
        };
        match postcard::from_bytes::<Invalidation>(&payload) {
            Ok(invalidation) => {
                let _ = notices.send(invalidation);
            }
            Err(err) => warn!("[redis] cannot decode invalidation notice: {err}"),
        }
    }

    Ok(())
}

// SCAN MATCH treats these as glob syntax.
fn escape_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

impl Drop for RedisCache {
    fn drop(&mut self) {
        if let Some(task) = self.subscriber.lock().take() {
            task.abort();
        }
    }
}

impl Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").field("channel", &self.channel).finish()
    }
}

#[async_trait]
impl DistributedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheUnavailableError> {
        let mut conn = self.connection.clone();
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheUnavailableError> {
        let mut conn = self.connection.clone();
        if ttl.is_zero() {
            conn.set::<_, _, ()>(key, value).await?;
        }
        else {
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            conn.pset_ex::<_, _, ()>(key, value, millis).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheUnavailableError> {
        let mut conn = self.connection.clone();
        Ok(conn.del::<_, u64>(key).await? > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheUnavailableError> {
        let mut conn = self.connection.clone();
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(escape_pattern(prefix)).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn publish(&self, invalidation: Invalidation) -> Result<(), CacheUnavailableError> {
        let payload = postcard::to_stdvec(&invalidation)
            .map_err(|err| CacheUnavailableError::with_source("cannot encode invalidation notice", err))?;
        let mut conn = self.connection.clone();
        conn.publish::<_, _, ()>(&self.channel, payload).await?;
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Invalidation>> {
        let mut subscriber = self.subscriber.lock();
        if subscriber.as_ref().map_or(true, |task| task.is_finished()) {
            *subscriber = Some(self.start_subscriber());
        }
        Some(self.notices.subscribe())
    }
}
