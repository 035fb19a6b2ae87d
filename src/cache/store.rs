use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// String key/value store with optional per-entry expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
}

pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }
}

const PURGE_EVERY: u64 = 256;

#[derive(Default)]
struct Entries {
    map: HashMap<String, (String, Option<Instant>)>,
    writes: u64,
}

impl Entries {
    fn purge_expired(&mut self, now: Instant) {
        self.map
            .retain(|_, (_, deadline)| deadline.is_none_or(|deadline| deadline > now));
    }
}

/// In-process store. Expired entries are dropped when read, and all of them
/// are swept every [`PURGE_EVERY`] writes.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().map.len()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut guard = self.lock();
        let entries = &mut guard.map;
        let expired = match entries.get(key) {
            Some((_, Some(deadline))) => Instant::now() >= *deadline,
            Some((_, None)) => false,
            None => return Ok(None),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.writes += 1;
        if entries.writes % PURGE_EVERY == 0 {
            entries.purge_expired(now);
        }
        entries
            .map
            .insert(key.to_string(), (value.to_string(), ttl.map(|ttl| now + ttl)));
        Ok(())
    }
}
