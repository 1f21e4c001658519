//! Shared key-value cache fabric.
//!
//! Every component that talks to the upstream APIs funnels its results
//! through this cache, with per-entry TTLs. The production backend is redis
//! (one pooled connection manager per process); `memory://` selects an
//! in-process backend for development and hermetic tests.
//!
//! Failure discipline: reads degrade to a miss (logged at warn) so a cache
//! outage only costs extra upstream traffic; writes surface an error so no
//! partial state is silently dropped.

use crate::error::Result;
use lru::LruCache;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Size bound of the in-process backend; redis does its own eviction.
const MEMORY_CACHE_CAPACITY: usize = 16 * 1024;

#[derive(Clone)]
pub struct Cache {
    backend: Backend,
    prefix: Arc<str>,
}

#[derive(Clone)]
enum Backend {
    Redis(ConnectionManager),
    Memory(Arc<MemoryStore>),
}

impl Cache {
    /// Opens the backend selected by the URI. Redis connections are
    /// established eagerly so a misconfigured URI fails at startup.
    pub async fn open(uri: &str, prefix: &str) -> Result<Self> {
        let backend = if uri.starts_with("memory://") {
            Backend::Memory(Arc::new(MemoryStore::default()))
        } else {
            let client = redis::Client::open(uri)?;
            Backend::Redis(ConnectionManager::new(client).await?)
        };
        Ok(Cache {
            backend,
            prefix: Arc::from(prefix),
        })
    }

    /// In-process cache, for tests.
    pub fn in_memory() -> Self {
        Cache {
            backend: Backend::Memory(Arc::new(MemoryStore::default())),
            prefix: Arc::from("test"),
        }
    }

    /// Builds a namespaced key: `<prefix>:<segment>:<segment>...`.
    pub fn key(&self, segments: &[&str]) -> String {
        let mut key = self.prefix.to_string();
        for segment in segments {
            key.push(':');
            key.push_str(segment);
        }
        key
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                match redis::cmd("GET").arg(key).query_async(&mut conn).await {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(key, %err, "cache read failed, treating as miss");
                        None
                    }
                }
            }
            Backend::Memory(store) => store.get(key),
        }
    }

    pub async fn mget(&self, keys: &[String]) -> Vec<Option<String>> {
        if keys.is_empty() {
            return Vec::new();
        }
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                match redis::cmd("MGET").arg(keys).query_async(&mut conn).await {
                    Ok(values) => values,
                    Err(err) => {
                        warn!(%err, "cache mget failed, treating all as misses");
                        vec![None; keys.len()]
                    }
                }
            }
            Backend::Memory(store) => keys.iter().map(|k| store.get(k)).collect(),
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                match redis::cmd("EXISTS").arg(key).query_async::<_, bool>(&mut conn).await {
                    Ok(exists) => exists,
                    Err(err) => {
                        warn!(key, %err, "cache exists failed, treating as absent");
                        false
                    }
                }
            }
            Backend::Memory(store) => store.exists(key),
        }
    }

    pub async fn sismember(&self, key: &str, member: &str) -> bool {
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                match redis::cmd("SISMEMBER")
                    .arg(key)
                    .arg(member)
                    .query_async::<_, bool>(&mut conn)
                    .await
                {
                    Ok(found) => found,
                    Err(err) => {
                        warn!(key, %err, "cache sismember failed, treating as absent");
                        false
                    }
                }
            }
            Backend::Memory(store) => store.sismember(key, member),
        }
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(ttl.as_secs())
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.set(key, value, ttl);
                Ok(())
            }
        }
    }

    pub async fn mset_with_ttl(&self, pairs: &[(String, String)], ttl: Duration) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let mut pipe = redis::pipe();
                for (key, value) in pairs {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("EX")
                        .arg(ttl.as_secs())
                        .ignore();
                }
                pipe.query_async::<_, ()>(&mut conn).await?;
                Ok(())
            }
            Backend::Memory(store) => {
                for (key, value) in pairs {
                    store.set(key, value, ttl);
                }
                Ok(())
            }
        }
    }

    /// Replaces nothing: adds all members to the set, then (re)sets its TTL.
    pub async fn sadd_with_ttl(&self, key: &str, members: &[String], ttl: Duration) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let mut pipe = redis::pipe();
                pipe.cmd("SADD").arg(key).arg(members).ignore();
                pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs()).ignore();
                pipe.query_async::<_, ()>(&mut conn).await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.sadd(key, members, ttl);
                Ok(())
            }
        }
    }

    pub async fn incr_with_ttl(&self, key: &str, by: i64, ttl: Duration) -> Result<()> {
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let mut pipe = redis::pipe();
                pipe.cmd("INCRBY").arg(key).arg(by).ignore();
                pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs()).ignore();
                pipe.query_async::<_, ()>(&mut conn).await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.incr_float(key, by as f64, ttl);
                Ok(())
            }
        }
    }

    pub async fn incr_float_with_ttl(&self, key: &str, by: f64, ttl: Duration) -> Result<()> {
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let mut pipe = redis::pipe();
                pipe.cmd("INCRBYFLOAT").arg(key).arg(by).ignore();
                pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs()).ignore();
                pipe.query_async::<_, ()>(&mut conn).await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.incr_float(key, by, ttl);
                Ok(())
            }
        }
    }

    /// Drops a key, used by tests to simulate expiry.
    pub async fn delete(&self, key: &str) -> Result<()> {
        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
                Ok(())
            }
            Backend::Memory(store) => {
                store.delete(key);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.backend {
            Backend::Redis(_) => "redis",
            Backend::Memory(_) => "memory",
        };
        f.debug_struct("Cache")
            .field("backend", &backend)
            .field("prefix", &self.prefix)
            .finish()
    }
}

struct MemoryStore {
    slots: Mutex<LruCache<String, Slot>>,
}

struct Slot {
    entry: Entry,
    expires_at: Instant,
}

enum Entry {
    Text(String),
    Set(HashSet<String>),
}

impl Default for MemoryStore {
    fn default() -> Self {
        let capacity = NonZeroUsize::new(MEMORY_CACHE_CAPACITY).expect("nonzero capacity");
        MemoryStore {
            slots: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl MemoryStore {
    /// Returns the live entry for a key, dropping it if its TTL passed.
    fn live<'a>(slots: &'a mut LruCache<String, Slot>, key: &str) -> Option<&'a Entry> {
        let expired = match slots.get(key) {
            Some(slot) => slot.expires_at <= Instant::now(),
            None => return None,
        };
        if expired {
            slots.pop(key);
            return None;
        }
        slots.get(key).map(|slot| &slot.entry)
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut slots = self.slots.lock();
        match Self::live(&mut slots, key)? {
            Entry::Text(text) => Some(text.clone()),
            Entry::Set(_) => None,
        }
    }

    fn exists(&self, key: &str) -> bool {
        let mut slots = self.slots.lock();
        Self::live(&mut slots, key).is_some()
    }

    fn sismember(&self, key: &str, member: &str) -> bool {
        let mut slots = self.slots.lock();
        match Self::live(&mut slots, key) {
            Some(Entry::Set(set)) => set.contains(member),
            _ => false,
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut slots = self.slots.lock();
        slots.put(
            key.to_string(),
            Slot {
                entry: Entry::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn sadd(&self, key: &str, members: &[String], ttl: Duration) {
        let mut slots = self.slots.lock();
        let expires_at = Instant::now() + ttl;
        if Self::live(&mut slots, key).is_none() {
            slots.put(
                key.to_string(),
                Slot {
                    entry: Entry::Set(HashSet::new()),
                    expires_at,
                },
            );
        }
        if let Some(slot) = slots.get_mut(key) {
            if let Entry::Set(set) = &mut slot.entry {
                set.extend(members.iter().cloned());
            }
            slot.expires_at = expires_at;
        }
    }

    fn incr_float(&self, key: &str, by: f64, ttl: Duration) {
        let mut slots = self.slots.lock();
        let current = match Self::live(&mut slots, key) {
            Some(Entry::Text(text)) => text.parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        };
        let expires_at = slots
            .get(key)
            .map(|slot| slot.expires_at)
            .unwrap_or_else(|| Instant::now() + ttl);
        slots.put(
            key.to_string(),
            Slot {
                entry: Entry::Text(format_float(current + by)),
                expires_at,
            },
        );
    }

    fn delete(&self, key: &str) {
        self.slots.lock().pop(key);
    }
}

/// Counters are stored as plain decimal strings, integers without a dot.
fn format_float(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
