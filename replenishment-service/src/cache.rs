//! Cache and lock client.
//!
//! All cross-process state goes through a [`CacheStore`]: the rebuild lock,
//! cursors, raw aggregates and the derived dashboard. [`Cache`] is the
//! cloneable handle components own; it adds JSON encoding and the owned-token
//! lock API on top of the raw store.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CacheError;

pub type Result<T> = std::result::Result<T, CacheError>;

pub mod keys {
    pub const LOCATIONS: &str = "taps:locations";
    pub const SUPPLIERS: &str = "taps:suppliers";
    pub const INVENTORY: &str = "taps:inventory";
    pub const INVENTORY_META: &str = "taps:inventory_meta";
    pub const SALES: &str = "taps:sales";
    pub const SALES_TOTALS: &str = "taps:sales_totals";
    pub const SALES_META: &str = "taps:sales_meta";
    pub const DASHBOARD: &str = "taps:dashboard";
    pub const REBUILD_LOCK: &str = "taps:rebuild:lock";
    pub const REBUILD_PROGRESS: &str = "taps:rebuild:progress";

    pub fn cursor(location: &str) -> String {
        format!("taps:cursor:{}", location)
    }

    pub fn sales_items(location: &str) -> String {
        format!("taps:sales_items:{}", location)
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Stores `value` only if `key` is absent. Returns whether it was stored.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Deletes `key` only while it still holds `expected`, atomically.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Remaining time to live; `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
}

/// Proof of holding the rebuild lock. Consumed by [`Cache::release_lock`].
#[derive(Debug)]
pub struct LockToken {
    key: String,
    token: String,
}

#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.store.set_ex(key, &json, ttl).await?;
        debug!(key = %key, ttl_secs = ttl.as_secs(), bytes = json.len(), "Cached value");
        Ok(())
    }

    /// Reads a value, logging and swallowing backend errors as a miss.
    pub async fn get_json_or_miss<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.get_json(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, "Cache read failed, treating as miss: {}", e);
                None
            }
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.store.get(key).await?.is_some())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(key).await
    }

    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.store.ttl(key).await
    }

    pub async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = Uuid::new_v4().to_string();
        if self.store.set_nx_ex(key, &token, ttl).await? {
            Ok(Some(LockToken {
                key: key.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Releases the lock if it is still ours. Never force-deletes.
    pub async fn release_lock(&self, lock: LockToken) -> Result<bool> {
        let released = self.store.compare_and_delete(&lock.key, &lock.token).await?;
        if !released {
            warn!(key = %lock.key, "Lock no longer held by this run, leaving it in place");
        }
        Ok(released)
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

/// Process-local store used when no Redis is configured, and in tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let matches = entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && entry.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline - now))
    }
}
