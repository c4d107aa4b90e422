use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::clock::Clock;
use crate::errors::LookupError;

/// Raw key/value storage behind the typed cache.
///
/// Values are opaque JSON strings; a `ttl` of zero means the entry never
/// expires.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, LookupError>;
    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> Result<(), LookupError>;
    async fn remove(&self, key: &str) -> Result<(), LookupError>;
}

/// Typed JSON cache over a [`CacheStore`].
///
/// A stored payload that fails to decode is treated as a miss and evicted, so
/// format skew between releases heals itself.
#[derive(Clone)]
pub struct LookupCache {
    store: Arc<dyn CacheStore>,
}

impl LookupCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(MemoryStore::new(clock)))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, LookupError> {
        let Some(raw) = self.store.get_raw(key).await? else {
            debug!(key, "cache miss");
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(key, "cache hit");
                Ok(Some(value))
            }
            Err(err) => {
                debug!(key, %err, "cache payload failed to decode, evicting");
                self.store.remove(key).await?;
                Ok(None)
            }
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), LookupError> {
        let payload = serde_json::to_string(value)
            .map_err(|err| LookupError::Storage(format!("cache encode for {}: {}", key, err)))?;
        self.store.set_raw(key, payload, ttl).await?;
        debug!(key, "cached");
        Ok(())
    }
}

struct MemoryEntry {
    payload: String,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process store guarded by a single mutex; expiry is evaluated against the
/// injected clock and expired entries are evicted on read.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, LookupError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|at| now >= at) {
                    entries.remove(key);
                    return Ok(None);
                }
                Ok(Some(entry.payload.clone()))
            }
            None => Ok(None),
        }
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> Result<(), LookupError> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            chrono::Duration::from_std(ttl)
                .ok()
                .map(|d| self.clock.now() + d)
        };
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.insert(
            key.to_string(),
            MemoryEntry {
                payload: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), LookupError> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.remove(key);
        Ok(())
    }
}

/// Shared store on redis. Every key carries the operator-configured prefix;
/// expiry is delegated to server-side TTLs.
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl RedisStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, LookupError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(self.prefixed(key)).await?;
        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> Result<(), LookupError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.prefixed(key);
        if ttl.is_zero() {
            conn.set::<_, _, ()>(key, value).await?;
        } else {
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await?;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), LookupError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(self.prefixed(key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        count: u32,
    }

    fn manual_cache() -> (LookupCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = LookupCache::memory(clock.clone());
        (cache, clock)
    }

    #[tokio::test]
    async fn round_trip_within_ttl() {
        let (cache, clock) = manual_cache();
        let value = Payload {
            name: "ns1.example.com".into(),
            count: 2,
        };

        cache
            .set("ns:ns1.example.com", &value, Duration::from_secs(300))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(299));
        let got: Option<Payload> = cache.get("ns:ns1.example.com").await.unwrap();
        assert_eq!(got, Some(value));
    }

    #[tokio::test]
    async fn expired_entry_is_missed_and_evicted() {
        let (cache, clock) = manual_cache();
        let value = Payload {
            name: "x".into(),
            count: 1,
        };
        cache
            .set("domain:example.com", &value, Duration::from_secs(60))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(60));
        let got: Option<Payload> = cache.get("domain:example.com").await.unwrap();
        assert!(got.is_none());

        // Even after rolling the clock back, the entry is gone.
        clock.advance(Duration::ZERO);
        let again: Option<Payload> = cache.get("domain:example.com").await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn zero_ttl_never_expires() {
        let (cache, clock) = manual_cache();
        let value = Payload {
            name: "y".into(),
            count: 9,
        };
        cache.set("k", &value, Duration::ZERO).await.unwrap();
        clock.advance(Duration::from_secs(86_400 * 365));
        let got: Option<Payload> = cache.get("k").await.unwrap();
        assert_eq!(got, Some(value));
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_miss_and_evicted() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new(clock));
        let cache = LookupCache::new(store.clone());

        store
            .set_raw("domain:example.com", "{not json".into(), Duration::ZERO)
            .await
            .unwrap();

        let got: Option<Payload> = cache.get("domain:example.com").await.unwrap();
        assert!(got.is_none());

        // The corrupt entry was removed from the underlying store.
        assert!(store.get_raw("domain:example.com").await.unwrap().is_none());
    }

    #[test]
    fn redis_keys_are_prefixed() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let store = RedisStore::new(client, "op1:");
        assert_eq!(store.prefixed("domain:example.com"), "op1:domain:example.com");
    }
}
