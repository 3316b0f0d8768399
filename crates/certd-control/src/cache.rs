//! OCSP status cache shared by gateways and workers.
//!
//! Slots are keyed by `(ca_id, serial)` and versioned by
//! `(key_generation, status_version, this_update)`. A write never replaces a
//! newer slot, so a delayed refresh cannot resurrect a superseded status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Cache encoding error: {0}")]
    Encoding(String),

    #[error("Unsupported cache URL: {0}")]
    UnsupportedUrl(String),
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        CacheError::Encoding(err.to_string())
    }
}

/// A signed response ready to be served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// DER `OCSPResponse`
    pub der: Vec<u8>,
    /// `good`, `revoked` or `unknown`
    pub status: String,
    /// Unix seconds
    pub this_update: i64,
    /// Unix seconds
    pub next_update: i64,
    pub status_version: i64,
    pub key_generation: i32,
}

/// One cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheSlot {
    Entry(CachedResponse),
    /// Marks a status change whose new response is not signed yet
    Tombstone { status_version: i64, key_generation: i32 },
}

impl CacheSlot {
    fn rank(&self) -> (i32, i64, i64) {
        match self {
            CacheSlot::Entry(entry) => (entry.key_generation, entry.status_version, entry.this_update),
            // A tombstone outranks any entry of the same version
            CacheSlot::Tombstone {
                status_version,
                key_generation,
            } => (*key_generation, *status_version, i64::MAX),
        }
    }

    /// Whether `self` may replace `current`.
    pub fn supersedes(&self, current: &CacheSlot) -> bool {
        match (self, current) {
            // A signed entry for the tombstoned version replaces it
            (
                CacheSlot::Entry(entry),
                CacheSlot::Tombstone {
                    status_version,
                    key_generation,
                },
            ) => (entry.key_generation, entry.status_version) >= (*key_generation, *status_version),
            _ => self.rank() > current.rank(),
        }
    }

    pub fn entry(&self) -> Option<&CachedResponse> {
        match self {
            CacheSlot::Entry(entry) => Some(entry),
            CacheSlot::Tombstone { .. } => None,
        }
    }
}

fn slot_key(ca_id: &str, serial: i64) -> String {
    format!("certd:ocsp:{}:{}", ca_id, serial)
}

#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn get(&self, ca_id: &str, serial: i64) -> Result<Option<CacheSlot>, CacheError>;

    /// Store `entry` unless a newer slot is present. Returns whether it was stored.
    async fn put(&self, ca_id: &str, serial: i64, entry: CachedResponse) -> Result<bool, CacheError>;

    /// Replace any entry older than `(key_generation, status_version)` with a tombstone.
    async fn invalidate(
        &self,
        ca_id: &str,
        serial: i64,
        status_version: i64,
        key_generation: i32,
    ) -> Result<(), CacheError>;

    /// Record `token` once. Returns false if it was already claimed.
    async fn claim_once(&self, token: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

/// In-process cache for single-host deployments and tests
#[derive(Default)]
pub struct MemoryStatusCache {
    slots: DashMap<String, CacheSlot>,
    claims: DashMap<String, DateTime<Utc>>,
}

impl MemoryStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, key: String, slot: CacheSlot) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.slots.entry(key) {
            Entry::Occupied(mut occupied) => {
                if slot.supersedes(occupied.get()) {
                    occupied.insert(slot);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                true
            }
        }
    }
}

#[async_trait]
impl StatusCache for MemoryStatusCache {
    async fn get(&self, ca_id: &str, serial: i64) -> Result<Option<CacheSlot>, CacheError> {
        Ok(self
            .slots
            .get(&slot_key(ca_id, serial))
            .map(|slot| slot.value().clone()))
    }

    async fn put(&self, ca_id: &str, serial: i64, entry: CachedResponse) -> Result<bool, CacheError> {
        Ok(self.store(slot_key(ca_id, serial), CacheSlot::Entry(entry)))
    }

    async fn invalidate(
        &self,
        ca_id: &str,
        serial: i64,
        status_version: i64,
        key_generation: i32,
    ) -> Result<(), CacheError> {
        self.store(
            slot_key(ca_id, serial),
            CacheSlot::Tombstone {
                status_version,
                key_generation,
            },
        );
        Ok(())
    }

    async fn claim_once(&self, token: &str, ttl: Duration) -> Result<bool, CacheError> {
        use dashmap::mapref::entry::Entry;
        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

        // Drop expired claims opportunistically
        if self.claims.len() > 10_000 {
            self.claims.retain(|_, exp| *exp > now);
        }

        match self.claims.entry(token.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    Ok(false)
                } else {
                    occupied.insert(expires);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(expires);
                Ok(true)
            }
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(feature = "redis")]
mod redis_backend {
    use super::*;
    use redis::aio::ConnectionManager;

    /// Retention of cache slots; entries are refreshed well before this.
    const SLOT_TTL_SECS: u64 = 7 * 24 * 3600;

    /// Redis-backed cache shared across hosts.
    ///
    /// Writes are read-compare-write: a concurrent writer can win the
    /// race, after which the next refresh repairs the slot.
    pub struct RedisStatusCache {
        connection: ConnectionManager,
    }

    impl RedisStatusCache {
        pub async fn connect(url: &str) -> Result<Self, CacheError> {
            let client =
                redis::Client::open(url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
            let connection = ConnectionManager::new(client)
                .await
                .map_err(|e| CacheError::Unavailable(e.to_string()))?;
            info!("Connected to Redis status cache");
            Ok(Self { connection })
        }

        async fn read(&self, key: &str) -> Result<Option<CacheSlot>, CacheError> {
            let mut conn = self.connection.clone();
            let raw: Option<Vec<u8>> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            match raw {
                Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
                None => Ok(None),
            }
        }

        async fn store(&self, key: &str, slot: CacheSlot) -> Result<bool, CacheError> {
            if let Some(current) = self.read(key).await? {
                if !slot.supersedes(&current) {
                    return Ok(false);
                }
            }
            let bytes = bincode::serialize(&slot)?;
            let mut conn = self.connection.clone();
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(bytes)
                .arg("EX")
                .arg(SLOT_TTL_SECS)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            Ok(true)
        }
    }

    fn unavailable(err: redis::RedisError) -> CacheError {
        CacheError::Unavailable(err.to_string())
    }

    #[async_trait]
    impl StatusCache for RedisStatusCache {
        async fn get(&self, ca_id: &str, serial: i64) -> Result<Option<CacheSlot>, CacheError> {
            self.read(&slot_key(ca_id, serial)).await
        }

        async fn put(
            &self,
            ca_id: &str,
            serial: i64,
            entry: CachedResponse,
        ) -> Result<bool, CacheError> {
            self.store(&slot_key(ca_id, serial), CacheSlot::Entry(entry))
                .await
        }

        async fn invalidate(
            &self,
            ca_id: &str,
            serial: i64,
            status_version: i64,
            key_generation: i32,
        ) -> Result<(), CacheError> {
            self.store(
                &slot_key(ca_id, serial),
                CacheSlot::Tombstone {
                    status_version,
                    key_generation,
                },
            )
            .await?;
            Ok(())
        }

        async fn claim_once(&self, token: &str, ttl: Duration) -> Result<bool, CacheError> {
            let mut conn = self.connection.clone();
            let set: Option<String> = redis::cmd("SET")
                .arg(format!("certd:claim:{}", token))
                .arg(1)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            Ok(set.is_some())
        }

        async fn ping(&self) -> Result<(), CacheError> {
            let mut conn = self.connection.clone();
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            Ok(())
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_backend::RedisStatusCache;

/// Open the cache named by `url`: `memory://` or `redis://...`.
pub async fn connect_cache(url: &str) -> Result<Arc<dyn StatusCache>, CacheError> {
    if url.starts_with("memory://") {
        info!("Using in-memory status cache");
        return Ok(Arc::new(MemoryStatusCache::new()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        #[cfg(feature = "redis")]
        {
            return Ok(Arc::new(RedisStatusCache::connect(url).await?));
        }
        #[cfg(not(feature = "redis"))]
        {
            return Err(CacheError::UnsupportedUrl(format!(
                "{} (built without the redis feature)",
                url
            )));
        }
    }
    Err(CacheError::UnsupportedUrl(url.to_string()))
}
