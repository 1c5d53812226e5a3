//! Per-entity tracking of the last reconciled `.metadata.generation`
//!
//! Keys are the opaque `uid` rather than `namespace/name` because the uid
//! survives name reuse. A missing key is the normal "never seen" signal;
//! entries carry no TTL and are evicted only on successful deletion.

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cache backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("stored generation was not valid json: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Storage contract for observed generations.
///
/// Implementations must be safe under concurrent calls; per-uid
/// serialization is a property of the caller (the watch loop processes one
/// event at a time), not of the cache.
#[async_trait]
pub trait GenerationCache: Send + Sync + 'static {
    /// `None` means the uid has never been reconciled (or was evicted).
    async fn try_get(&self, uid: &str) -> Result<Option<i64>>;

    async fn set(&self, uid: &str, generation: i64) -> Result<()>;

    /// Idempotent.
    async fn remove(&self, uid: &str) -> Result<()>;
}

/// Process-local cache.
///
/// The lock is only held for the map operation itself, never across awaits.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<AHashMap<String, i64>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GenerationCache for MemoryCache {
    async fn try_get(&self, uid: &str) -> Result<Option<i64>> {
        Ok(self.entries.read().get(uid).copied())
    }

    async fn set(&self, uid: &str, generation: i64) -> Result<()> {
        self.entries.write().insert(uid.to_owned(), generation);
        Ok(())
    }

    async fn remove(&self, uid: &str) -> Result<()> {
        self.entries.write().remove(uid);
        Ok(())
    }
}

/// External key-value backend for [`LayeredCache`].
///
/// Values are opaque bytes; the cache encodes generations as JSON numbers.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Read-through/write-through chain of a [`MemoryCache`] over an external
/// store, so replicas share observed generations across restarts.
pub struct LayeredCache {
    local: MemoryCache,
    store: Arc<dyn KeyValueStore>,
    key_prefix: String,
}

impl LayeredCache {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            local: MemoryCache::new(),
            store,
            key_prefix: key_prefix.into(),
        }
    }

    fn store_key(&self, uid: &str) -> String {
        format!("{}:{uid}", self.key_prefix)
    }
}

#[async_trait]
impl GenerationCache for LayeredCache {
    async fn try_get(&self, uid: &str) -> Result<Option<i64>> {
        if let Some(generation) = self.local.try_get(uid).await? {
            return Ok(Some(generation));
        }
        let Some(raw) = self.store.get(&self.store_key(uid)).await? else {
            return Ok(None);
        };
        let generation: i64 = serde_json::from_slice(&raw)?;
        self.local.set(uid, generation).await?;
        Ok(Some(generation))
    }

    async fn set(&self, uid: &str, generation: i64) -> Result<()> {
        self.store
            .set(&self.store_key(uid), serde_json::to_vec(&generation)?)
            .await?;
        self.local.set(uid, generation).await
    }

    async fn remove(&self, uid: &str) -> Result<()> {
        self.store.remove(&self.store_key(uid)).await?;
        self.local.remove(uid).await
    }
}
