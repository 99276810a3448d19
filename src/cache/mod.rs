//! Named, versioned response caches.
//!
//! A [`CacheStorage`] holds any number of named caches. Each deploy owns
//! exactly one of them, named by [`cache_name`]; every other name is a stale
//! generation that activation deletes. The [`Cache`] handle binds a storage
//! backend to one name.

pub mod disk;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::http::{CacheKey, Response};

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

/// Builds the cache name for a deploy version, e.g. `prefix_v3`.
#[must_use]
pub fn cache_name(prefix: &str, version: u32) -> String {
    format!("{prefix}v{version}")
}

/// Storage backend for named caches.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Creates the named cache if it does not exist yet.
    async fn open(&self, name: &str) -> Result<()>;

    /// Names of all existing caches.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Deletes the named cache. Returns `false` if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Looks up a stored response.
    async fn get(&self, name: &str, key: &CacheKey) -> Result<Option<Response>>;

    /// Stores a response, replacing any previous entry for `key`.
    /// Creates the named cache when missing.
    async fn put(&self, name: &str, key: &CacheKey, response: &Response) -> Result<()>;

    /// Number of entries in the named cache; 0 when it does not exist.
    async fn entry_count(&self, name: &str) -> Result<usize>;
}

/// Handle to one named cache inside a storage backend.
#[derive(Clone)]
pub struct Cache {
    storage: Arc<dyn CacheStorage>,
    name: String,
}

impl Cache {
    /// Opens (creating if needed) the named cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot create the cache.
    pub async fn open(storage: Arc<dyn CacheStorage>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        storage.open(&name).await?;
        Ok(Self { storage, name })
    }

    /// Binds a handle to `name` without creating the cache.
    ///
    /// Lookups miss until something is stored; the first store creates it.
    #[must_use]
    pub fn bind(storage: Arc<dyn CacheStorage>, name: impl Into<String>) -> Self {
        Self {
            storage,
            name: name.into(),
        }
    }

    /// Name of this cache.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up the response stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<Response>> {
        self.storage.get(&self.name, key).await
    }

    /// Looks up each key in order and returns the first hit.
    ///
    /// Backend errors on one key are logged and treated as a miss so the
    /// remaining keys are still consulted.
    pub async fn lookup_first(&self, keys: &[CacheKey]) -> Option<Response> {
        for key in keys {
            match self.lookup(key).await {
                Ok(Some(res)) => return Some(res),
                Ok(None) => {}
                Err(e) => log::warn!("cache {} read failed for {key}: {e}", self.name),
            }
        }
        None
    }

    /// Stores `response` under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub async fn store(&self, key: &CacheKey, response: &Response) -> Result<()> {
        self.storage.put(&self.name, key, response).await
    }

    /// Number of entries in this cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot count entries.
    pub async fn len(&self) -> Result<usize> {
        self.storage.entry_count(&self.name).await
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("name", &self.name).finish_non_exhaustive()
    }
}
