//! In-memory cache storage.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CacheStorage;
use crate::error::Result;
use crate::http::{CacheKey, Response};

/// Cache storage kept entirely in memory. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    caches: RwLock<BTreeMap<String, HashMap<CacheKey, Response>>>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<()> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.caches.read().await.keys().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn get(&self, name: &str, key: &CacheKey) -> Result<Option<Response>> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&self, name: &str, key: &CacheKey, response: &Response) -> Result<()> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .insert(key.clone(), response.clone());
        Ok(())
    }

    async fn entry_count(&self, name: &str) -> Result<usize> {
        Ok(self.caches.read().await.get(name).map_or(0, HashMap::len))
    }
}
