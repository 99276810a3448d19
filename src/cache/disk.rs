//! On-disk cache storage.
//!
//! Layout: one directory per cache under the root, one JSON file per entry.
//! Entry files are named by the hex SHA-256 of the cache key, bodies are
//! base64-encoded. Writes go to a `.tmp` file first and are renamed into
//! place, so a crash never leaves a half-written entry behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::CacheStorage;
use crate::error::{Error, Result};
use crate::http::{CacheKey, Response, ResponseKind};

/// Serialized form of one cache entry.
#[derive(Debug, Serialize, Deserialize)]
struct EntryFile {
    key: CacheKey,
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl EntryFile {
    fn from_response(key: &CacheKey, response: &Response) -> Self {
        Self {
            key: key.clone(),
            status: response.status,
            headers: response.headers.clone(),
            body: BASE64.encode(&response.body),
        }
    }

    fn into_response(self) -> Result<Response> {
        let body = BASE64
            .decode(self.body.as_bytes())
            .map_err(|e| Error::Storage(format!("corrupt body for {}: {e}", self.key)))?;
        Ok(Response {
            status: self.status,
            headers: self.headers,
            body: body.into(),
            kind: ResponseKind::Basic,
        })
    }
}

/// Cache storage persisted under a root directory.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Creates a storage rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of this storage.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cache_dir(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
        {
            return Err(Error::Storage(format!("invalid cache name {name:?}")));
        }
        Ok(self.root.join(name))
    }

    fn entry_path(&self, name: &str, key: &CacheKey) -> Result<PathBuf> {
        let digest = Sha256::digest(key.as_str().as_bytes());
        let file_name: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Ok(self.cache_dir(name)?.join(format!("{file_name}.json")))
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, name: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.cache_dir(name)?).await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        match tokio::fs::remove_dir_all(self.cache_dir(name)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, name: &str, key: &CacheKey) -> Result<Option<Response>> {
        let path = self.entry_path(name, key)?;
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: EntryFile = serde_json::from_slice(&contents)?;
        if &entry.key != key {
            // Digest collision or a hand-edited file; never serve the wrong entry.
            return Ok(None);
        }
        entry.into_response().map(Some)
    }

    async fn put(&self, name: &str, key: &CacheKey, response: &Response) -> Result<()> {
        let path = self.entry_path(name, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec(&EntryFile::from_response(key, response))?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn entry_count(&self, name: &str) -> Result<usize> {
        let mut dir = match tokio::fs::read_dir(self.cache_dir(name)?).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut count = 0;
        while let Some(entry) = dir.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }
        Ok(count)
    }
}
