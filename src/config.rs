//! Configuration types for the cache layer, the timer and the host server.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Application name used for config/cache directory paths.
const APP_NAME: &str = "appshell";

/// Config file name.
const CONFIG_FILE: &str = "config.toml";

/// Assets fetched at install time, as paths relative to the scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// Assets that must all be stored for an install to succeed.
    pub required: Vec<String>,
    /// Assets stored on a best-effort basis.
    pub optional: Vec<String>,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            required: vec![
                "./".to_string(),
                "./index.html".to_string(),
                "./manifest.json".to_string(),
                "./timer.worker.js".to_string(),
                "./sw.js".to_string(),
            ],
            optional: vec![
                "./pouchdb.min.js".to_string(),
                "./icons/icon-192.png".to_string(),
                "./icons/icon-512.png".to_string(),
            ],
        }
    }
}

/// Cadence settings for the background timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Tick cadence the scheduler aligns to, in milliseconds.
    pub tick_ms: u64,
    /// Minimum spacing between two progress messages, in milliseconds.
    pub emit_interval_ms: u64,
    /// Lower bound for the delay before the next tick, in milliseconds.
    pub min_delay_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 200,
            emit_interval_ms: 400,
            min_delay_ms: 50,
        }
    }
}

/// Host server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9724,
        }
    }
}

/// Complete configuration for one deploy of the app shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Fixed prefix of every cache name.
    pub cache_prefix: String,
    /// Deploy version; bump it to roll out a new cache generation.
    pub cache_version: u32,
    /// Origin and base path of the application.
    pub scope: String,
    /// File name of the entry document, relative to the scope.
    pub entry_document: String,
    /// Directory for on-disk caches. `None` keeps caches in memory.
    pub storage_dir: Option<PathBuf>,
    /// Precache asset lists.
    pub assets: AssetConfig,
    /// Timer cadence.
    pub timer: TimerConfig,
    /// Host server settings.
    pub server: ServerConfig,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "appshell_cache_".to_string(),
            cache_version: 3,
            scope: "http://127.0.0.1:8080/".to_string(),
            entry_document: "index.html".to_string(),
            storage_dir: None,
            assets: AssetConfig::default(),
            timer: TimerConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl ShellConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deploy version.
    #[must_use]
    pub const fn with_cache_version(mut self, version: u32) -> Self {
        self.cache_version = version;
        self
    }

    /// Sets the cache name prefix.
    #[must_use]
    pub fn with_cache_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_prefix = prefix.into();
        self
    }

    /// Sets the application scope URL.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Sets the on-disk storage directory.
    #[must_use]
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Sets the precache asset lists.
    #[must_use]
    pub fn with_assets(mut self, assets: AssetConfig) -> Self {
        self.assets = assets;
        self
    }

    /// Name of the cache generation owned by this deploy.
    #[must_use]
    pub fn cache_name(&self) -> String {
        crate::cache::cache_name(&self.cache_prefix, self.cache_version)
    }

    /// Parses the scope into a URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the scope is not an absolute URL.
    pub fn scope_url(&self) -> Result<Url> {
        let url = Url::parse(&self.scope)?;
        if url.cannot_be_a_base() {
            return Err(Error::Config(format!("scope {} cannot be a base URL", self.scope)));
        }
        Ok(url)
    }

    /// Resolves the canonical entry-document URL against the scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the scope or the entry document is not a valid URL.
    pub fn entry_url(&self) -> Result<Url> {
        Ok(self.scope_url()?.join(&self.entry_document)?)
    }

    /// Checks the values that would otherwise fail late.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.scope_url()?;
        if self.entry_document.is_empty() {
            return Err(Error::Config("entry_document must not be empty".to_string()));
        }
        if self.timer.tick_ms == 0 {
            return Err(Error::Config("timer.tick_ms must be > 0".to_string()));
        }
        if self.timer.min_delay_ms > self.timer.tick_ms {
            return Err(Error::Config(
                "timer.min_delay_ms must not exceed timer.tick_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file, falling back to defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            log::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Saves the configuration atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml_str)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Default location of the config file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME)
            .join(CONFIG_FILE)
    }

    /// Default location for on-disk caches.
    #[must_use]
    pub fn default_storage_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME)
    }
}
