//! Install-time population of a cache generation.

use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use url::Url;

use crate::cache::Cache;
use crate::config::AssetConfig;
use crate::error::{Error, Result};
use crate::http::{CacheKey, Request, Response};
use crate::net::Fetcher;

/// Absolute URLs of the assets to precache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetList {
    /// Must all be stored or the install fails.
    pub required: Vec<Url>,
    /// Stored on a best-effort basis.
    pub optional: Vec<Url>,
}

impl AssetList {
    /// Resolves relative asset paths against the scope.
    ///
    /// # Errors
    ///
    /// Returns an error if an asset path cannot be joined onto the scope.
    pub fn resolve(scope: &Url, assets: &AssetConfig) -> Result<Self> {
        let join = |paths: &[String]| -> Result<Vec<Url>> {
            paths.iter().map(|p| Ok(scope.join(p)?)).collect()
        };
        Ok(Self {
            required: join(&assets.required)?,
            optional: join(&assets.optional)?,
        })
    }
}

/// What a precache run stored.
#[derive(Debug, Clone, Default)]
pub struct PrecacheReport {
    /// Required assets stored.
    pub required: Vec<Url>,
    /// Optional assets stored.
    pub optional_stored: Vec<Url>,
    /// Optional assets skipped, with the reason.
    pub optional_failed: Vec<(Url, String)>,
    /// Total body bytes written.
    pub bytes: u64,
}

/// Fetches the asset lists into a cache.
#[derive(Clone)]
pub struct Precacher {
    fetcher: Arc<dyn Fetcher>,
}

impl Precacher {
    /// Creates a precacher using `fetcher` for all requests.
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }

    /// Stores every required asset, then every optional one.
    ///
    /// Required fetches are all-or-nothing: every asset is fetched first and
    /// nothing is written unless all of them came back ok. A storage error
    /// while writing them can leave earlier entries behind; the caller
    /// discards the generation in that case. Optional assets
    /// are fetched independently and their failures are only logged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequiredAsset`] for the first required asset that
    /// failed, or a storage error if writing a required asset fails.
    pub async fn run(&self, cache: &Cache, assets: &AssetList) -> Result<PrecacheReport> {
        let mut report = PrecacheReport::default();

        let fetched = try_join_all(assets.required.iter().map(|url| self.fetch_required(url))).await?;
        for (url, response) in fetched {
            cache.store(&CacheKey::get(&url), &response).await?;
            report.bytes += response.body.len() as u64;
            report.required.push(url);
        }

        let outcomes = join_all(assets.optional.iter().map(|url| self.store_optional(cache, url))).await;
        for (url, outcome) in assets.optional.iter().zip(outcomes) {
            match outcome {
                Ok(bytes) => {
                    report.bytes += bytes;
                    report.optional_stored.push(url.clone());
                }
                Err(e) => {
                    log::warn!("Optional asset {url} not cached: {e}");
                    report.optional_failed.push((url.clone(), e.to_string()));
                }
            }
        }

        log::info!(
            "Precached {} required and {} optional assets into {} ({} bytes)",
            report.required.len(),
            report.optional_stored.len(),
            cache.name(),
            report.bytes
        );
        Ok(report)
    }

    async fn fetch_required(&self, url: &Url) -> Result<(Url, Response)> {
        let wrap = |source: Error| Error::RequiredAsset {
            url: url.to_string(),
            source: Box::new(source),
        };
        let response = self
            .fetcher
            .fetch(&Request::get(url.clone()))
            .await
            .map_err(wrap)?;
        if !response.is_ok() {
            return Err(wrap(Error::Status {
                url: url.to_string(),
                status: response.status,
            }));
        }
        Ok((url.clone(), response))
    }

    async fn store_optional(&self, cache: &Cache, url: &Url) -> Result<u64> {
        let response = self.fetcher.fetch(&Request::get(url.clone()).with_reload()).await?;
        if !response.is_ok() {
            return Err(Error::Status {
                url: url.to_string(),
                status: response.status,
            });
        }
        cache.store(&CacheKey::get(url), &response).await?;
        Ok(response.body.len() as u64)
    }
}
