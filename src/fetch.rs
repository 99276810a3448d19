//! Request interception: stale-while-revalidate for the app document,
//! cache-first for everything else.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::cache::Cache;
use crate::error::Result;
use crate::http::{CacheKey, Request, RequestMode, Response, same_origin};
use crate::net::Fetcher;
use crate::stats::FetchStats;

/// Strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Not intercepted; the host handles it.
    Passthrough,
    /// Navigation or entry document: stale-while-revalidate.
    Document,
    /// Any other GET: cache-first.
    Asset,
}

/// Result of intercepting a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The host should perform the request itself.
    Passthrough,
    /// Answer the request with this response.
    Respond(Response),
}

/// Serves requests out of the active cache generation.
///
/// Network refreshes and cache writes run as detached tasks on the shared
/// tracker; the caller never waits for them.
#[derive(Clone)]
pub struct FetchInterceptor {
    cache: Cache,
    fetcher: Arc<dyn Fetcher>,
    scope: Url,
    entry_document: String,
    entry_key: CacheKey,
    root_key: CacheKey,
    tasks: TaskTracker,
    stats: Arc<FetchStats>,
}

impl FetchInterceptor {
    /// Creates an interceptor over `cache` for the app living at `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error if `entry_document` cannot be resolved against `scope`.
    pub fn new(
        cache: Cache,
        fetcher: Arc<dyn Fetcher>,
        scope: Url,
        entry_document: &str,
        tasks: TaskTracker,
    ) -> Result<Self> {
        let entry_url = scope.join(entry_document)?;
        let entry_name = entry_url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or(entry_document)
            .to_string();
        Ok(Self {
            cache,
            fetcher,
            entry_key: CacheKey::get(&entry_url),
            root_key: CacheKey::get(&scope),
            scope,
            entry_document: entry_name,
            tasks,
            stats: Arc::new(FetchStats::new()),
        })
    }

    /// Counters for this interceptor.
    #[must_use]
    pub const fn stats(&self) -> &Arc<FetchStats> {
        &self.stats
    }

    /// Picks the strategy for a request.
    #[must_use]
    pub fn classify(&self, request: &Request) -> RequestClass {
        if !request.is_get() {
            RequestClass::Passthrough
        } else if request.mode == RequestMode::Navigate
            || (!self.entry_document.is_empty() && request.url.path().ends_with(&self.entry_document))
        {
            RequestClass::Document
        } else {
            RequestClass::Asset
        }
    }

    /// Intercepts one request.
    pub async fn handle(&self, request: Request) -> FetchOutcome {
        match self.classify(&request) {
            RequestClass::Passthrough => {
                self.stats.record_passthrough();
                FetchOutcome::Passthrough
            }
            RequestClass::Document => FetchOutcome::Respond(self.stale_while_revalidate(request).await),
            RequestClass::Asset => FetchOutcome::Respond(self.cache_first(request).await),
        }
    }

    async fn stale_while_revalidate(&self, request: Request) -> Response {
        let keys = [request.key(), self.entry_key.clone(), self.root_key.clone()];
        let cached = self.cache.lookup_first(&keys).await;

        let (reply, network) = oneshot::channel();
        let refresh = Refresh {
            cache: self.cache.clone(),
            fetcher: Arc::clone(&self.fetcher),
            entry_key: self.entry_key.clone(),
            stats: Arc::clone(&self.stats),
        };
        self.tasks.spawn(refresh.run(request, reply));

        if let Some(response) = cached {
            self.stats.record_cache_hit();
            return response;
        }

        match network.await {
            Ok(Some(response)) => {
                self.stats.record_network();
                response
            }
            _ => {
                self.stats.record_network_error();
                Response::network_error()
            }
        }
    }

    async fn cache_first(&self, request: Request) -> Response {
        let key = request.key();
        if let Some(response) = self.cache.lookup_first(std::slice::from_ref(&key)).await {
            self.stats.record_cache_hit();
            return response;
        }

        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                self.stats.record_network();
                if self.is_storable(&request, &response) {
                    self.store_detached(key, response.clone());
                }
                response
            }
            Err(e) => {
                log::debug!("Network failed for {}: {e}", request.url);
                if let Some(entry) = self.cache.lookup_first(std::slice::from_ref(&self.entry_key)).await {
                    self.stats.record_fallback();
                    entry
                } else {
                    self.stats.record_network_error();
                    Response::network_error()
                }
            }
        }
    }

    /// Only same-origin responses with status exactly 200 are kept.
    fn is_storable(&self, request: &Request, response: &Response) -> bool {
        !response.is_error() && response.status == 200 && same_origin(&request.url, &self.scope)
    }

    fn store_detached(&self, key: CacheKey, response: Response) {
        let cache = self.cache.clone();
        let stats = Arc::clone(&self.stats);
        self.tasks.spawn(async move {
            match cache.store(&key, &response).await {
                Ok(()) => stats.record_stored(1),
                Err(e) => log::debug!("Caching {key} failed: {e}"),
            }
        });
    }
}

/// Background refresh of a document request.
struct Refresh {
    cache: Cache,
    fetcher: Arc<dyn Fetcher>,
    entry_key: CacheKey,
    stats: Arc<FetchStats>,
}

impl Refresh {
    /// Fetches `request`, stores an ok result under the request key and the
    /// entry key, then hands the result to whoever is still waiting.
    async fn run(self, request: Request, reply: oneshot::Sender<Option<Response>>) {
        let response = match self.fetcher.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                log::debug!("Refresh of {} failed: {e}", request.url);
                let _ = reply.send(None);
                return;
            }
        };

        if response.is_ok() {
            let request_key = request.key();
            let mut keys = vec![request_key];
            if keys[0] != self.entry_key {
                keys.push(self.entry_key.clone());
            }
            for key in &keys {
                match self.cache.store(key, &response).await {
                    Ok(()) => self.stats.record_stored(1),
                    Err(e) => log::debug!("Caching {key} failed: {e}"),
                }
            }
        }

        // The caller may have been answered from cache already.
        let _ = reply.send(Some(response));
    }
}
