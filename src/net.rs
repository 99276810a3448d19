//! Network access abstraction for testability.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::http::{Request, Response};

/// Performs network fetches on behalf of the worker.
///
/// Transport failures are `Err`; any HTTP status, including error statuses,
/// is an `Ok` response.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches `request` from the network.
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Default fetcher backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Creates a fetcher around an existing client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Creates a fetcher with the default client settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn with_defaults() -> Result<Self> {
        Ok(Self::new(build_http_client()?))
    }
}

/// Builds a configured HTTP client for origin requests.
fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::InvalidRequest(format!("bad method {}", request.method)))?;
        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        if request.reload {
            builder = builder
                .header(reqwest::header::CACHE_CONTROL, "no-cache")
                .header(reqwest::header::PRAGMA, "no-cache");
        }

        let res = builder.send().await?;
        let status = res.status().as_u16();
        let headers = res
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = res.bytes().await?;

        log::debug!("fetched {} {} -> {status}", request.method, request.url);
        Ok(Response {
            status,
            headers,
            body,
            kind: crate::http::ResponseKind::Basic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_fetcher_builds() {
        assert!(HttpFetcher::with_defaults().is_ok());
    }

    #[test]
    fn http_fetcher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HttpFetcher>();
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let fetcher = HttpFetcher::with_defaults().unwrap();
        // Port 9 (discard) on localhost is not expected to accept HTTP.
        let req = Request::get(url::Url::parse("http://127.0.0.1:9/").unwrap());
        assert!(fetcher.fetch(&req).await.is_err());
    }
}
