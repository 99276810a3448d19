//! Request and response snapshots passed between the host, the cache and the network.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

/// How the host issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Full-page navigation of an application window.
    Navigate,
    /// Same-origin subresource request.
    #[default]
    SameOrigin,
    /// Cross-origin subresource request.
    Cors,
}

/// An outgoing or intercepted HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// HTTP method, upper case.
    pub method: String,
    /// Absolute request URL.
    pub url: Url,
    /// Request mode as reported by the host.
    pub mode: RequestMode,
    /// Bypass intermediate HTTP caches when fetching.
    pub reload: bool,
    /// Request headers forwarded to the network.
    pub headers: Vec<(String, String)>,
    /// Request body; empty for GET.
    pub body: Bytes,
}

impl Request {
    /// Creates a plain GET request.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: "GET".to_string(),
            url,
            mode: RequestMode::default(),
            reload: false,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a navigation GET request.
    #[must_use]
    pub fn navigate(url: Url) -> Self {
        Self::get(url).with_mode(RequestMode::Navigate)
    }

    /// Sets the request mode.
    #[must_use]
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into().to_ascii_uppercase();
        self
    }

    /// Requests a reload that bypasses HTTP caches.
    #[must_use]
    pub const fn with_reload(mut self) -> Self {
        self.reload = true;
        self
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Whether this is a GET request.
    #[must_use]
    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    /// Cache identity of this request.
    #[must_use]
    pub fn key(&self) -> CacheKey {
        CacheKey::new(&self.method, &self.url)
    }
}

/// Identity of a stored response: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds a key from a method and URL.
    #[must_use]
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("{} {url}", method.to_ascii_uppercase()))
    }

    /// Key for a GET of `url`.
    #[must_use]
    pub fn get(url: &Url) -> Self {
        Self::new("GET", url)
    }

    /// The key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a response carries content or stands for a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseKind {
    /// Ordinary response.
    #[default]
    Basic,
    /// Network error result; status 0 and no body.
    Error,
}

/// A response snapshot: status, headers and the full body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// HTTP status code, 0 for network errors.
    pub status: u16,
    /// Response headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
    /// Response kind.
    #[serde(default)]
    pub kind: ResponseKind,
}

impl Response {
    /// Creates a basic response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            kind: ResponseKind::Basic,
        }
    }

    /// The generic network-error result handed back when nothing can be served.
    #[must_use]
    pub fn network_error() -> Self {
        Self {
            status: 0,
            headers: Vec::new(),
            body: Bytes::new(),
            kind: ResponseKind::Error,
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Status in the 200-299 range on a basic response.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.kind == ResponseKind::Basic && (200..300).contains(&self.status)
    }

    /// Whether this is the network-error result.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind == ResponseKind::Error
    }

    /// First header value with the given name, case-insensitive.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Whether two URLs share scheme, host and port.
#[must_use]
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}
