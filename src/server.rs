//! HTTP host for the worker.
//!
//! The server sits in front of the app's origin as a reverse proxy and plays
//! the host runtime: every request is delivered to the [`ServiceWorker`] as a
//! fetch event, pages connect over a websocket to exchange lifecycle
//! messages, and a second websocket exposes the background timer.
//!
//! | route | purpose |
//! |---|---|
//! | `GET /__appshell/clients` | client websocket (`SKIP_WAITING` in, `SW_ACTIVATED` out) |
//! | `GET /__appshell/timer` | timer websocket (commands in, events out) |
//! | `GET /__appshell/status` | lifecycle state, cache name and fetch counters |
//! | anything else | intercepted, or proxied to the origin |

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Request as HttpRequest, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::{ShellConfig, TimerConfig};
use crate::error::{Error, Result};
use crate::fetch::FetchOutcome;
use crate::host::{ClientHandle, WorkerHost};
use crate::http::{Request, RequestMode, Response};
use crate::lifecycle::LifecycleState;
use crate::messages::{ClientMessage, TimerCommand};
use crate::net::{Fetcher, HttpFetcher};
use crate::stats::FetchStatsSnapshot;
use crate::timer::spawn_timer;
use crate::worker::{EventOutcome, ServiceWorker, WorkerEvent};

/// Largest request body forwarded to the origin.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Headers that describe one connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "content-length",
    "host",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// A page connected over the client websocket.
pub struct WsClient {
    id: String,
    controlled: AtomicBool,
    outbox: mpsc::UnboundedSender<ClientMessage>,
}

impl ClientHandle for WsClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_controlled(&self) -> bool {
        self.controlled.load(Ordering::Relaxed)
    }

    fn post_message(&self, message: &ClientMessage) -> Result<()> {
        self.outbox
            .send(message.clone())
            .map_err(|_| Error::ClientGone(self.id.clone()))
    }
}

/// Connected pages, and the channel that asks the lifecycle driver to promote.
pub struct ClientHub {
    clients: Mutex<HashMap<String, Arc<WsClient>>>,
    promote: mpsc::UnboundedSender<()>,
}

impl ClientHub {
    /// Creates an empty hub. Promotion requests are sent on `promote`.
    #[must_use]
    pub fn new(promote: mpsc::UnboundedSender<()>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            promote,
        }
    }

    /// Registers a new, uncontrolled client and returns its outbox.
    pub fn register(&self) -> (Arc<WsClient>, mpsc::UnboundedReceiver<ClientMessage>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let client = Arc::new(WsClient {
            id: uuid::Uuid::new_v4().to_string(),
            controlled: AtomicBool::new(false),
            outbox,
        });
        self.lock().insert(client.id.clone(), Arc::clone(&client));
        (client, rx)
    }

    /// Forgets a client.
    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no client is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<WsClient>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl WorkerHost for ClientHub {
    async fn skip_waiting(&self) -> Result<()> {
        self.promote
            .send(())
            .map_err(|_| Error::Promotion("lifecycle driver has stopped".to_string()))
    }

    async fn claim(&self) -> Result<()> {
        for client in self.lock().values() {
            client.controlled.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn match_all(&self, include_uncontrolled: bool) -> Result<Vec<Arc<dyn ClientHandle>>> {
        Ok(self
            .lock()
            .values()
            .filter(|c| include_uncontrolled || c.is_controlled())
            .map(|c| Arc::clone(c) as Arc<dyn ClientHandle>)
            .collect())
    }
}

#[derive(Clone)]
struct AppState {
    worker: Arc<ServiceWorker>,
    hub: Arc<ClientHub>,
    fetcher: Arc<dyn Fetcher>,
    scope: Url,
    timer: TimerConfig,
    shutdown: CancellationToken,
}

#[derive(Serialize)]
struct StatusResponse {
    state: String,
    cache: String,
    clients: usize,
    stats: FetchStatsSnapshot,
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(StatusResponse {
        state: state.worker.state().to_string(),
        cache: state.worker.cache_name().to_string(),
        clients: state.hub.len(),
        stats: state.worker.stats(),
    })
}

async fn clients_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> HttpResponse {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(socket: WebSocket, state: AppState) {
    let (client, mut outbox) = state.hub.register();
    let (mut sink, mut stream) = socket.split();
    log::info!("Client {} connected", client.id());

    loop {
        tokio::select! {
            message = outbox.recv() => {
                let Some(message) = message else { break };
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Encoding client message failed: {e}"),
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => state.worker.post_message(text.as_str()).await,
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            () = state.shutdown.cancelled() => break,
        }
    }

    state.hub.remove(client.id());
    log::info!("Client {} disconnected", client.id());
}

async fn timer_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> HttpResponse {
    ws.on_upgrade(move |socket| timer_session(socket, state))
}

async fn timer_session(socket: WebSocket, state: AppState) {
    let (timer, mut events) = spawn_timer(state.timer, state.shutdown.child_token());
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Encoding timer event failed: {e}"),
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match TimerCommand::parse(text.as_str()) {
                    Some(command) => {
                        if timer.send(command).is_err() {
                            break;
                        }
                    }
                    None => log::debug!("Ignoring malformed timer command: {}", text.as_str()),
                },
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    timer.shutdown().await;
}

async fn proxy(State(state): State<AppState>, request: HttpRequest) -> HttpResponse {
    let request = match into_worker_request(&state.scope, request).await {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    // Until activation the previous version (or nothing) controls pages.
    let response = if state.worker.state() == LifecycleState::Activated {
        match state.worker.dispatch(WorkerEvent::Fetch(request.clone())).await {
            Ok(EventOutcome::Fetch(FetchOutcome::Respond(response))) => response,
            Ok(_) | Err(_) => forward(state.fetcher.as_ref(), &request).await,
        }
    } else {
        forward(state.fetcher.as_ref(), &request).await
    };
    into_http_response(response)
}

async fn forward(fetcher: &dyn Fetcher, request: &Request) -> Response {
    match fetcher.fetch(request).await {
        Ok(response) => response,
        Err(e) => {
            log::warn!("Origin request {} {} failed: {e}", request.method, request.url);
            Response::network_error()
        }
    }
}

/// Turns an incoming HTTP request into a worker request against the origin.
async fn into_worker_request(scope: &Url, request: HttpRequest) -> Result<Request> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let url = scope.join(path)?;

    let mode = match parts
        .headers
        .get("sec-fetch-mode")
        .and_then(|v| v.to_str().ok())
    {
        Some("navigate") => RequestMode::Navigate,
        Some("cors") => RequestMode::Cors,
        _ => RequestMode::SameOrigin,
    };
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::InvalidRequest(format!("request body: {e}")))?;

    let mut request = Request::get(url)
        .with_method(parts.method.as_str())
        .with_mode(mode)
        .with_body(body);
    for (name, value) in &parts.headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    Ok(request)
}

/// Turns a worker response into an HTTP response. The network-error result
/// becomes `502 Bad Gateway`.
fn into_http_response(response: Response) -> HttpResponse {
    if response.is_error() {
        return (StatusCode::BAD_GATEWAY, "origin unreachable and nothing cached").into_response();
    }

    let mut out = HttpResponse::new(Body::from(response.body));
    *out.status_mut() = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in &response.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            out.headers_mut().append(name, value);
        }
    }
    if !out.headers().contains_key(header::CACHE_CONTROL) {
        out.headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
    out
}

/// Installs the worker, then activates it once it is allowed to.
///
/// A first install activates straight away. When storage already holds a
/// generation under another name, an older version is live and activation
/// waits for a page to send `SKIP_WAITING`.
async fn drive_lifecycle(
    worker: Arc<ServiceWorker>,
    storage: Arc<dyn CacheStorage>,
    mut promote: mpsc::UnboundedReceiver<()>,
    shutdown: CancellationToken,
) {
    let previous: Vec<String> = match storage.keys().await {
        Ok(names) => names.into_iter().filter(|n| n != worker.cache_name()).collect(),
        Err(e) => {
            log::warn!("Listing caches failed: {e}");
            Vec::new()
        }
    };

    if let Err(e) = worker.dispatch(WorkerEvent::Install).await {
        log::error!("Install failed, serving straight from origin: {e}");
        return;
    }

    if !previous.is_empty() {
        log::info!(
            "Update {} installed alongside {}, waiting for SKIP_WAITING",
            worker.cache_name(),
            previous.join(", ")
        );
        tokio::select! {
            () = shutdown.cancelled() => return,
            request = promote.recv() => if request.is_none() { return },
        }
    }

    if let Err(e) = worker.dispatch(WorkerEvent::Activate).await {
        log::error!("Activation failed: {e}");
        return;
    }

    // Later promotion requests have nothing left to do.
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            request = promote.recv() => match request {
                Some(()) => log::debug!("{} already active", worker.cache_name()),
                None => break,
            },
        }
    }
}

/// Resolves on SIGINT or SIGTERM, or when `token` is cancelled.
async fn shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                log::info!("Received SIGTERM");
            }
            Err(e) => {
                log::warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
        () = terminate => {}
        () = token.cancelled() => {}
    }
    token.cancel();
}

struct Server {
    state: AppState,
    driver: tokio::task::JoinHandle<()>,
}

fn start(config: &ShellConfig, storage: Arc<dyn CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Result<Server> {
    let (promote_tx, promote_rx) = mpsc::unbounded_channel();
    let hub = Arc::new(ClientHub::new(promote_tx));
    let worker = Arc::new(ServiceWorker::new(
        config,
        Arc::clone(&storage),
        Arc::clone(&fetcher),
        Arc::clone(&hub) as Arc<dyn WorkerHost>,
    )?);
    let shutdown = CancellationToken::new();

    let driver = tokio::spawn(drive_lifecycle(
        Arc::clone(&worker),
        storage,
        promote_rx,
        shutdown.clone(),
    ));

    Ok(Server {
        state: AppState {
            worker,
            hub,
            fetcher,
            scope: config.scope_url()?,
            timer: config.timer,
            shutdown,
        },
        driver,
    })
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/__appshell/clients", get(clients_socket))
        .route("/__appshell/timer", get(timer_socket))
        .route("/__appshell/status", get(status))
        .fallback(proxy)
        .layer(cors)
        .with_state(state)
}

/// Runs the host server until SIGINT/SIGTERM.
///
/// # Errors
///
/// Returns an error if the config is invalid, the HTTP client cannot be
/// built, or the listener cannot bind.
pub async fn serve(config: ShellConfig, storage: Arc<dyn CacheStorage>) -> Result<()> {
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::with_defaults()?);
    let Server { state, driver } = start(&config, storage, fetcher)?;
    let shutdown = state.shutdown.clone();
    let worker = Arc::clone(&state.worker);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| Error::Config(format!("server address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!(
        "Serving {} on http://{addr} as {}",
        config.scope,
        worker.cache_name()
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = driver.await {
        log::warn!("Lifecycle driver ended abnormally: {e}");
    }
    worker.shutdown().await;
    log::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::cache::MemoryStorage;
    use crate::testing::{MockFetcher, SCOPE, url};

    fn config(version: u32) -> ShellConfig {
        ShellConfig::new()
            .with_scope(SCOPE)
            .with_cache_prefix("shell_")
            .with_cache_version(version)
    }

    fn online_fetcher() -> Arc<MockFetcher> {
        let fetcher = Arc::new(MockFetcher::new());
        for path in [
            "",
            "index.html",
            "manifest.json",
            "timer.worker.js",
            "sw.js",
            "pouchdb.min.js",
            "icons/icon-192.png",
            "icons/icon-512.png",
        ] {
            fetcher.respond(&url(path), Response::new(200, "shell").with_header("Content-Type", "text/html"));
        }
        fetcher
    }

    async fn wait_for_state(worker: &ServiceWorker, want: LifecycleState) {
        let mut rx = worker.coordinator().subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for lifecycle state")
            .unwrap();
    }

    fn get(path: &str) -> HttpRequest {
        axum::http::Request::builder()
            .uri(path)
            .header("sec-fetch-mode", "navigate")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn hub_claims_and_lists_clients() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let hub = ClientHub::new(tx);
        let (a, _outbox_a) = hub.register();
        let (_b, _outbox_b) = hub.register();
        assert_eq!(hub.len(), 2);
        assert!(hub.match_all(false).await.unwrap().is_empty());

        hub.claim().await.unwrap();
        assert!(a.is_controlled());
        assert_eq!(hub.match_all(false).await.unwrap().len(), 2);

        hub.remove(a.id());
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn closed_outbox_reports_client_gone() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let hub = ClientHub::new(tx);
        let (client, outbox) = hub.register();
        drop(outbox);
        let message = ClientMessage::Activated {
            cache: "shell_v1".to_string(),
        };
        assert!(matches!(client.post_message(&message), Err(Error::ClientGone(_))));
    }

    #[tokio::test]
    async fn skip_waiting_fails_without_driver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let hub = ClientHub::new(tx);
        assert!(matches!(hub.skip_waiting().await, Err(Error::Promotion(_))));
    }

    #[tokio::test]
    async fn first_install_activates_immediately() {
        let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
        let server = start(&config(1), storage, online_fetcher()).unwrap();
        wait_for_state(&server.state.worker, LifecycleState::Activated).await;
        server.state.shutdown.cancel();
        server.driver.await.unwrap();
    }

    #[tokio::test]
    async fn upgrade_waits_for_skip_waiting() {
        let storage = Arc::new(MemoryStorage::new());
        storage.open("shell_v1").await.unwrap();

        let server = start(&config(2), Arc::clone(&storage) as Arc<dyn CacheStorage>, online_fetcher()).unwrap();
        let (_client, mut outbox) = server.state.hub.register();
        wait_for_state(&server.state.worker, LifecycleState::Installed).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.state.worker.state(), LifecycleState::Installed);

        server.state.worker.post_message(r#"{"type":"SKIP_WAITING"}"#).await;
        wait_for_state(&server.state.worker, LifecycleState::Activated).await;

        assert_eq!(storage.keys().await.unwrap(), vec!["shell_v2".to_string()]);
        assert_eq!(
            outbox.recv().await,
            Some(ClientMessage::Activated {
                cache: "shell_v2".to_string()
            })
        );
        server.state.shutdown.cancel();
        server.driver.await.unwrap();
    }

    #[tokio::test]
    async fn proxy_serves_from_cache_once_active() {
        let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
        let fetcher = online_fetcher();
        let server = start(&config(1), storage, Arc::clone(&fetcher) as Arc<dyn Fetcher>).unwrap();
        wait_for_state(&server.state.worker, LifecycleState::Activated).await;

        fetcher.fail(&url("index.html"));
        let res = proxy(State(server.state.clone()), get("/index.html")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "text/html");

        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        assert_eq!(body, "shell");
        server.state.shutdown.cancel();
    }

    #[tokio::test]
    async fn proxy_maps_network_error_to_bad_gateway() {
        let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
        let server = start(&config(1), storage, Arc::new(MockFetcher::new())).unwrap();
        wait_for_state(&server.state.worker, LifecycleState::Redundant).await;

        let res = proxy(State(server.state.clone()), get("/anything")).await;
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
        server.state.shutdown.cancel();
    }

    #[tokio::test]
    async fn incoming_request_conversion() {
        let scope = Url::parse("https://app.example/base/").unwrap();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/base/api/save?x=1")
            .header("host", "proxy.local")
            .header("connection", "keep-alive")
            .header("x-custom", "yes")
            .body(Body::from("payload"))
            .unwrap();

        let converted = into_worker_request(&scope, request).await.unwrap();
        assert_eq!(converted.method, "POST");
        assert_eq!(converted.url.as_str(), "https://app.example/base/api/save?x=1");
        assert_eq!(converted.mode, RequestMode::SameOrigin);
        assert_eq!(converted.body, "payload");
        assert_eq!(converted.headers, vec![("x-custom".to_string(), "yes".to_string())]);
    }

    #[test]
    fn outgoing_response_drops_hop_headers() {
        let res = into_http_response(
            Response::new(404, "nope")
                .with_header("Transfer-Encoding", "chunked")
                .with_header("ETag", "\"abc\""),
        );
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(res.headers().get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(res.headers()[header::ETAG], "\"abc\"");
        assert_eq!(res.headers()[header::CACHE_CONTROL], "no-cache");
    }
}
