//! The worker as a whole: one version of the app shell, driven by host events.

use std::sync::Arc;

use tokio_util::task::TaskTracker;

use crate::cache::{Cache, CacheStorage};
use crate::config::ShellConfig;
use crate::error::Result;
use crate::fetch::{FetchInterceptor, FetchOutcome};
use crate::host::WorkerHost;
use crate::http::Request;
use crate::lifecycle::{ActivationReport, LifecycleState, UpdateCoordinator};
use crate::messages::WorkerMessage;
use crate::net::Fetcher;
use crate::precache::{AssetList, PrecacheReport, Precacher};
use crate::stats::FetchStatsSnapshot;

/// Events the host delivers to the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A new version was registered.
    Install,
    /// The host promoted this version.
    Activate,
    /// A request from a client.
    Fetch(Request),
    /// A message posted by a client.
    Message(WorkerMessage),
}

/// What handling an event produced.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    /// Install finished.
    Installed(PrecacheReport),
    /// Activation finished.
    Activated(ActivationReport),
    /// Result of intercepting a request.
    Fetch(FetchOutcome),
    /// The event needed no reply.
    Handled,
}

/// One deployed version of the worker.
pub struct ServiceWorker {
    coordinator: UpdateCoordinator,
    interceptor: FetchInterceptor,
    tasks: TaskTracker,
}

impl ServiceWorker {
    /// Builds the worker for the version described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or an asset path cannot be resolved.
    pub fn new(
        config: &ShellConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        host: Arc<dyn WorkerHost>,
    ) -> Result<Self> {
        config.validate()?;
        let scope = config.scope_url()?;
        let cache_name = config.cache_name();
        let tasks = TaskTracker::new();

        let coordinator = UpdateCoordinator::new(
            cache_name.clone(),
            AssetList::resolve(&scope, &config.assets)?,
            Arc::clone(&storage),
            Precacher::new(Arc::clone(&fetcher)),
            host,
            tasks.clone(),
        );
        let interceptor = FetchInterceptor::new(
            Cache::bind(storage, cache_name),
            fetcher,
            scope,
            &config.entry_document,
            tasks.clone(),
        )?;

        Ok(Self {
            coordinator,
            interceptor,
            tasks,
        })
    }

    /// Handles one host event.
    ///
    /// # Errors
    ///
    /// Install and activation failures are returned to the host; fetch and
    /// message events never fail.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome> {
        match event {
            WorkerEvent::Install => self.coordinator.install().await.map(EventOutcome::Installed),
            WorkerEvent::Activate => self.coordinator.activate().await.map(EventOutcome::Activated),
            WorkerEvent::Fetch(request) => Ok(EventOutcome::Fetch(self.interceptor.handle(request).await)),
            WorkerEvent::Message(message) => {
                self.coordinator.handle_message(message).await;
                Ok(EventOutcome::Handled)
            }
        }
    }

    /// Parses and handles a raw client message. Unrecognised messages are ignored.
    pub async fn post_message(&self, text: &str) {
        match WorkerMessage::parse(text) {
            Some(message) => self.coordinator.handle_message(message).await,
            None => log::debug!("Ignoring unrecognised client message: {text}"),
        }
    }

    /// The lifecycle coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &UpdateCoordinator {
        &self.coordinator
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.coordinator.state()
    }

    /// Name of the cache this version owns.
    #[must_use]
    pub fn cache_name(&self) -> &str {
        self.coordinator.cache_name()
    }

    /// Fetch counters.
    #[must_use]
    pub fn stats(&self) -> FetchStatsSnapshot {
        self.interceptor.stats().snapshot()
    }

    /// Waits until every detached refresh, cache write and promotion retry
    /// spawned so far has finished.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Stops accepting background work and waits for what is in flight.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        log::debug!("Worker {} idle, shut down", self.cache_name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::cache::MemoryStorage;
    use crate::error::Error;
    use crate::http::Response;
    use crate::messages::ClientMessage;
    use crate::testing::{MockClient, MockFetcher, MockHost, SCOPE, url};

    fn config(version: u32) -> ShellConfig {
        ShellConfig::new()
            .with_scope(SCOPE)
            .with_cache_prefix("shell_")
            .with_cache_version(version)
    }

    fn online_fetcher(shell: &'static str) -> Arc<MockFetcher> {
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
            fetcher.respond(&url(path), Response::new(200, shell));
        }
        fetcher
    }

    #[test]
    fn invalid_config_rejected() {
        let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
        let result = ServiceWorker::new(
            &config(1).with_scope("not a url"),
            storage,
            Arc::new(MockFetcher::new()),
            Arc::new(MockHost::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn construction_does_not_create_cache() {
        let storage = Arc::new(MemoryStorage::new());
        let _worker = ServiceWorker::new(
            &config(1),
            Arc::clone(&storage) as Arc<dyn CacheStorage>,
            Arc::new(MockFetcher::new()),
            Arc::new(MockHost::new()),
        )
        .unwrap();
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_upgrade_cycle() {
        let storage = Arc::new(MemoryStorage::new());
        let client = MockClient::new("tab-1", false);
        let host = Arc::new(MockHost::with_clients(vec![Arc::clone(&client)]));

        let v1 = ServiceWorker::new(
            &config(1),
            Arc::clone(&storage) as Arc<dyn CacheStorage>,
            online_fetcher("v1 shell"),
            Arc::clone(&host) as Arc<dyn WorkerHost>,
        )
        .unwrap();
        assert!(matches!(v1.dispatch(WorkerEvent::Install).await, Ok(EventOutcome::Installed(_))));
        assert!(matches!(v1.dispatch(WorkerEvent::Activate).await, Ok(EventOutcome::Activated(_))));

        let v2 = ServiceWorker::new(
            &config(2),
            Arc::clone(&storage) as Arc<dyn CacheStorage>,
            online_fetcher("v2 shell"),
            Arc::clone(&host) as Arc<dyn WorkerHost>,
        )
        .unwrap();
        v2.dispatch(WorkerEvent::Install).await.unwrap();
        assert_eq!(v2.state(), LifecycleState::Installed);
        assert_eq!(storage.keys().await.unwrap().len(), 2);

        v2.post_message(r#"{"type":"SKIP_WAITING"}"#).await;
        assert_eq!(host.skip_waiting_calls.load(Ordering::SeqCst), 1);

        let EventOutcome::Activated(report) = v2.dispatch(WorkerEvent::Activate).await.unwrap() else {
            panic!("expected activation report");
        };
        assert_eq!(report.deleted, vec!["shell_v1".to_string()]);
        assert_eq!(storage.keys().await.unwrap(), vec!["shell_v2".to_string()]);
        assert_eq!(
            client.received().last(),
            Some(&ClientMessage::Activated {
                cache: "shell_v2".to_string()
            })
        );
    }

    #[tokio::test]
    async fn offline_after_install_serves_shell() {
        let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
        let fetcher = online_fetcher("shell");
        let worker = ServiceWorker::new(&config(1), storage, Arc::clone(&fetcher) as Arc<dyn Fetcher>, Arc::new(MockHost::new())).unwrap();
        worker.dispatch(WorkerEvent::Install).await.unwrap();
        worker.dispatch(WorkerEvent::Activate).await.unwrap();

        for path in ["", "index.html", "sw.js"] {
            fetcher.fail(&url(path));
        }

        let outcome = worker
            .dispatch(WorkerEvent::Fetch(Request::navigate(url(""))))
            .await
            .unwrap();
        let EventOutcome::Fetch(FetchOutcome::Respond(res)) = outcome else {
            panic!("expected a response");
        };
        assert_eq!(res.body, "shell");

        let outcome = worker.dispatch(WorkerEvent::Fetch(Request::get(url("sw.js")))).await.unwrap();
        assert!(matches!(outcome, EventOutcome::Fetch(FetchOutcome::Respond(r)) if r.body == "shell"));

        worker.wait_idle().await;
        assert_eq!(worker.stats().cache_hits, 2);
    }

    #[tokio::test]
    async fn unknown_message_is_ignored() {
        let host = Arc::new(MockHost::new());
        let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
        let worker = ServiceWorker::new(&config(1), storage, Arc::new(MockFetcher::new()), Arc::clone(&host) as Arc<dyn WorkerHost>).unwrap();

        worker.post_message(r#"{"type":"PING"}"#).await;
        worker.post_message("garbage").await;
        assert_eq!(host.skip_waiting_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn install_failure_surfaces_to_host() {
        let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
        let worker = ServiceWorker::new(&config(1), storage, Arc::new(MockFetcher::new()), Arc::new(MockHost::new())).unwrap();

        let result = worker.dispatch(WorkerEvent::Install).await;
        assert!(matches!(result, Err(Error::RequiredAsset { .. })));
        assert_eq!(worker.state(), LifecycleState::Redundant);
        worker.shutdown().await;
    }
}
