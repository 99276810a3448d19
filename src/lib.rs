//! appshell - offline app-shell caching with user-approved updates, and a
//! drift-corrected background timer.
//!
//! The cache side behaves like a service worker for one single-page app:
//! each deploy precaches its shell into a versioned cache, waits until the
//! user approves the update, then deletes older generations and tells every
//! open page it is live. Requests are served stale-while-revalidate for the
//! app document and cache-first for everything else.
//!
//! The timer side runs countdown/stopwatch sessions off the UI thread and
//! reports elapsed time measured from the session origin.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use appshell::{HttpFetcher, MemoryStorage, ServiceWorker, ShellConfig, WorkerEvent};
//! # use appshell::host::{ClientHandle, WorkerHost};
//! # struct NoClients;
//! # #[async_trait::async_trait]
//! # impl WorkerHost for NoClients {
//! #     async fn skip_waiting(&self) -> appshell::Result<()> { Ok(()) }
//! #     async fn claim(&self) -> appshell::Result<()> { Ok(()) }
//! #     async fn match_all(&self, _: bool) -> appshell::Result<Vec<Arc<dyn ClientHandle>>> { Ok(Vec::new()) }
//! # }
//!
//! # async fn example() -> appshell::Result<()> {
//! let config = ShellConfig::new().with_scope("https://app.example/");
//! let worker = ServiceWorker::new(
//!     &config,
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(HttpFetcher::with_defaults()?),
//!     Arc::new(NoClients),
//! )?;
//!
//! worker.dispatch(WorkerEvent::Install).await?;
//! worker.dispatch(WorkerEvent::Activate).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod host;
pub mod http;
pub mod lifecycle;
pub mod messages;
pub mod net;
pub mod precache;
#[cfg(feature = "server")]
pub mod server;
pub mod stats;
pub mod timer;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use cache::{Cache, CacheStorage, DiskStorage, MemoryStorage, cache_name};
pub use config::{AssetConfig, ServerConfig, ShellConfig, TimerConfig};
pub use error::{Error, Result};
pub use fetch::{FetchInterceptor, FetchOutcome, RequestClass};
pub use http::{CacheKey, Request, RequestMode, Response};
pub use lifecycle::{ActivationReport, LifecycleState, UpdateCoordinator};
pub use messages::{ClientMessage, TimerCommand, TimerEvent, TimerMode, WorkerMessage};
pub use net::{Fetcher, HttpFetcher};
pub use precache::{AssetList, PrecacheReport, Precacher};
pub use stats::{FetchStats, FetchStatsSnapshot};
pub use timer::{TimerHandle, TimerScheduler, TimerSession, spawn_timer};
pub use worker::{EventOutcome, ServiceWorker, WorkerEvent};
