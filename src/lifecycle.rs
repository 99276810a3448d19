//! Install/activate lifecycle and the user-approved promotion handshake.
//!
//! ```text
//! Parsed --install ok--> Installed (waiting) --activate--> Activating --> Activated
//!    \--install err--> Redundant
//! ```
//!
//! A freshly installed version never promotes itself. It waits until the
//! page relays the user's approval as `SKIP_WAITING`, the host promotes it,
//! and activation garbage-collects older generations, claims open clients
//! and broadcasts `SW_ACTIVATED` to every one of them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

use crate::cache::{Cache, CacheStorage};
use crate::error::{Error, Result};
use crate::host::WorkerHost;
use crate::messages::{ClientMessage, WorkerMessage};
use crate::precache::{AssetList, PrecacheReport, Precacher};

/// Lifecycle state of one worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created, not installed yet.
    Parsed,
    /// Precaching in progress.
    Installing,
    /// Installed and waiting for promotion.
    Installed,
    /// Activation in progress.
    Activating,
    /// Active and controlling clients.
    Activated,
    /// Install failed; this version will never activate.
    Redundant,
}

impl LifecycleState {
    /// Lower-case state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an activation.
#[derive(Debug, Clone)]
pub struct ActivationReport {
    /// Name of the now-active cache.
    pub cache: String,
    /// Stale generations deleted.
    pub deleted: Vec<String>,
    /// Stale generations that could not be deleted.
    pub failed_deletions: Vec<String>,
    /// Clients that received the activation broadcast.
    pub notified: usize,
    /// Clients the broadcast could not reach.
    pub unreachable: usize,
    /// When activation finished.
    pub activated_at: DateTime<Utc>,
}

/// Drives install, activation and promotion for one worker version.
pub struct UpdateCoordinator {
    cache_name: String,
    assets: AssetList,
    storage: Arc<dyn CacheStorage>,
    precacher: Precacher,
    host: Arc<dyn WorkerHost>,
    tasks: TaskTracker,
    state: watch::Sender<LifecycleState>,
}

impl UpdateCoordinator {
    /// Creates a coordinator for the version owning `cache_name`.
    #[must_use]
    pub fn new(
        cache_name: impl Into<String>,
        assets: AssetList,
        storage: Arc<dyn CacheStorage>,
        precacher: Precacher,
        host: Arc<dyn WorkerHost>,
        tasks: TaskTracker,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Parsed);
        Self {
            cache_name: cache_name.into(),
            assets,
            storage,
            precacher,
            host,
            tasks,
            state,
        }
    }

    /// Name of the cache this version owns.
    #[must_use]
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Subscribes to lifecycle state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn transition(&self, expected: LifecycleState, next: LifecycleState) -> Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if *state == expected {
                *state = next;
                true
            } else {
                result = Err(Error::InvalidState {
                    from: state.as_str(),
                    to: next.as_str(),
                });
                false
            }
        });
        result
    }

    /// Runs the install phase: open this version's cache and precache into it.
    ///
    /// On success the version is left waiting; it is not promoted.
    ///
    /// # Errors
    ///
    /// Returns the precache failure (the version becomes redundant and a
    /// cache created by this install is discarded), or
    /// [`Error::InvalidState`] if install already ran.
    pub async fn install(&self) -> Result<PrecacheReport> {
        self.transition(LifecycleState::Parsed, LifecycleState::Installing)?;
        log::info!("Installing {}", self.cache_name);

        let mut created = false;
        let outcome = async {
            created = !self.storage.keys().await?.contains(&self.cache_name);
            let cache = Cache::open(Arc::clone(&self.storage), self.cache_name.clone()).await?;
            self.precacher.run(&cache, &self.assets).await
        }
        .await;

        match outcome {
            Ok(report) => {
                self.state.send_replace(LifecycleState::Installed);
                log::info!("{} installed, waiting for approval", self.cache_name);
                Ok(report)
            }
            Err(e) => {
                if created {
                    if let Err(delete_err) = self.storage.delete(&self.cache_name).await {
                        log::warn!("Discarding partial cache {} failed: {delete_err}", self.cache_name);
                    }
                }
                self.state.send_replace(LifecycleState::Redundant);
                log::error!("Install of {} failed: {e}", self.cache_name);
                Err(e)
            }
        }
    }

    /// Runs the activation phase.
    ///
    /// Deletes every cache not named for this version, claims open clients
    /// and broadcasts `SW_ACTIVATED` to all of them. Deletion, claim and
    /// per-client delivery failures are logged and never abort activation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the version is installed and waiting.
    pub async fn activate(&self) -> Result<ActivationReport> {
        self.transition(LifecycleState::Installed, LifecycleState::Activating)?;
        log::info!("Activating {}", self.cache_name);

        let (deleted, failed_deletions) = self.collect_garbage().await;

        if let Err(e) = self.host.claim().await {
            log::warn!("Claiming clients failed: {e}");
        }

        let (notified, unreachable) = self.broadcast_activated().await;

        self.state.send_replace(LifecycleState::Activated);
        log::info!(
            "{} active: {} stale caches removed, {notified} clients notified",
            self.cache_name,
            deleted.len()
        );
        Ok(ActivationReport {
            cache: self.cache_name.clone(),
            deleted,
            failed_deletions,
            notified,
            unreachable,
            activated_at: Utc::now(),
        })
    }

    async fn collect_garbage(&self) -> (Vec<String>, Vec<String>) {
        let mut deleted = Vec::new();
        let mut failed = Vec::new();

        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                log::warn!("Listing caches failed: {e}");
                return (deleted, failed);
            }
        };

        for name in names.into_iter().filter(|n| *n != self.cache_name) {
            match self.storage.delete(&name).await {
                Ok(_) => {
                    log::debug!("Deleted stale cache {name}");
                    deleted.push(name);
                }
                Err(e) => {
                    log::warn!("Deleting stale cache {name} failed: {e}");
                    failed.push(name);
                }
            }
        }
        (deleted, failed)
    }

    async fn broadcast_activated(&self) -> (usize, usize) {
        let clients = match self.host.match_all(true).await {
            Ok(clients) => clients,
            Err(e) => {
                log::warn!("Listing clients failed: {e}");
                return (0, 0);
            }
        };

        let message = ClientMessage::Activated {
            cache: self.cache_name.clone(),
        };
        let mut notified = 0;
        let mut unreachable = 0;
        for client in clients {
            match client.post_message(&message) {
                Ok(()) => notified += 1,
                Err(e) => {
                    log::debug!("Activation notice to {} failed: {e}", client.id());
                    unreachable += 1;
                }
            }
        }
        (notified, unreachable)
    }

    /// Handles a message from a page.
    pub async fn handle_message(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::SkipWaiting => self.promote().await,
        }
    }

    /// Asks the host to promote this version, then to claim clients.
    ///
    /// If the first attempt fails, one more attempt runs detached on the
    /// task tracker and its failure is dropped.
    async fn promote(&self) {
        log::info!("Update approved, promoting {}", self.cache_name);
        let Err(e) = promote_once(self.host.as_ref()).await else {
            return;
        };

        log::debug!("Promotion failed ({e}), retrying in background");
        let host = Arc::clone(&self.host);
        self.tasks.spawn(async move {
            if let Err(e) = promote_once(host.as_ref()).await {
                log::debug!("Background promotion failed: {e}");
            }
        });
    }
}

async fn promote_once(host: &dyn WorkerHost) -> Result<()> {
    host.skip_waiting().await?;
    host.claim().await
}
