//! Host runtime seams: open application instances and version promotion.
//!
//! The worker never owns its clients. It asks the host for them when it
//! needs to broadcast, and asks the host to promote it when the user
//! approves an update.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::ClientMessage;

/// A live reference to one open application window or tab.
pub trait ClientHandle: Send + Sync {
    /// Stable identifier of the client.
    fn id(&self) -> &str;

    /// Whether the current worker version controls this client.
    fn is_controlled(&self) -> bool;

    /// Delivers a message to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is gone or cannot accept messages.
    fn post_message(&self, message: &ClientMessage) -> Result<()>;
}

/// Services the host runtime provides to the worker.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Asks the host to promote the waiting version to active.
    async fn skip_waiting(&self) -> Result<()>;

    /// Takes control of every open client not yet controlled.
    async fn claim(&self) -> Result<()>;

    /// Lists open clients, optionally including uncontrolled ones.
    async fn match_all(&self, include_uncontrolled: bool) -> Result<Vec<Arc<dyn ClientHandle>>>;
}
