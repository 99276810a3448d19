//! Scripted fakes for the network and host seams, shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use url::Url;

use crate::cache::{CacheStorage, MemoryStorage};
use crate::error::{Error, Result};
use crate::host::{ClientHandle, WorkerHost};
use crate::http::{CacheKey, Request, Response};
use crate::messages::ClientMessage;
use crate::net::Fetcher;

pub const SCOPE: &str = "https://app.example/";

pub fn url(path: &str) -> Url {
    Url::parse(SCOPE).unwrap().join(path).unwrap()
}

/// What the mock network does for one URL.
#[derive(Clone)]
pub enum Scripted {
    Respond(Response),
    Fail,
    /// Waits for the notify before responding.
    Hang(Arc<Notify>, Response),
}

/// A mock network keyed by absolute URL. Unscripted URLs fail.
#[derive(Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &Url, response: Response) {
        self.script(url, Scripted::Respond(response));
    }

    pub fn fail(&self, url: &Url) {
        self.script(url, Scripted::Fail);
    }

    pub fn hang(&self, url: &Url, response: Response) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.script(url, Scripted::Hang(Arc::clone(&gate), response));
        gate
    }

    pub fn script(&self, url: &Url, outcome: Scripted) {
        self.routes.lock().unwrap().insert(url.to_string(), outcome);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, url: &Url) -> usize {
        let target = url.to_string();
        self.calls.lock().unwrap().iter().filter(|u| **u == target).count()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let key = request.url.to_string();
        self.calls.lock().unwrap().push(key.clone());
        let outcome = self.routes.lock().unwrap().get(&key).cloned();
        match outcome {
            Some(Scripted::Respond(res)) => Ok(res),
            Some(Scripted::Hang(gate, res)) => {
                gate.notified().await;
                Ok(res)
            }
            Some(Scripted::Fail) | None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("offline: {key}"),
            ))),
        }
    }
}

/// A client that records every message delivered to it.
pub struct MockClient {
    id: String,
    controlled: AtomicBool,
    broken: AtomicBool,
    received: Mutex<Vec<ClientMessage>>,
}

impl MockClient {
    pub fn new(id: &str, controlled: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            controlled: AtomicBool::new(controlled),
            broken: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn broken(id: &str) -> Arc<Self> {
        let client = Self::new(id, true);
        client.broken.store(true, Ordering::SeqCst);
        client
    }

    pub fn received(&self) -> Vec<ClientMessage> {
        self.received.lock().unwrap().clone()
    }
}

impl ClientHandle for MockClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_controlled(&self) -> bool {
        self.controlled.load(Ordering::SeqCst)
    }

    fn post_message(&self, message: &ClientMessage) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::ClientGone(self.id.clone()));
        }
        self.received.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// A host with a fixed set of clients and switchable failures.
#[derive(Default)]
pub struct MockHost {
    pub clients: Mutex<Vec<Arc<MockClient>>>,
    pub skip_waiting_calls: AtomicUsize,
    pub claim_calls: AtomicUsize,
    /// Number of upcoming `skip_waiting` calls that fail.
    pub skip_waiting_failures: AtomicUsize,
    pub fail_match_all: AtomicBool,
    pub fail_claim: AtomicBool,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clients(clients: Vec<Arc<MockClient>>) -> Self {
        let host = Self::new();
        *host.clients.lock().unwrap() = clients;
        host
    }
}

#[async_trait]
impl WorkerHost for MockHost {
    async fn skip_waiting(&self) -> Result<()> {
        self.skip_waiting_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.skip_waiting_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.skip_waiting_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Promotion("host refused".to_string()));
        }
        Ok(())
    }

    async fn claim(&self) -> Result<()> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_claim.load(Ordering::SeqCst) {
            return Err(Error::Promotion("claim refused".to_string()));
        }
        for client in self.clients.lock().unwrap().iter() {
            client.controlled.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn match_all(&self, include_uncontrolled: bool) -> Result<Vec<Arc<dyn ClientHandle>>> {
        if self.fail_match_all.load(Ordering::SeqCst) {
            return Err(Error::Promotion("clients unavailable".to_string()));
        }
        Ok(self
            .clients
            .lock()
            .unwrap()
            .iter()
            .filter(|c| include_uncontrolled || c.is_controlled())
            .map(|c| Arc::clone(c) as Arc<dyn ClientHandle>)
            .collect())
    }
}

/// In-memory storage with switchable write and delete failures.
#[derive(Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    pub fail_delete: AtomicBool,
    /// 1-based index of the `put` that fails; 0 never fails.
    pub failing_put: AtomicUsize,
    puts: AtomicUsize,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for FlakyStorage {
    async fn open(&self, name: &str) -> Result<()> {
        self.inner.open(name).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("{name} is locked")));
        }
        self.inner.delete(name).await
    }

    async fn get(&self, name: &str, key: &CacheKey) -> Result<Option<Response>> {
        self.inner.get(name, key).await
    }

    async fn put(&self, name: &str, key: &CacheKey, response: &Response) -> Result<()> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.failing_put.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk full".to_string()));
        }
        self.inner.put(name, key, response).await
    }

    async fn entry_count(&self, name: &str) -> Result<usize> {
        self.inner.entry_count(name).await
    }
}
