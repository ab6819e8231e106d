//! Service discovery: a watcher-driven directory of
//! `{service, version} -> [node]` with in-memory and Consul back-ends.

pub mod consul;
pub mod memory;

pub use consul::ConsulRegistry;
pub use memory::MemoryRegistry;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A single live instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Node {
            id: id.into(),
            address: address.into(),
            port,
            metadata: HashMap::new(),
        }
    }

    /// `host:port` dial target for this node.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A named, versioned unit exposing RPC endpoints.
///
/// Two values describe the same family iff they agree on `(name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Service {
            name: name.into(),
            version: version.into(),
            metadata: HashMap::new(),
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

/// Change notification delivered to watchers. Events are best-effort:
/// duplicates are permitted, every membership transition produces at least
/// one.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub kind: EventKind,
    pub service: Service,
}

/// Options applied at registration time.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// With a TTL the registry arranges re-assertion or a backing check so a
    /// node disappears after roughly `3 * ttl` of silence.
    pub ttl: Option<Duration>,
    /// HTTP health endpoint (path) for back-ends that support delegated
    /// checks, e.g. `/health`.
    pub health_endpoint: Option<String>,
}

pub enum RegistryError {
    /// Back-end unreachable or the request failed in transit.
    Connection(String),
    Internal(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Connection(msg) => write!(f, "registry connection error: {msg}"),
            RegistryError::Internal(msg) => write!(f, "registry error: {msg}"),
        }
    }
}

impl std::fmt::Debug for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for RegistryError {}

/// Directory of live service nodes with watch semantics.
#[async_trait]
pub trait Registry: Send + Sync {
    fn name(&self) -> &'static str;

    /// Upsert every node of `service`.
    async fn register(
        &self,
        service: &Service,
        opts: RegisterOptions,
    ) -> Result<(), RegistryError>;

    /// Remove exactly the listed `(name, node.id)` tuples.
    async fn deregister(&self, service: &Service) -> Result<(), RegistryError>;

    /// All services for `name` matching `version`; `"*"` matches every
    /// version. Empty, never missing.
    async fn get_service(&self, name: &str, version: &str)
        -> Result<Vec<Service>, RegistryError>;

    async fn list_services(&self) -> Result<Vec<Service>, RegistryError>;

    /// Watch changes for one service name, or all names when `None`.
    async fn watch(&self, service: Option<&str>) -> Result<Watcher, RegistryError>;
}

/// Lazy sequence of [`RegistryEvent`]s with explicit stop.
///
/// The watcher owns its event channel and, for polling back-ends, its
/// polling task. Dropping the watcher stops it.
pub struct Watcher {
    rx: mpsc::Receiver<RegistryEvent>,
    stop: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Watcher {
    pub(crate) fn new(
        rx: mpsc::Receiver<RegistryEvent>,
        stop: CancellationToken,
        task: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Watcher { rx, stop, task }
    }

    /// Next event, or `None` once stopped and drained.
    pub async fn next(&mut self) -> Option<RegistryEvent> {
        if self.stop.is_cancelled() {
            return self.rx.try_recv().ok();
        }
        tokio::select! {
            _ = self.stop.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    /// Bounded wait for the next event.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Option<RegistryEvent> {
        tokio::time::timeout(timeout, self.next()).await.ok().flatten()
    }

    /// Stop watching. Idempotent; the second call is a no-op.
    pub fn stop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}
