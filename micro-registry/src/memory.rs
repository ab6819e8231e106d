//! In-memory registry: a guarded map with synchronous event fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    EventKind, RegisterOptions, Registry, RegistryError, RegistryEvent, Service, Watcher,
};

const EVENT_DEPTH: usize = 128;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct StoredNode {
    node: crate::Node,
    expires_at: Option<Instant>,
}

struct StoredFamily {
    metadata: HashMap<String, String>,
    nodes: HashMap<String, StoredNode>,
}

impl StoredFamily {
    fn snapshot(&self, name: &str, version: &str) -> Service {
        Service {
            name: name.to_string(),
            version: version.to_string(),
            metadata: self.metadata.clone(),
            nodes: self.nodes.values().map(|s| s.node.clone()).collect(),
        }
    }
}

#[derive(Default)]
struct Directory {
    // name -> version -> family
    families: HashMap<String, HashMap<String, StoredFamily>>,
}

struct WatcherSink {
    filter: Option<String>,
    tx: mpsc::Sender<RegistryEvent>,
    stop: CancellationToken,
}

#[derive(Default)]
struct Shared {
    directory: Mutex<Directory>,
    watchers: Mutex<Vec<WatcherSink>>,
}

impl Shared {
    fn broadcast(&self, event: RegistryEvent) {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|sink| {
            if sink.stop.is_cancelled() {
                return false;
            }
            if let Some(filter) = &sink.filter {
                if filter != &event.service.name {
                    return true;
                }
            }
            // Best-effort: a full channel drops the event, a closed one
            // drops the sink.
            !matches!(
                sink.tx.try_send(event.clone()),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let mut expired: Vec<Service> = Vec::new();
        {
            let mut directory = self.directory.lock().unwrap();
            for (name, versions) in directory.families.iter_mut() {
                versions.retain(|version, family| {
                    let mut removed = Vec::new();
                    family.nodes.retain(|_, stored| {
                        let dead = stored
                            .expires_at
                            .map(|deadline| deadline <= now)
                            .unwrap_or(false);
                        if dead {
                            removed.push(stored.node.clone());
                        }
                        !dead
                    });
                    if !removed.is_empty() {
                        expired.push(Service {
                            name: name.clone(),
                            version: version.clone(),
                            metadata: family.metadata.clone(),
                            nodes: removed,
                        });
                    }
                    !family.nodes.is_empty()
                });
            }
            directory.families.retain(|_, versions| !versions.is_empty());
        }
        for service in expired {
            debug!(service = %service.name, "ttl expired, dropping silent nodes");
            self.broadcast(RegistryEvent {
                kind: EventKind::Delete,
                service,
            });
        }
    }
}

/// Registry keeping the whole directory under one mutex.
///
/// Watchers are kept in a lazily-reaped list: a sink whose channel has
/// closed or whose watcher has stopped is dropped on the next fan-out. A
/// sweeper task starts with the first TTL registration and prunes nodes
/// silent for `3 * ttl`.
pub struct MemoryRegistry {
    shared: Arc<Shared>,
    sweeper: CancellationToken,
    sweeper_started: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        MemoryRegistry {
            shared: Arc::new(Shared::default()),
            sweeper: CancellationToken::new(),
            sweeper_started: AtomicBool::new(false),
        }
    }

    fn ensure_sweeper(&self) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::downgrade(&self.shared);
        let stop = self.sweeper.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
                let Some(shared) = shared.upgrade() else { break };
                shared.sweep_expired();
            }
        });
    }

    /// Stop the sweeper task.
    pub fn close(&self) {
        self.sweeper.cancel();
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        MemoryRegistry::new()
    }
}

impl Drop for MemoryRegistry {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register(
        &self,
        service: &Service,
        opts: RegisterOptions,
    ) -> Result<(), RegistryError> {
        if opts.ttl.is_some() {
            self.ensure_sweeper();
        }
        let expires_at = opts.ttl.map(|ttl| Instant::now() + ttl * 3);
        let (kind, snapshot) = {
            let mut directory = self.shared.directory.lock().unwrap();
            let versions = directory.families.entry(service.name.clone()).or_default();
            let created = !versions.contains_key(&service.version);
            let family = versions
                .entry(service.version.clone())
                .or_insert_with(|| StoredFamily {
                    metadata: service.metadata.clone(),
                    nodes: HashMap::new(),
                });
            family.metadata = service.metadata.clone();
            for node in &service.nodes {
                family.nodes.insert(
                    node.id.clone(),
                    StoredNode {
                        node: node.clone(),
                        expires_at,
                    },
                );
            }
            (
                if created { EventKind::Create } else { EventKind::Update },
                family.snapshot(&service.name, &service.version),
            )
        };
        self.shared.broadcast(RegistryEvent {
            kind,
            service: snapshot,
        });
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError> {
        let removed = {
            let mut directory = self.shared.directory.lock().unwrap();
            let mut removed = Vec::new();
            if let Some(versions) = directory.families.get_mut(&service.name) {
                if let Some(family) = versions.get_mut(&service.version) {
                    for node in &service.nodes {
                        if let Some(stored) = family.nodes.remove(&node.id) {
                            removed.push(stored.node);
                        }
                    }
                    if family.nodes.is_empty() {
                        versions.remove(&service.version);
                    }
                }
                if versions.is_empty() {
                    directory.families.remove(&service.name);
                }
            }
            removed
        };
        if !removed.is_empty() {
            self.shared.broadcast(RegistryEvent {
                kind: EventKind::Delete,
                service: Service {
                    name: service.name.clone(),
                    version: service.version.clone(),
                    metadata: service.metadata.clone(),
                    nodes: removed,
                },
            });
        }
        Ok(())
    }

    async fn get_service(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Vec<Service>, RegistryError> {
        let directory = self.shared.directory.lock().unwrap();
        let Some(versions) = directory.families.get(name) else {
            return Ok(Vec::new());
        };
        Ok(versions
            .iter()
            .filter(|(v, _)| version == "*" || v.as_str() == version)
            .map(|(v, family)| family.snapshot(name, v))
            .collect())
    }

    async fn list_services(&self) -> Result<Vec<Service>, RegistryError> {
        let directory = self.shared.directory.lock().unwrap();
        Ok(directory
            .families
            .iter()
            .flat_map(|(name, versions)| {
                versions
                    .iter()
                    .map(move |(version, family)| family.snapshot(name, version))
            })
            .collect())
    }

    async fn watch(&self, service: Option<&str>) -> Result<Watcher, RegistryError> {
        let (tx, rx) = mpsc::channel(EVENT_DEPTH);
        let stop = CancellationToken::new();
        self.shared.watchers.lock().unwrap().push(WatcherSink {
            filter: service.map(str::to_string),
            tx,
            stop: stop.clone(),
        });
        Ok(Watcher::new(rx, stop, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Node;

    fn hello_service(node_id: &str, port: u16) -> Service {
        Service::new("hello", "1.0").with_node(Node::new(node_id, "127.0.0.1", port))
    }

    #[tokio::test]
    async fn register_then_get_is_coherent() {
        let registry = MemoryRegistry::new();
        registry
            .register(&hello_service("n1", 7000), RegisterOptions::default())
            .await
            .unwrap();

        let found = registry.get_service("hello", "*").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].nodes.len(), 1);
        assert_eq!(found[0].nodes[0].id, "n1");

        // Exact version and wildcard both resolve; a missing name is empty,
        // never an error.
        assert_eq!(registry.get_service("hello", "1.0").await.unwrap().len(), 1);
        assert_eq!(registry.get_service("hello", "2.0").await.unwrap().len(), 0);
        assert_eq!(registry.get_service("absent", "*").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn deregister_removes_only_listed_nodes() {
        let registry = MemoryRegistry::new();
        registry
            .register(
                &Service::new("hello", "1.0")
                    .with_node(Node::new("n1", "127.0.0.1", 7000))
                    .with_node(Node::new("n2", "127.0.0.1", 7001)),
                RegisterOptions::default(),
            )
            .await
            .unwrap();

        registry
            .deregister(&hello_service("n1", 7000))
            .await
            .unwrap();

        let found = registry.get_service("hello", "1.0").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].nodes.len(), 1);
        assert_eq!(found[0].nodes[0].id, "n2");
    }

    #[tokio::test]
    async fn versions_are_distinct_families() {
        let registry = MemoryRegistry::new();
        registry
            .register(&hello_service("n1", 7000), RegisterOptions::default())
            .await
            .unwrap();
        registry
            .register(
                &Service::new("hello", "2.0").with_node(Node::new("n9", "127.0.0.1", 7100)),
                RegisterOptions::default(),
            )
            .await
            .unwrap();

        let all = registry.get_service("hello", "*").await.unwrap();
        assert_eq!(all.len(), 2);
        let v2 = registry.get_service("hello", "2.0").await.unwrap();
        assert_eq!(v2.len(), 1);
        assert_eq!(v2[0].nodes[0].id, "n9");
    }

    #[tokio::test]
    async fn watch_sees_membership_transitions() {
        let registry = MemoryRegistry::new();
        let mut watcher = registry.watch(Some("hello")).await.unwrap();

        registry
            .register(&hello_service("n1", 7000), RegisterOptions::default())
            .await
            .unwrap();
        let event = watcher.next().await.unwrap();
        assert_eq!(event.kind, EventKind::Create);
        assert_eq!(event.service.name, "hello");

        registry
            .register(&hello_service("n2", 7001), RegisterOptions::default())
            .await
            .unwrap();
        let event = watcher.next().await.unwrap();
        assert_eq!(event.kind, EventKind::Update);

        registry
            .deregister(&hello_service("n2", 7001))
            .await
            .unwrap();
        let event = watcher.next().await.unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.service.nodes[0].id, "n2");
    }

    #[tokio::test]
    async fn watch_filter_skips_other_services() {
        let registry = MemoryRegistry::new();
        let mut watcher = registry.watch(Some("hello")).await.unwrap();

        registry
            .register(
                &Service::new("other", "1.0").with_node(Node::new("x", "127.0.0.1", 7002)),
                RegisterOptions::default(),
            )
            .await
            .unwrap();
        registry
            .register(&hello_service("n1", 7000), RegisterOptions::default())
            .await
            .unwrap();

        let event = watcher.next().await.unwrap();
        assert_eq!(event.service.name, "hello");
    }

    #[tokio::test]
    async fn stopped_watcher_is_reaped_and_stop_is_idempotent() {
        let registry = MemoryRegistry::new();
        let mut watcher = registry.watch(None).await.unwrap();
        watcher.stop();
        watcher.stop();
        assert!(watcher.next().await.is_none());

        registry
            .register(&hello_service("n1", 7000), RegisterOptions::default())
            .await
            .unwrap();
        assert!(registry.shared.watchers.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_drops_silent_nodes() {
        let registry = MemoryRegistry::new();
        registry
            .register(
                &hello_service("n1", 7000),
                RegisterOptions {
                    ttl: Some(Duration::from_secs(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Just before 3*ttl the node is still there.
        tokio::time::advance(Duration::from_millis(2500)).await;
        assert_eq!(registry.get_service("hello", "*").await.unwrap().len(), 1);

        // After 3*ttl of silence it is gone.
        tokio::time::advance(Duration::from_millis(1600)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.get_service("hello", "*").await.unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn re_registration_refreshes_ttl() {
        let registry = MemoryRegistry::new();
        let opts = || RegisterOptions {
            ttl: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        registry.register(&hello_service("n1", 7000), opts()).await.unwrap();

        tokio::time::advance(Duration::from_millis(2000)).await;
        registry.register(&hello_service("n1", 7000), opts()).await.unwrap();

        tokio::time::advance(Duration::from_millis(2000)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.get_service("hello", "*").await.unwrap().len(), 1);
    }
}
