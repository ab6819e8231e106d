//! The RPC server: accept loop, per-socket dispatch tasks, registry
//! self-registration, and graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use micro_broker::Broker;
use micro_core::{Message, MessageType};
use micro_registry::{Node, RegisterOptions, Registry, RegistryError, Service};
use micro_transport::{Socket, Transport, TransportError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub address: String,
    /// Address published to the registry when it differs from the bind
    /// address.
    pub advertise: Option<String>,
    /// Registration TTL; re-asserted at half this interval.
    pub register_ttl: Option<Duration>,
    pub metadata: HashMap<String, String>,
    /// How long in-flight requests get to finish on shutdown before their
    /// contexts are cancelled.
    pub graceful_timeout: Duration,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        ServerConfig {
            name: name.into(),
            version: "latest".to_string(),
            address: address.into(),
            advertise: None,
            register_ttl: None,
            metadata: HashMap::new(),
            graceful_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_advertise(mut self, advertise: impl Into<String>) -> Self {
        self.advertise = Some(advertise.into());
        self
    }

    pub fn with_register_ttl(mut self, ttl: Duration) -> Self {
        self.register_ttl = Some(ttl);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }
}

pub enum ServerError {
    Transport(TransportError),
    Registry(RegistryError),
    Broker(micro_broker::BrokerError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Transport(e) => write!(f, "transport error: {e}"),
            ServerError::Registry(e) => write!(f, "registry error: {e}"),
            ServerError::Broker(e) => write!(f, "broker error: {e}"),
        }
    }
}

impl std::fmt::Debug for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for ServerError {}

impl From<TransportError> for ServerError {
    fn from(err: TransportError) -> Self {
        ServerError::Transport(err)
    }
}

impl From<RegistryError> for ServerError {
    fn from(err: RegistryError) -> Self {
        ServerError::Registry(err)
    }
}

/// A service host: one transport listener feeding one dispatcher.
pub struct Server {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    registry: Option<Arc<dyn Registry>>,
    broker: Option<Arc<dyn Broker>>,
    node_id: String,
    shutdown: CancellationToken,
    grace: CancellationToken,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Dispatcher,
    ) -> Self {
        Server {
            config,
            transport,
            dispatcher: Arc::new(dispatcher),
            registry: None,
            broker: None,
            node_id: Uuid::new_v4().to_string(),
            shutdown: CancellationToken::new(),
            grace: CancellationToken::new(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Token that stops the accept loop and starts the drain when
    /// cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn service_entry(&self, bound_addr: &str) -> Service {
        let advertised = self
            .config
            .advertise
            .as_deref()
            .unwrap_or(bound_addr)
            .to_string();
        let (address, port) = match advertised.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
            None => (advertised, 0),
        };
        let mut node = Node::new(self.node_id.clone(), address, port);
        node.metadata = self.config.metadata.clone();
        Service {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            metadata: self.config.metadata.clone(),
            nodes: vec![node],
        }
    }

    /// Bind, register, and serve until the shutdown token fires, then
    /// drain: stop accepting, let in-flight requests finish within the
    /// grace period, cancel stragglers, close, deregister, disconnect the
    /// broker.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let mut listener = self.transport.listen(&self.config.address).await?;
        let bound_addr = listener.addr();
        info!(
            service = %self.config.name,
            addr = %bound_addr,
            transport = self.transport.name(),
            "serving"
        );

        let service = self.service_entry(&bound_addr);
        if let Some(registry) = &self.registry {
            registry
                .register(
                    &service,
                    RegisterOptions {
                        ttl: self.config.register_ttl,
                        ..Default::default()
                    },
                )
                .await?;
            if let Some(ttl) = self.config.register_ttl {
                self.spawn_reregistration(registry.clone(), service.clone(), ttl);
            }
        }
        if let Some(broker) = &self.broker {
            broker.connect().await.map_err(ServerError::Broker)?;
        }

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(socket) => {
                        let dispatcher = self.dispatcher.clone();
                        let grace = self.grace.clone();
                        let shutdown = self.shutdown.clone();
                        tracker.spawn(handle_socket(socket, dispatcher, shutdown, grace));
                    }
                    Err(TransportError::NotConnected) => break,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        // Drain phase.
        listener.close().await.ok();
        tracker.close();
        if tokio::time::timeout(self.config.graceful_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!(service = %self.config.name, "grace period expired, cancelling in-flight requests");
            self.grace.cancel();
            tokio::time::timeout(Duration::from_secs(1), tracker.wait())
                .await
                .ok();
        }

        if let Some(registry) = &self.registry {
            if let Err(e) = registry.deregister(&service).await {
                warn!(error = %e, "deregistration failed");
            }
        }
        if let Some(broker) = &self.broker {
            broker.disconnect().await.ok();
        }
        info!(service = %self.config.name, "stopped");
        Ok(())
    }

    fn spawn_reregistration(
        &self,
        registry: Arc<dyn Registry>,
        service: Service,
        ttl: Duration,
    ) {
        let stop = self.shutdown.clone();
        let interval = (ttl / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let opts = RegisterOptions {
                    ttl: Some(ttl),
                    ..Default::default()
                };
                if let Err(e) = registry.register(&service, opts).await {
                    warn!(error = %e, "re-registration failed");
                }
            }
        });
    }
}

/// Per-connection loop: receive, dispatch, respond.
async fn handle_socket(
    mut socket: Box<dyn Socket>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    grace: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv() => received,
        };
        match received {
            Ok(msg) if matches!(msg.msg_type, MessageType::Request | MessageType::Event) => {
                let respond = msg.msg_type == MessageType::Request;
                let response: Message = dispatcher.dispatch_with_parent(&msg, Some(&grace)).await;
                if respond {
                    if let Err(e) = socket.send(response).await {
                        debug!(error = %e, "failed to write response");
                        break;
                    }
                }
            }
            Ok(msg) => {
                debug!(msg_type = ?msg.msg_type, "ignoring non-request message");
            }
            Err(TransportError::NotConnected) => break,
            Err(e) => {
                debug!(error = %e, "receive failed");
                break;
            }
        }
    }
    socket.close().await.ok();
}
