//! RPC client: registry resolution, node selection, pooled transport send,
//! bounded retries, and per-address circuit breaking.

pub mod breaker;
pub mod selector;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use selector::{
    RandomSelector, RoundRobinSelector, Selector, StickySelector, WeightedSelector,
};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use micro_core::{headers, MicroError, TransportRequest, TransportResponse};
use micro_metrics::MetricsCollector;
use micro_pool::{LivenessCheck, Pool, PoolConfig};
use micro_registry::{Node, Registry};
use micro_transport::Transport;
use tracing::debug;

/// Bounded retries with exponential backoff. Applied only to transport
/// errors and 5xx responses, never to 4xx, and never to timeouts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first call.
    pub retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: 2,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        (self.base_backoff * factor).min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default receive timeout, used when the request carries none.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            pool: PoolConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Discovery-driven RPC caller. Pools and breakers are per remote address
/// and shared across calls.
pub struct Client {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn Registry>,
    selector: Arc<dyn Selector>,
    pools: DashMap<String, Arc<Pool>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    metrics: Arc<MetricsCollector>,
    config: ClientConfig,
}

impl Client {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn Registry>,
        config: ClientConfig,
    ) -> Self {
        Client {
            transport,
            registry,
            selector: Arc::new(RandomSelector),
            pools: DashMap::new(),
            breakers: DashMap::new(),
            metrics: Arc::new(MetricsCollector::new()),
            config,
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Call `request.service / request.endpoint` with the configured retry
    /// policy.
    pub async fn call(&self, request: &TransportRequest) -> Result<TransportResponse, MicroError> {
        self.call_with_retries(request, self.config.retry.retries).await
    }

    /// Call with an explicit retry budget (additional attempts after the
    /// first). Each retry re-consults the registry and re-selects a node.
    pub async fn call_with_retries(
        &self,
        request: &TransportRequest,
        retries: u32,
    ) -> Result<TransportResponse, MicroError> {
        let mut last_response: Option<TransportResponse> = None;
        let mut last_error: Option<MicroError> = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry.backoff(attempt - 1)).await;
                debug!(
                    service = %request.service,
                    endpoint = %request.endpoint,
                    attempt,
                    "retrying"
                );
            }
            let addr = self.resolve(request).await?;
            match self.call_address_once(&addr, request).await {
                Ok(response) if response.status >= 500 => {
                    // Retryable; keep the response in case the budget runs
                    // out.
                    last_response = Some(response);
                    last_error = None;
                }
                Ok(response) => return Ok(response),
                Err(err @ MicroError::Timeout(_)) => return Err(err),
                Err(err) => {
                    last_error = Some(err);
                }
            }
        }
        // A real backend answer beats a synthesized error.
        match (last_response, last_error) {
            (Some(response), _) => Ok(response),
            (None, Some(err)) => Err(err),
            (None, None) => Err(MicroError::ServiceUnavailable("no attempt made".into())),
        }
    }

    /// Call a specific address, bypassing discovery. No retries.
    pub async fn call_address(
        &self,
        addr: &str,
        request: &TransportRequest,
    ) -> Result<TransportResponse, MicroError> {
        self.call_address_once(addr, request).await
    }

    async fn resolve(&self, request: &TransportRequest) -> Result<String, MicroError> {
        let services = self
            .registry
            .get_service(&request.service, "*")
            .await
            .map_err(|e| MicroError::ServiceUnavailable(e.to_string()))?;
        let nodes: Vec<Node> = services.into_iter().flat_map(|s| s.nodes).collect();
        let node = self.selector.select(&nodes).ok_or_else(|| {
            MicroError::ServiceUnavailable(format!(
                "no nodes available for service {:?}",
                request.service
            ))
        })?;
        Ok(dial_target(node))
    }

    async fn call_address_once(
        &self,
        addr: &str,
        request: &TransportRequest,
    ) -> Result<TransportResponse, MicroError> {
        let labels = [("service", request.service.as_str())];
        self.metrics.inc_counter("client_calls_total", &labels, 1.0);

        let breaker = self
            .breakers
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.breaker.clone())))
            .clone();
        if !breaker.allow() {
            self.metrics
                .inc_counter("client_short_circuits_total", &labels, 1.0);
            return Err(MicroError::ServiceUnavailable(format!(
                "circuit open for {addr}"
            )));
        }

        let pool = self
            .pools
            .entry(addr.to_string())
            .or_insert_with(|| {
                Pool::new(
                    self.transport.clone(),
                    addr,
                    self.config.pool.clone(),
                    Arc::new(LivenessCheck),
                    self.metrics.clone(),
                )
            })
            .clone();
        let mut conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                breaker.record_failure();
                return Err(e.into());
            }
        };

        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let mut msg = request.clone().into_message();
        // The caller's deadline travels with the message, informationally.
        msg.set_header(headers::TIMEOUT, &timeout.as_millis().to_string());

        let exchange = async {
            conn.socket().send(msg).await?;
            conn.socket().recv_timeout(timeout).await
        };
        match exchange.await {
            Ok(Some(reply)) => {
                let response = TransportResponse::from_message(&reply);
                if response.status >= 500 {
                    breaker.record_failure();
                } else {
                    breaker.record_success();
                }
                pool.release(conn).await;
                Ok(response)
            }
            Ok(None) => {
                // A late reply would poison the next exchange; drop the
                // connection.
                breaker.record_failure();
                conn.socket().close().await.ok();
                pool.release(conn).await;
                self.metrics
                    .inc_counter("client_timeouts_total", &labels, 1.0);
                Err(MicroError::Timeout(format!(
                    "no response from {addr} within {}ms",
                    timeout.as_millis()
                )))
            }
            Err(e) => {
                breaker.record_failure();
                conn.socket().close().await.ok();
                pool.release(conn).await;
                Err(e.into())
            }
        }
    }

    /// Close every pool. Further calls will dial fresh connections.
    pub async fn close(&self) {
        for entry in self.pools.iter() {
            entry.value().close().await;
        }
        self.pools.clear();
    }
}

/// Dial target for a node. Port 0 means the address is already a complete
/// transport-specific target (loopback names).
fn dial_target(node: &Node) -> String {
    if node.port == 0 {
        node.address.clone()
    } else {
        node.addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use micro_core::Message;
    use micro_registry::{MemoryRegistry, RegisterOptions, Service};
    use micro_transport::{Listener, LoopbackTransport};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Minimal backend: answers every request with `respond(n)` where `n`
    /// counts calls from 1.
    fn spawn_backend(
        mut listener: Box<dyn Listener>,
        respond: impl Fn(u32, &Message) -> Option<Message> + Send + Sync + 'static,
    ) -> Arc<AtomicU32> {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let respond = Arc::new(respond);
        tokio::spawn(async move {
            while let Ok(mut socket) = listener.accept().await {
                let seen = seen.clone();
                let respond = respond.clone();
                tokio::spawn(async move {
                    while let Ok(msg) = socket.recv().await {
                        let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                        if let Some(reply) = respond(n, &msg) {
                            if socket.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        calls
    }

    async fn setup(
        name: &str,
        respond: impl Fn(u32, &Message) -> Option<Message> + Send + Sync + 'static,
    ) -> (Client, Arc<AtomicU32>) {
        let transport = Arc::new(LoopbackTransport::new());
        let registry = Arc::new(MemoryRegistry::new());
        let listener = transport.listen(name).await.unwrap();
        let calls = spawn_backend(listener, respond);

        registry
            .register(
                &Service::new(name, "1.0").with_node(Node::new("n1", name, 0)),
                RegisterOptions::default(),
            )
            .await
            .unwrap();

        let config = ClientConfig {
            timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                retries: 2,
                base_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
            },
            breaker: BreakerConfig {
                window: 4,
                failure_ratio: 0.5,
                min_calls: 2,
                cooldown: Duration::from_millis(80),
            },
            ..Default::default()
        };
        (
            Client::new(transport, registry, config),
            calls,
        )
    }

    fn hello_request(service: &str) -> TransportRequest {
        TransportRequest::new(service, "hello").with_body(Bytes::from_static(b"{\"name\":\"World\"}"))
    }

    #[tokio::test]
    async fn round_trip_through_discovery() {
        let (client, calls) = setup("greeter", |_n, msg| {
            Some(msg.response(200, Bytes::from_static(b"\"Hello, World!\"")))
        })
        .await;

        let response = client.call(&hello_request("greeter")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"\"Hello, World!\"");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_service_is_unavailable() {
        let (client, _calls) = setup("greeter", |_n, msg| {
            Some(msg.response(200, Bytes::new()))
        })
        .await;
        let err = client.call(&hello_request("missing")).await.unwrap_err();
        assert_eq!(err.status(), 503);
    }

    #[tokio::test]
    async fn transient_5xx_is_retried_until_success() {
        let (client, calls) = setup("flaky", |n, msg| {
            if n < 3 {
                Some(msg.response(500, Bytes::from_static(b"{\"error\":\"boom\"}")))
            } else {
                Some(msg.response(200, Bytes::from_static(b"\"ok\"")))
            }
        })
        .await;

        let response = client.call(&hello_request("flaky")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_never_retried() {
        let (client, calls) = setup("strict", |_n, msg| {
            Some(msg.response(400, Bytes::from_static(b"{\"error\":\"bad\"}")))
        })
        .await;

        let response = client.call(&hello_request("strict")).await.unwrap();
        assert_eq!(response.status, 400);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            response.error.as_ref().map(|e| e.status()),
            Some(400)
        );
    }

    #[tokio::test]
    async fn timeout_maps_to_504_without_retry() {
        let (client, calls) = setup("sleepy", |_n, _msg| None).await;

        let request = hello_request("sleepy").with_timeout(Duration::from_millis(40));
        let err = client.call(&request).await.unwrap_err();
        assert_eq!(err.status(), 504);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn breaker_opens_and_half_opens() {
        let (client, calls) = setup("down", |_n, msg| {
            Some(msg.response(500, Bytes::from_static(b"{\"error\":\"down\"}")))
        })
        .await;

        // Enough failures to trip (min_calls 2, ratio 0.5): one call with
        // retries records three failures.
        let response = client.call(&hello_request("down")).await.unwrap();
        assert_eq!(response.status, 500);
        let after_trip = calls.load(Ordering::SeqCst);

        // Short-circuits now, without reaching the backend.
        let err = client.call(&hello_request("down")).await.unwrap_err();
        assert_eq!(err.status(), 503);
        assert_eq!(calls.load(Ordering::SeqCst), after_trip);

        // After the cooldown a single probe goes through.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = client.call_with_retries(&hello_request("down"), 0).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_trip + 1);
    }
}
