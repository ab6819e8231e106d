//! End-to-end scenarios over the loopback transport and memory registry.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use micro::client::{BreakerConfig, RetryPolicy};
use micro::core::{headers, Message};
use micro::gateway::{AggregateBackend, PartialFailure};
use micro::server::middleware::{
    ErrorHandlerMiddleware, LoggingMiddleware, RateLimitConfig, RecoveryMiddleware,
    RequestIdMiddleware,
};
use micro::transport::{DialOptions, Socket};
use micro::{
    method_fn, Client, ClientConfig, Dispatcher, Gateway, GatewayConfig, JwtConfig, JwtValidator,
    LoopbackTransport, MemoryRegistry, MetricsCollector, Route, Server, ServerConfig,
    ServiceConfig, Transport, TransportRequest,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

#[derive(Deserialize)]
struct HelloRequest {
    name: String,
}

/// Start a `hello` service with a `hello(name) -> String` handler.
async fn start_hello_service(
    transport: Arc<LoopbackTransport>,
    registry: Arc<MemoryRegistry>,
) -> CancellationToken {
    let codecs = Arc::new(micro::core::codec::CodecRegistry::with_defaults());
    let dispatcher = Dispatcher::new(codecs.clone())
        .apply(Arc::new(RequestIdMiddleware))
        .apply(Arc::new(LoggingMiddleware))
        .apply(Arc::new(ErrorHandlerMiddleware))
        .apply(Arc::new(RecoveryMiddleware))
        .handle(
            "hello",
            method_fn(codecs, |req: HelloRequest| async move {
                Ok(format!("Hello, {}!", req.name))
            }),
        );
    let server = Server::new(
        ServerConfig::new("hello", "hello-svc")
            .with_version("1.0")
            .with_advertise("hello-svc"),
        transport,
        dispatcher,
    )
    .with_registry(registry);
    let shutdown = server.shutdown_token();
    tokio::spawn(async move { server.serve().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown
}

/// Start a backend answering every endpoint with a fixed JSON body after an
/// optional delay.
async fn start_fixed_service(
    transport: Arc<LoopbackTransport>,
    registry: Arc<MemoryRegistry>,
    name: &'static str,
    status: u16,
    body: serde_json::Value,
    delay: Option<Duration>,
) -> CancellationToken {
    let codecs = Arc::new(micro::core::codec::CodecRegistry::with_defaults());
    let mut dispatcher = Dispatcher::new(codecs)
        .apply(Arc::new(ErrorHandlerMiddleware))
        .apply(Arc::new(RecoveryMiddleware));
    let payload = Bytes::from(body.to_string());
    dispatcher = dispatcher.fallback(micro::server::raw_fn(move |ctx| {
        ctx.response.status = status;
        ctx.response.body = payload.clone();
        ctx.response.content_type = "application/json".to_string();
        Ok(())
    }));
    // Delay runs in a middleware so the fallback stays a plain closure.
    if let Some(delay) = delay {
        struct Delay(Duration);
        #[async_trait::async_trait]
        impl micro::server::Middleware for Delay {
            fn name(&self) -> &'static str {
                "delay"
            }
            async fn handle(
                &self,
                ctx: &mut micro::Context,
                next: micro::server::Next<'_>,
            ) -> Result<(), micro::MicroError> {
                tokio::time::sleep(self.0).await;
                next.run(ctx).await
            }
        }
        dispatcher = dispatcher.apply(Arc::new(Delay(delay)));
    }

    let server = Server::new(
        ServerConfig::new(name, name)
            .with_version("1.0")
            .with_advertise(name),
        transport,
        dispatcher,
    )
    .with_registry(registry);
    let shutdown = server.shutdown_token();
    tokio::spawn(async move { server.serve().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown
}

fn make_client(
    transport: Arc<LoopbackTransport>,
    registry: Arc<MemoryRegistry>,
) -> Client {
    Client::new(
        transport,
        registry,
        ClientConfig {
            timeout: Duration::from_millis(500),
            retry: RetryPolicy {
                retries: 2,
                base_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
            },
            breaker: BreakerConfig {
                window: 6,
                failure_ratio: 0.5,
                min_calls: 3,
                cooldown: Duration::from_millis(100),
            },
            ..Default::default()
        },
    )
}

async fn start_gateway(
    transport: Arc<LoopbackTransport>,
    registry: Arc<MemoryRegistry>,
    config: GatewayConfig,
) -> (String, CancellationToken) {
    let metrics = Arc::new(MetricsCollector::new());
    let client = Arc::new(
        make_client(transport.clone(), registry.clone()).with_metrics(metrics.clone()),
    );
    let addr = format!("{}:{}", config.host, config.port);
    let gateway = Gateway::new(config, registry, client, metrics);
    let server = gateway.server(transport);
    let shutdown = server.shutdown_token();
    tokio::spawn(async move { server.serve().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, shutdown)
}

fn http_message(method: &str, path: &str, body: &[u8]) -> Message {
    let mut msg = Message::request(
        "gateway",
        path.trim_start_matches('/'),
        Bytes::from(body.to_vec()),
    );
    msg.set_header(headers::HTTP_METHOD, method);
    msg.set_header(headers::CONTENT_TYPE, "application/json");
    msg
}

async fn gateway_get(socket: &mut Box<dyn Socket>, path: &str) -> Message {
    gateway_request(socket, "GET", path, b"", &[]).await
}

async fn gateway_request(
    socket: &mut Box<dyn Socket>,
    method: &str,
    path: &str,
    body: &[u8],
    extra_headers: &[(&str, &str)],
) -> Message {
    let mut msg = http_message(method, path, body);
    for (name, value) in extra_headers {
        msg.set_header(name, value);
    }
    socket.send(msg).await.unwrap();
    socket.recv().await.unwrap()
}

#[tokio::test]
async fn hello_round_trip() {
    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(MemoryRegistry::new());
    let shutdown = start_hello_service(transport.clone(), registry.clone()).await;

    let client = make_client(transport, registry);
    let request = TransportRequest::new("hello", "hello")
        .with_body(Bytes::from_static(b"{\"name\":\"World\"}"));
    let response = client.call(&request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"\"Hello, World!\"");

    shutdown.cancel();
}

#[tokio::test]
async fn gateway_404_on_missing_route() {
    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(MemoryRegistry::new());
    let config = GatewayConfig::new("gw-404", 0)
        .with_route(Route::new("GET", "/products", "catalog", "list"));
    let (addr, shutdown) = start_gateway(transport.clone(), registry, config).await;

    let mut socket = transport.dial(&addr, DialOptions::default()).await.unwrap();
    let reply = gateway_get(&mut socket, "/missing").await;
    assert_eq!(reply.status(), Some(404));
    let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(body["type"], "NotFoundError");

    shutdown.cancel();
}

#[tokio::test]
async fn gateway_rate_limiter_fixed_window() {
    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(MemoryRegistry::new());
    let _svc = start_fixed_service(
        transport.clone(),
        registry.clone(),
        "catalog",
        200,
        serde_json::json!([]),
        None,
    )
    .await;

    let config = GatewayConfig::new("gw-rl", 0)
        .with_route(Route::new("GET", "/products", "catalog", "list"))
        .with_rate_limit(RateLimitConfig {
            limit: 2,
            window: Duration::from_millis(200),
        });
    let (addr, shutdown) = start_gateway(transport.clone(), registry, config).await;

    let mut socket = transport.dial(&addr, DialOptions::default()).await.unwrap();
    let first = gateway_get(&mut socket, "/products").await;
    assert_eq!(first.status(), Some(200));
    let second = gateway_get(&mut socket, "/products").await;
    assert_eq!(second.status(), Some(200));

    let third = gateway_get(&mut socket, "/products").await;
    assert_eq!(third.status(), Some(429));
    assert_eq!(third.header(headers::RATE_LIMIT_REMAINING), Some("0"));
    let body: serde_json::Value = serde_json::from_slice(&third.body).unwrap();
    assert_eq!(body["type"], "RateLimitError");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let fourth = gateway_get(&mut socket, "/products").await;
    assert_eq!(fourth.status(), Some(200));

    shutdown.cancel();
}

#[tokio::test]
async fn gateway_aggregation_merges_backends() {
    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(MemoryRegistry::new());
    let _catalog = start_fixed_service(
        transport.clone(),
        registry.clone(),
        "catalog",
        200,
        serde_json::json!([{"id": "p-1"}]),
        Some(Duration::from_millis(10)),
    )
    .await;
    let _orders = start_fixed_service(
        transport.clone(),
        registry.clone(),
        "orders",
        200,
        serde_json::json!([{"id": "o-1"}]),
        Some(Duration::from_millis(20)),
    )
    .await;

    let config = GatewayConfig::new("gw-agg", 0).with_route(Route::aggregate(
        "GET",
        "/combined",
        vec![
            AggregateBackend::new("a", "catalog", "list"),
            AggregateBackend::new("b", "orders", "list_recent"),
        ],
        PartialFailure::ErrorField,
    ));
    let (addr, shutdown) = start_gateway(transport.clone(), registry, config).await;

    let mut socket = transport.dial(&addr, DialOptions::default()).await.unwrap();
    let reply = gateway_get(&mut socket, "/combined").await;
    assert_eq!(reply.status(), Some(200));
    let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(
        body,
        serde_json::json!({"a": [{"id": "p-1"}], "b": [{"id": "o-1"}]})
    );

    shutdown.cancel();
}

#[tokio::test]
async fn gateway_rbac_denies_missing_role() {
    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(MemoryRegistry::new());
    let _svc = start_fixed_service(
        transport.clone(),
        registry.clone(),
        "admin-svc",
        200,
        serde_json::json!({"ok": true}),
        None,
    )
    .await;

    const SECRET: &[u8] = b"gateway-secret";
    let validator = Arc::new(JwtValidator::from_secret(SECRET, JwtConfig::default()));
    let config = GatewayConfig::new("gw-rbac", 0)
        .with_jwt(validator)
        .with_service(ServiceConfig::new("admin-svc"))
        .with_route(
            Route::new("GET", "/admin/settings", "admin-svc", "settings").with_roles(["admin"]),
        );
    let (addr, shutdown) = start_gateway(transport.clone(), registry, config).await;

    let exp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 300;
    let user_token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &serde_json::json!({"sub": "u-1", "roles": ["user"], "exp": exp}),
        &jsonwebtoken::EncodingKey::from_secret(SECRET),
    )
    .unwrap();

    let mut socket = transport.dial(&addr, DialOptions::default()).await.unwrap();
    let denied = gateway_request(
        &mut socket,
        "GET",
        "/admin/settings",
        b"",
        &[("authorization", &format!("Bearer {user_token}"))],
    )
    .await;
    assert_eq!(denied.status(), Some(403));
    let body: serde_json::Value = serde_json::from_slice(&denied.body).unwrap();
    assert_eq!(body["type"], "ForbiddenError");

    // The admin role passes through to the backend.
    let admin_token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &serde_json::json!({"sub": "u-2", "roles": ["admin"], "exp": exp}),
        &jsonwebtoken::EncodingKey::from_secret(SECRET),
    )
    .unwrap();
    let allowed = gateway_request(
        &mut socket,
        "GET",
        "/admin/settings",
        b"",
        &[("authorization", &format!("Bearer {admin_token}"))],
    )
    .await;
    assert_eq!(allowed.status(), Some(200));

    shutdown.cancel();
}

#[tokio::test]
async fn circuit_breaker_short_circuits_then_probes() {
    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(MemoryRegistry::new());
    let _svc = start_fixed_service(
        transport.clone(),
        registry.clone(),
        "busted",
        500,
        serde_json::json!({"error": "down", "type": "InternalError"}),
        None,
    )
    .await;

    let client = make_client(transport, registry);
    let request = TransportRequest::new("busted", "anything");

    // One call with two retries records three failures and trips the
    // breaker (min_calls 3, ratio 0.5).
    let response = client.call(&request).await.unwrap();
    assert_eq!(response.status, 500);

    // Short circuit: 503 without touching the backend.
    let started = std::time::Instant::now();
    let err = client.call_with_retries(&request, 0).await.unwrap_err();
    assert_eq!(err.status(), 503);
    assert!(started.elapsed() < Duration::from_millis(20));

    // After the cooldown, a single probe reaches the backend again.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let probed = client.call_with_retries(&request, 0).await.unwrap();
    assert_eq!(probed.status, 500);
}

#[tokio::test]
async fn graceful_shutdown_deregisters() {
    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(MemoryRegistry::new());
    let shutdown = start_hello_service(transport.clone(), registry.clone()).await;

    use micro::Registry as _;
    assert_eq!(registry.get_service("hello", "*").await.unwrap().len(), 1);
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(registry.get_service("hello", "*").await.unwrap().is_empty());
}
