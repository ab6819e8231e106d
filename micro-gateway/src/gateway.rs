//! The gateway proper: a dispatcher-based HTTP edge whose fallback handler
//! is the radix router, plus the built-in `/health`, `/metrics`, and
//! `/api/docs` endpoints.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use micro_auth::Principal;
use micro_client::Client;
use micro_core::codec::CodecRegistry;
use micro_core::{headers, Context, MicroError, TransportRequest, TransportResponse};
use micro_metrics::MetricsCollector;
use micro_registry::Registry;
use micro_server::middleware::{
    CompressionMiddleware, CorsMiddleware, ErrorHandlerMiddleware, JwtAuthMiddleware,
    LoggingMiddleware, RateLimitMiddleware, RecoveryMiddleware, RequestIdMiddleware,
    RequestSizeMiddleware, TimeoutMiddleware, TimingMiddleware, PRINCIPAL_KEY,
};
use micro_server::{Dispatcher, Handler, Middleware, Next, Server, ServerConfig};
use micro_transport::Transport;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{GatewayConfig, ServiceConfig};
use crate::openapi;
use crate::proxy::ServiceProxy;
use crate::router::{AggregateSpec, PartialFailure, Route, Router};

struct GatewayCore {
    title: String,
    version: String,
    address: String,
    default_timeout: Duration,
    router: RwLock<Router>,
    proxies: DashMap<String, Arc<ServiceProxy>>,
    service_configs: HashMap<String, ServiceConfig>,
    service_names: Vec<String>,
    registry: Arc<dyn Registry>,
    client: Arc<Client>,
    metrics: Arc<MetricsCollector>,
    codecs: Arc<CodecRegistry>,
    edge_middleware: Vec<Arc<dyn Middleware>>,
    started_at: Instant,
}

impl GatewayCore {
    fn proxy_for(&self, service: &str) -> Arc<ServiceProxy> {
        self.proxies
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self
                    .service_configs
                    .get(service)
                    .cloned()
                    .unwrap_or_else(|| ServiceConfig::new(service));
                Arc::new(ServiceProxy::new(
                    config,
                    self.client.clone(),
                    self.default_timeout,
                ))
            })
            .clone()
    }

    async fn aggregate(
        &self,
        spec: &AggregateSpec,
        route: &Route,
        inbound: &TransportRequest,
    ) -> Result<TransportResponse, MicroError> {
        let timeout = route.timeout.unwrap_or(self.default_timeout);
        let legs = spec.backends.iter().map(|backend| {
            let proxy = self.proxy_for(&backend.service);
            let inbound = inbound.clone();
            let method = backend.method.clone();
            let key = backend.key.clone();
            async move {
                let body = inbound.body.clone();
                let result = proxy.call(&method, &inbound, Some(timeout), None, body).await;
                (key, result)
            }
        });
        let results = tokio::time::timeout(timeout, join_all(legs))
            .await
            .map_err(|_| {
                MicroError::Timeout(format!(
                    "aggregation exceeded {}ms",
                    timeout.as_millis()
                ))
            })?;

        // Exactly one entry per configured backend key.
        let mut merged = serde_json::Map::new();
        for (key, result) in results {
            let leg_error = match result {
                Ok(response) if response.status < 400 => {
                    let value = serde_json::from_slice(&response.body).unwrap_or_else(|_| {
                        serde_json::Value::String(
                            String::from_utf8_lossy(&response.body).into_owned(),
                        )
                    });
                    merged.insert(key, value);
                    continue;
                }
                Ok(response) => {
                    let status = response.status;
                    response
                        .error
                        .unwrap_or_else(|| MicroError::from_status(status, "backend error"))
                }
                Err(err) => err,
            };
            match spec.on_failure {
                PartialFailure::FailResponse => return Err(leg_error),
                PartialFailure::ErrorField => {
                    merged.insert(
                        key,
                        serde_json::json!({
                            "error": leg_error.message(),
                            "type": leg_error.kind(),
                        }),
                    );
                }
            }
        }

        let mut response = TransportResponse::ok();
        response.body = Bytes::from(serde_json::Value::Object(merged).to_string());
        response.content_type = "application/json".to_string();
        Ok(response)
    }

    async fn health(&self) -> serde_json::Value {
        let mut services = serde_json::Map::new();
        let mut all_up = true;
        for name in &self.service_names {
            let up = self
                .registry
                .get_service(name, "*")
                .await
                .map(|found| found.iter().any(|s| !s.nodes.is_empty()))
                .unwrap_or(false);
            all_up &= up;
            services.insert(name.clone(), serde_json::Value::Bool(up));
        }
        serde_json::json!({
            "status": if all_up { "ok" } else { "degraded" },
            "services": services,
            "uptime": self.started_at.elapsed().as_secs(),
        })
    }
}

/// HTTP edge fronting RPC backends.
pub struct Gateway {
    core: Arc<GatewayCore>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<dyn Registry>,
        client: Arc<Client>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let mut router = Router::new();
        for route in config.routes {
            router.insert(route);
        }
        let service_names: Vec<String> =
            config.services.iter().map(|s| s.name.clone()).collect();
        let service_configs: HashMap<String, ServiceConfig> = config
            .services
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();

        let mut edge_middleware: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(RequestIdMiddleware),
            Arc::new(LoggingMiddleware),
            Arc::new(TimingMiddleware::new(metrics.clone())),
            Arc::new(ErrorHandlerMiddleware),
            Arc::new(RecoveryMiddleware),
        ];
        if let Some(cors) = config.cors {
            edge_middleware.push(Arc::new(CorsMiddleware::new(cors)));
        }
        edge_middleware.push(Arc::new(CompressionMiddleware::new()));
        if let Some(max) = config.max_request_bytes {
            edge_middleware.push(Arc::new(RequestSizeMiddleware::new(max)));
        }
        edge_middleware.push(Arc::new(TimeoutMiddleware::new(config.default_timeout)));
        if let Some(rate_limit) = config.rate_limit {
            edge_middleware.push(Arc::new(RateLimitMiddleware::new(rate_limit)));
        }
        if let Some(jwt) = config.jwt {
            edge_middleware.push(Arc::new(JwtAuthMiddleware::new(jwt)));
        }

        Gateway {
            core: Arc::new(GatewayCore {
                title: config.title,
                version: config.version,
                address: format!("{}:{}", config.host, config.port),
                default_timeout: config.default_timeout,
                router: RwLock::new(router),
                proxies: DashMap::new(),
                service_configs,
                service_names,
                registry,
                client,
                metrics,
                codecs: Arc::new(CodecRegistry::with_defaults()),
                edge_middleware,
                started_at: Instant::now(),
            }),
        }
    }

    /// Register a route after start-up. Takes the router write lock
    /// briefly.
    pub fn add_route(&self, route: Route) {
        self.core.router.write().unwrap().insert(route);
    }

    /// The router as a dispatcher fallback handler.
    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::new(GatewayHandler {
            core: self.core.clone(),
        })
    }

    /// The gateway's full dispatcher: edge middleware chain with the router
    /// as fallback.
    pub fn dispatcher(&self) -> Dispatcher {
        let mut dispatcher = Dispatcher::new(self.core.codecs.clone());
        for middleware in &self.core.edge_middleware {
            dispatcher = dispatcher.apply(middleware.clone());
        }
        dispatcher.fallback(self.handler())
    }

    /// Wrap the gateway in a server bound to the configured address.
    pub fn server(&self, transport: Arc<dyn Transport>) -> Server {
        Server::new(
            ServerConfig::new("gateway", self.core.address.clone()),
            transport,
            self.dispatcher(),
        )
    }
}

struct GatewayHandler {
    core: Arc<GatewayCore>,
}

#[async_trait]
impl Handler for GatewayHandler {
    async fn call(&self, ctx: &mut Context) -> Result<(), MicroError> {
        let method = ctx
            .request
            .header(headers::HTTP_METHOD)
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let path = format!("/{}", ctx.request.endpoint.trim_matches('/'));

        if method == "GET" {
            match path.as_str() {
                "/health" => {
                    let body = self.core.health().await;
                    write_json(ctx, 200, &body);
                    return Ok(());
                }
                "/metrics" => {
                    ctx.response.status = 200;
                    ctx.response.body = Bytes::from(self.core.metrics.render());
                    ctx.response.content_type = "text/plain; charset=utf-8".to_string();
                    return Ok(());
                }
                "/api/docs" => {
                    let router = self.core.router.read().unwrap();
                    let body =
                        openapi::document(&self.core.title, &self.core.version, router.routes());
                    drop(router);
                    write_json(ctx, 200, &body);
                    return Ok(());
                }
                _ => {}
            }
        }

        let matched = {
            let router = self.core.router.read().unwrap();
            router.lookup(&method, &path)
        };
        let Some(matched) = matched else {
            return Err(MicroError::NotFound(format!("no route for {method} {path}")));
        };
        let route = matched.route;
        debug!(method = %method, path = %path, service = %route.service, "route matched");

        if !route.required_roles.is_empty() {
            let principal = ctx
                .get::<Principal>(PRINCIPAL_KEY)
                .ok_or_else(|| MicroError::Unauthorized("authentication required".into()))?;
            let required = route.required_roles.iter().map(String::as_str);
            if !principal.has_any_role(required) {
                return Err(MicroError::Forbidden("insufficient roles".into()));
            }
        }

        // Path parameters merge into a structured body for the backend.
        if !matched.params.is_empty() {
            let mut value: serde_json::Value = if ctx.request.body.is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_slice(&ctx.request.body)
                    .unwrap_or(serde_json::Value::Null)
            };
            if let serde_json::Value::Object(object) = &mut value {
                for (name, captured) in &matched.params {
                    object.insert(
                        name.clone(),
                        serde_json::Value::String(captured.clone()),
                    );
                }
                ctx.request.body = Bytes::from(value.to_string());
            }
        }

        let invoker = RouteInvoker {
            core: self.core.clone(),
            route: route.clone(),
        };
        Next::new(&route.middleware, &invoker).run(ctx).await
    }
}

/// End of a route's private chain: aggregation fan-out or the service
/// proxy.
struct RouteInvoker {
    core: Arc<GatewayCore>,
    route: Arc<Route>,
}

#[async_trait]
impl Handler for RouteInvoker {
    async fn call(&self, ctx: &mut Context) -> Result<(), MicroError> {
        let response = match &self.route.aggregate {
            Some(spec) => self.core.aggregate(spec, &self.route, &ctx.request).await?,
            None => {
                let proxy = self.core.proxy_for(&self.route.service);
                let body = ctx.request.body.clone();
                proxy.call_route(&self.route, &ctx.request, body).await?
            }
        };
        write_backend_response(ctx, response);
        Ok(())
    }
}

fn write_json(ctx: &mut Context, status: u16, body: &serde_json::Value) {
    ctx.response.status = status;
    ctx.response.body = Bytes::from(body.to_string());
    ctx.response.content_type = "application/json".to_string();
}

fn write_backend_response(ctx: &mut Context, response: TransportResponse) {
    ctx.response.status = response.status;
    ctx.response.body = response.body;
    ctx.response.content_type = response.content_type;
    for (name, value) in &response.headers {
        if name.as_str() == headers::STATUS_CODE
            || name.as_str() == headers::MESSAGE_ID
            || name.as_str() == headers::MESSAGE_TYPE
            || name.as_str() == headers::ENDPOINT
        {
            continue;
        }
        if let Ok(value) = value.to_str() {
            ctx.response.set_header(name.as_str(), value);
        }
    }
    ctx.response.error = response.error;
}
