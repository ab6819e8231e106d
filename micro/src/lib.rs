//! The micro toolkit: a cohesive runtime for services that expose named
//! RPC methods and for gateways that front them over HTTP.
//!
//! The subsystem crates re-exported here can also be used individually:
//!
//! - [`core`]: messages, codecs, request context, error taxonomy,
//!   configuration
//! - [`transport`]: framed HTTP/1, HTTP/2 streams, WebSocket, and loopback
//! - [`registry`]: service discovery with memory and Consul back-ends
//! - [`pool`]: per-address connection pooling with health checks
//! - [`auth`]: JWT validation and role/permission checks
//! - [`broker`]: pub/sub contract with an in-process broker
//! - [`server`]: dispatcher, middleware chain, and the RPC server
//! - [`client`]: discovery-driven calls with retries and circuit breaking
//! - [`gateway`]: the HTTP edge with radix routing and aggregation

pub use micro_auth as auth;
pub use micro_broker as broker;
pub use micro_client as client;
pub use micro_core as core;
pub use micro_gateway as gateway;
pub use micro_metrics as metrics;
pub use micro_pool as pool;
pub use micro_registry as registry;
pub use micro_server as server;
pub use micro_transport as transport;

pub use micro_auth::{JwtConfig, JwtValidator, Permission, Principal, Role, RoleRegistry};
pub use micro_broker::{Broker, MemoryBroker};
pub use micro_client::{Client, ClientConfig, RetryPolicy};
pub use micro_core::{
    init_tracing, Context, Message, MessageType, MicroError, RuntimeConfig, TransportRequest,
    TransportResponse,
};
pub use micro_gateway::{Gateway, GatewayConfig, Route, ServiceConfig, Transformation};
pub use micro_metrics::MetricsCollector;
pub use micro_pool::{Pool, PoolConfig};
pub use micro_registry::{MemoryRegistry, Node, Registry, Service};
pub use micro_server::{method_fn, Dispatcher, Server, ServerConfig};
pub use micro_transport::{
    HttpTransport, Http2Transport, LoopbackTransport, Transport, WebSocketTransport,
};
