//! API gateway: radix routing over RPC backends with per-route policies,
//! response transformations, parallel aggregation, and the built-in
//! `/health`, `/metrics`, and `/api/docs` endpoints.

pub mod config;
pub mod gateway;
pub mod openapi;
pub mod proxy;
pub mod router;
pub mod transform;

pub use config::{GatewayConfig, ServiceConfig};
pub use gateway::Gateway;
pub use proxy::ServiceProxy;
pub use router::{AggregateBackend, PartialFailure, Route, RouteMatch, Router};
pub use transform::Transformation;
