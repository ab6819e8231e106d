//! Middleware: functions wrapping a handler and the rest of the chain.
//!
//! Each middleware receives the context and a [`Next`] and either runs the
//! remainder of the chain or short-circuits by writing `ctx.response` and
//! not calling it. Errors returned from deeper in the chain are mapped by
//! [`ErrorHandlerMiddleware`]; panics are contained by
//! [`RecoveryMiddleware`].
//!
//! The canonical order is: request_id, logging, timing, error_handler,
//! recovery, cors, compression, request_size, timeout, rate_limit,
//! jwt_auth, then the RBAC guards.

mod auth;
mod compression;
mod cors;
mod errors;
mod limits;
mod observe;
mod rate_limit;

pub use auth::{JwtAuthMiddleware, PermissionGuard, RoleGuard, CLAIMS_KEY, PRINCIPAL_KEY};
pub use compression::CompressionMiddleware;
pub use cors::{CorsConfig, CorsMiddleware};
pub use errors::{ErrorHandlerMiddleware, RecoveryMiddleware};
pub use limits::{RequestSizeMiddleware, TimeoutMiddleware};
pub use observe::{LoggingMiddleware, RequestIdMiddleware, TimingMiddleware};
pub use rate_limit::{RateLimitConfig, RateLimitMiddleware};

use std::sync::Arc;

use async_trait::async_trait;
use micro_core::{Context, MicroError};

use crate::handler::Handler;

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError>;
}

/// The remainder of the chain plus the handler at its end.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], handler: &'a dyn Handler) -> Self {
        Next { chain, handler }
    }

    pub async fn run(mut self, ctx: &mut Context) -> Result<(), MicroError> {
        match self.chain.split_first() {
            Some((first, rest)) => {
                self.chain = rest;
                first.handle(ctx, self).await
            }
            None => self.handler.call(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::raw_fn;
    use micro_core::TransportRequest;

    struct Tag(&'static str);

    #[async_trait]
    impl Middleware for Tag {
        fn name(&self) -> &'static str {
            "tag"
        }

        async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
            let mut trail = ctx.get::<String>("trail").cloned().unwrap_or_default();
            trail.push_str(self.0);
            ctx.set("trail", trail);
            next.run(ctx).await
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        fn name(&self) -> &'static str {
            "short_circuit"
        }

        async fn handle(&self, ctx: &mut Context, _next: Next<'_>) -> Result<(), MicroError> {
            ctx.response.status = 204;
            Ok(())
        }
    }

    #[tokio::test]
    async fn chain_runs_in_order_then_handler() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Tag("a")), Arc::new(Tag("b"))];
        let handler = raw_fn(|ctx| {
            let trail = ctx.get::<String>("trail").cloned().unwrap_or_default();
            ctx.response.status = 200;
            ctx.set("trail", format!("{trail}h"));
            Ok(())
        });

        let mut ctx = Context::new(TransportRequest::new("svc", "op"));
        Next::new(&chain, handler.as_ref()).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.get::<String>("trail").map(String::as_str), Some("abh"));
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(ShortCircuit), Arc::new(Tag("never"))];
        let handler = raw_fn(|ctx| {
            ctx.set("handler_ran", true);
            Ok(())
        });

        let mut ctx = Context::new(TransportRequest::new("svc", "op"));
        Next::new(&chain, handler.as_ref()).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.response.status, 204);
        assert!(ctx.get::<String>("trail").is_none());
        assert!(ctx.get::<bool>("handler_ran").is_none());
    }
}
