use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use micro_core::{Context, MicroError};
use tracing::{error, warn};

use super::{Middleware, Next};
use crate::dispatcher::apply_error;

/// Authoritative error-to-status mapping: semantic errors thrown deeper in
/// the chain become structured responses here.
pub struct ErrorHandlerMiddleware;

#[async_trait]
impl Middleware for ErrorHandlerMiddleware {
    fn name(&self) -> &'static str {
        "error_handler"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        if let Err(err) = next.run(ctx).await {
            warn!(
                endpoint = %ctx.request.endpoint,
                kind = err.kind(),
                "handler error"
            );
            apply_error(&mut ctx.response, err);
        }
        Ok(())
    }
}

/// Last-resort catch: a panic anywhere below becomes a generic 500. Nothing
/// a handler does may take the worker down.
pub struct RecoveryMiddleware;

#[async_trait]
impl Middleware for RecoveryMiddleware {
    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                error!(endpoint = %ctx.request.endpoint, detail = %detail, "handler panicked");
                apply_error(
                    &mut ctx.response,
                    MicroError::Internal("internal server error".into()),
                );
                Ok(())
            }
        }
    }
}
