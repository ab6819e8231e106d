use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use micro_core::{headers, Context, MicroError};

use super::{Middleware, Next};

/// Reject requests whose declared or actual body size exceeds the limit.
pub struct RequestSizeMiddleware {
    max_bytes: usize,
}

impl RequestSizeMiddleware {
    pub fn new(max_bytes: usize) -> Self {
        RequestSizeMiddleware { max_bytes }
    }
}

#[async_trait]
impl Middleware for RequestSizeMiddleware {
    fn name(&self) -> &'static str {
        "request_size"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        let declared = ctx
            .request
            .header(headers::CONTENT_LENGTH)
            .and_then(|v| v.parse::<usize>().ok());
        let size = declared.unwrap_or(ctx.request.body.len());
        if size > self.max_bytes {
            // 413 sits outside the semantic taxonomy; write it directly.
            let body = serde_json::json!({
                "error": format!("request body of {size} bytes exceeds limit of {} bytes", self.max_bytes),
                "type": "PayloadTooLargeError",
            });
            ctx.response.status = 413;
            ctx.response.body = Bytes::from(body.to_string());
            ctx.response.content_type = "application/json".to_string();
            return Ok(());
        }
        next.run(ctx).await
    }
}

/// Race the downstream chain against a deadline; 504 on expiry.
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        TimeoutMiddleware { timeout }
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        // The caller's own deadline wins when tighter.
        let deadline = match ctx.request.timeout {
            Some(requested) if requested < self.timeout => requested,
            _ => self.timeout,
        };
        let cancel = ctx.cancellation();
        match tokio::time::timeout(deadline, next.run(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(MicroError::Timeout(format!(
                    "request exceeded {}ms",
                    deadline.as_millis()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::raw_fn;
    use crate::middleware::ErrorHandlerMiddleware;
    use micro_core::TransportRequest;
    use std::sync::Arc;

    #[tokio::test]
    async fn oversized_request_is_413() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(RequestSizeMiddleware::new(8))];
        let handler = raw_fn(|ctx| {
            ctx.set("handler_ran", true);
            Ok(())
        });
        let request = TransportRequest::new("svc", "op")
            .with_body(Bytes::from_static(b"way more than eight bytes"));
        let mut ctx = Context::new(request);
        Next::new(&chain, handler.as_ref()).run(&mut ctx).await.unwrap();

        assert_eq!(ctx.response.status, 413);
        assert!(ctx.get::<bool>("handler_ran").is_none());
        let body: serde_json::Value = serde_json::from_slice(&ctx.response.body).unwrap();
        assert_eq!(body["type"], "PayloadTooLargeError");
    }

    #[tokio::test]
    async fn declared_content_length_is_authoritative() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(RequestSizeMiddleware::new(8))];
        let handler = raw_fn(|_ctx| Ok(()));
        let mut request = TransportRequest::new("svc", "op");
        request.set_header(headers::CONTENT_LENGTH, "4096");
        let mut ctx = Context::new(request);
        Next::new(&chain, handler.as_ref()).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.response.status, 413);
    }

    struct Sleeper(Duration);

    #[async_trait]
    impl Middleware for Sleeper {
        fn name(&self) -> &'static str {
            "sleeper"
        }

        async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
            tokio::time::sleep(self.0).await;
            next.run(ctx).await
        }
    }

    #[tokio::test]
    async fn expiry_maps_to_504_with_structured_body() {
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(ErrorHandlerMiddleware),
            Arc::new(TimeoutMiddleware::new(Duration::from_millis(20))),
            Arc::new(Sleeper(Duration::from_millis(200))),
        ];
        let handler = raw_fn(|_ctx| Ok(()));
        let mut ctx = Context::new(TransportRequest::new("svc", "op"));
        Next::new(&chain, handler.as_ref()).run(&mut ctx).await.unwrap();

        assert_eq!(ctx.response.status, 504);
        assert!(ctx.is_cancelled());
        let body: serde_json::Value = serde_json::from_slice(&ctx.response.body).unwrap();
        assert_eq!(body["type"], "TimeoutError");
    }

    #[tokio::test]
    async fn fast_requests_pass_through() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(TimeoutMiddleware::new(Duration::from_millis(200)))];
        let handler = raw_fn(|ctx| {
            ctx.response.status = 200;
            Ok(())
        });
        let mut ctx = Context::new(TransportRequest::new("svc", "op"));
        Next::new(&chain, handler.as_ref()).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.response.status, 200);
        assert!(!ctx.is_cancelled());
    }
}
