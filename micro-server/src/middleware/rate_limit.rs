use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use micro_core::{headers, Context, MicroError};
use tokio::time::Instant;

use super::{Middleware, Next};

/// Fixed-window limits: `limit` requests per `window`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub limit: u64,
    pub window: Duration,
}

struct Window {
    started: Instant,
    count: u64,
}

type KeyFn = Arc<dyn Fn(&Context) -> String + Send + Sync>;

/// Fixed-window counter keyed by a caller-supplied extractor (a single
/// global window by default). On exceed: 429 plus `X-RateLimit-*` headers
/// and `Retry-After`.
pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    windows: DashMap<String, Window>,
    key_fn: KeyFn,
}

impl RateLimitMiddleware {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimitMiddleware {
            config,
            windows: DashMap::new(),
            key_fn: Arc::new(|_| "global".to_string()),
        }
    }

    /// Key windows by something request-derived, e.g. a client id header.
    pub fn with_key_fn(
        mut self,
        key_fn: impl Fn(&Context) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_fn = Arc::new(key_fn);
        self
    }

    /// Count this request against its window. Returns the remaining budget,
    /// or the seconds to wait when the window is exhausted.
    fn admit(&self, key: String) -> Result<u64, u64> {
        let now = Instant::now();
        let mut window = self.windows.entry(key).or_insert_with(|| Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= self.config.window {
            window.started = now;
            window.count = 0;
        }
        if window.count >= self.config.limit {
            let elapsed = now.duration_since(window.started);
            let retry_after = self
                .config
                .window
                .saturating_sub(elapsed)
                .as_secs()
                .max(1);
            return Err(retry_after);
        }
        window.count += 1;
        Ok(self.config.limit - window.count)
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        let key = (self.key_fn)(ctx);
        let limit = self.config.limit.to_string();
        match self.admit(key) {
            Ok(remaining) => {
                ctx.response.set_header(headers::RATE_LIMIT_LIMIT, &limit);
                ctx.response
                    .set_header(headers::RATE_LIMIT_REMAINING, &remaining.to_string());
                next.run(ctx).await
            }
            Err(retry_after) => {
                ctx.response.set_header(headers::RATE_LIMIT_LIMIT, &limit);
                ctx.response.set_header(headers::RATE_LIMIT_REMAINING, "0");
                ctx.response
                    .set_header(headers::RETRY_AFTER, &retry_after.to_string());
                Err(MicroError::RateLimit {
                    message: "rate limit exceeded".into(),
                    retry_after,
                })
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

    fn limited_chain(limit: u64, window: Duration) -> Vec<Arc<dyn Middleware>> {
        vec![
            Arc::new(ErrorHandlerMiddleware),
            Arc::new(RateLimitMiddleware::new(RateLimitConfig { limit, window })),
        ]
    }

    async fn fire(chain: &[Arc<dyn Middleware>]) -> Context {
        let handler = raw_fn(|ctx| {
            ctx.response.status = 200;
            Ok(())
        });
        let mut ctx = Context::new(TransportRequest::new("svc", "op"));
        Next::new(chain, handler.as_ref()).run(&mut ctx).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn excess_requests_get_429_with_headers() {
        let chain = limited_chain(2, Duration::from_millis(200));

        let first = fire(&chain).await;
        assert_eq!(first.response.status, 200);
        assert_eq!(first.response.header(headers::RATE_LIMIT_REMAINING), Some("1"));

        let second = fire(&chain).await;
        assert_eq!(second.response.status, 200);
        assert_eq!(second.response.header(headers::RATE_LIMIT_REMAINING), Some("0"));

        let third = fire(&chain).await;
        assert_eq!(third.response.status, 429);
        assert_eq!(third.response.header(headers::RATE_LIMIT_REMAINING), Some("0"));
        assert!(third.response.header(headers::RETRY_AFTER).is_some());
        let body: serde_json::Value = serde_json::from_slice(&third.response.body).unwrap();
        assert_eq!(body["type"], "RateLimitError");
        assert!(body["retry_after"].as_u64().is_some());
    }

    #[tokio::test]
    async fn window_resets_after_elapse() {
        let chain = limited_chain(2, Duration::from_millis(200));
        for _ in 0..2 {
            assert_eq!(fire(&chain).await.response.status, 200);
        }
        assert_eq!(fire(&chain).await.response.status, 429);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fire(&chain).await.response.status, 200);
    }

    #[tokio::test]
    async fn keys_have_independent_windows() {
        let limiter = RateLimitMiddleware::new(RateLimitConfig {
            limit: 1,
            window: Duration::from_secs(60),
        })
        .with_key_fn(|ctx| ctx.request.endpoint.clone());
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(ErrorHandlerMiddleware), Arc::new(limiter)];
        let handler = raw_fn(|ctx| {
            ctx.response.status = 200;
            Ok(())
        });

        for endpoint in ["a", "b"] {
            let mut ctx = Context::new(TransportRequest::new("svc", endpoint));
            Next::new(&chain, handler.as_ref()).run(&mut ctx).await.unwrap();
            assert_eq!(ctx.response.status, 200, "{endpoint}");
        }
        // Second hit on an exhausted key is limited.
        let mut ctx = Context::new(TransportRequest::new("svc", "a"));
        Next::new(&chain, handler.as_ref()).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.response.status, 429);
    }
}
