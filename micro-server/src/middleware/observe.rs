use std::sync::Arc;

use async_trait::async_trait;
use micro_core::{headers, Context, MicroError};
use micro_metrics::MetricsCollector;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Middleware, Next};

/// Generate or propagate the correlation id header.
pub struct RequestIdMiddleware;

#[async_trait]
impl Middleware for RequestIdMiddleware {
    fn name(&self) -> &'static str {
        "request_id"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        let id = match ctx.request.header(headers::REQUEST_ID) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                ctx.request.set_header(headers::REQUEST_ID, &id);
                id
            }
        };
        ctx.set("request_id", id.clone());
        let result = next.run(ctx).await;
        ctx.response.set_header(headers::REQUEST_ID, &id);
        result
    }
}

/// Structured request/response logging.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        debug!(
            service = %ctx.request.service,
            endpoint = %ctx.request.endpoint,
            "request received"
        );
        let result = next.run(ctx).await;
        match &result {
            Ok(()) => info!(
                service = %ctx.request.service,
                endpoint = %ctx.request.endpoint,
                status = ctx.response.status,
                "request handled"
            ),
            Err(err) => info!(
                service = %ctx.request.service,
                endpoint = %ctx.request.endpoint,
                error = %err,
                "request failed"
            ),
        }
        result
    }
}

/// Wall-clock measurement, recorded as a metric and a response header.
pub struct TimingMiddleware {
    metrics: Arc<MetricsCollector>,
}

impl TimingMiddleware {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        TimingMiddleware { metrics }
    }
}

#[async_trait]
impl Middleware for TimingMiddleware {
    fn name(&self) -> &'static str {
        "timing"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        let started = Instant::now();
        let result = next.run(ctx).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.observe(
            "request_duration_ms",
            &[
                ("service", ctx.request.service.as_str()),
                ("endpoint", ctx.request.endpoint.as_str()),
            ],
            elapsed_ms,
        );
        ctx.response
            .set_header(headers::RESPONSE_TIME, &format!("{elapsed_ms:.1}ms"));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::raw_fn;
    use micro_core::TransportRequest;

    #[tokio::test]
    async fn request_id_is_generated_and_echoed() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(RequestIdMiddleware)];
        let handler = raw_fn(|_ctx| Ok(()));
        let mut ctx = Context::new(TransportRequest::new("svc", "op"));
        Next::new(&chain, handler.as_ref()).run(&mut ctx).await.unwrap();

        let id = ctx.get::<String>("request_id").unwrap().clone();
        assert!(!id.is_empty());
        assert_eq!(ctx.response.header(headers::REQUEST_ID), Some(id.as_str()));
    }

    #[tokio::test]
    async fn request_id_is_propagated_when_present() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(RequestIdMiddleware)];
        let handler = raw_fn(|_ctx| Ok(()));
        let mut request = TransportRequest::new("svc", "op");
        request.set_header(headers::REQUEST_ID, "req-123");
        let mut ctx = Context::new(request);
        Next::new(&chain, handler.as_ref()).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.response.header(headers::REQUEST_ID), Some("req-123"));
    }

    #[tokio::test]
    async fn timing_records_metric_and_header() {
        let metrics = Arc::new(MetricsCollector::new());
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(TimingMiddleware::new(metrics.clone()))];
        let handler = raw_fn(|_ctx| Ok(()));
        let mut ctx = Context::new(TransportRequest::new("svc", "op"));
        Next::new(&chain, handler.as_ref()).run(&mut ctx).await.unwrap();

        assert!(ctx.response.header(headers::RESPONSE_TIME).is_some());
        let labels = [("service", "svc"), ("endpoint", "op")];
        assert!(metrics.counter_value("request_duration_ms", &labels) == 0.0);
        // One observation recorded.
        assert!(metrics.average("request_duration_ms", &labels) >= 0.0);
    }
}
