//! Pluggable connection health checks.
//!
//! A health check has its own small budget (attempts, spacing, per-attempt
//! timeout) independent of any caller timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use micro_core::{headers, Message};
use micro_transport::Socket;

#[derive(Debug, Clone)]
pub struct HealthCheckBudget {
    pub attempts: u32,
    pub backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for HealthCheckBudget {
    fn default() -> Self {
        HealthCheckBudget {
            attempts: 3,
            backoff: Duration::from_millis(200),
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

/// Decides whether a pooled socket is still usable.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, socket: &mut dyn Socket) -> bool;
}

/// Cheapest strategy: the socket merely has to be open.
pub struct LivenessCheck;

#[async_trait]
impl HealthCheck for LivenessCheck {
    async fn check(&self, socket: &mut dyn Socket) -> bool {
        !socket.is_closed()
    }
}

/// Probe the peer's health endpoint with a HEAD-style exchange. Any reply
/// below 500 counts as healthy; the point is that the peer answers at all.
pub struct HttpHealthCheck {
    endpoint: String,
    budget: HealthCheckBudget,
}

impl HttpHealthCheck {
    pub fn new() -> Self {
        HttpHealthCheck {
            endpoint: "health".to_string(),
            budget: HealthCheckBudget::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_budget(mut self, budget: HealthCheckBudget) -> Self {
        self.budget = budget;
        self
    }
}

impl Default for HttpHealthCheck {
    fn default() -> Self {
        HttpHealthCheck::new()
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self, socket: &mut dyn Socket) -> bool {
        let make = || {
            let mut msg = Message::request("", self.endpoint.clone(), Bytes::new());
            msg.set_header(headers::HTTP_METHOD, "HEAD");
            msg
        };
        probe(socket, make, &self.budget).await
    }
}

/// Round-trip an RPC ping message.
pub struct PingHealthCheck {
    budget: HealthCheckBudget,
}

impl PingHealthCheck {
    pub fn new() -> Self {
        PingHealthCheck {
            budget: HealthCheckBudget::default(),
        }
    }

    pub fn with_budget(mut self, budget: HealthCheckBudget) -> Self {
        self.budget = budget;
        self
    }
}

impl Default for PingHealthCheck {
    fn default() -> Self {
        PingHealthCheck::new()
    }
}

#[async_trait]
impl HealthCheck for PingHealthCheck {
    async fn check(&self, socket: &mut dyn Socket) -> bool {
        probe(socket, || Message::request("", "ping", Bytes::new()), &self.budget).await
    }
}

async fn probe<F>(socket: &mut dyn Socket, make: F, budget: &HealthCheckBudget) -> bool
where
    F: Fn() -> Message,
{
    for attempt in 0..budget.attempts {
        if attempt > 0 {
            tokio::time::sleep(budget.backoff).await;
        }
        if socket.is_closed() || socket.send(make()).await.is_err() {
            continue;
        }
        match socket.recv_timeout(budget.attempt_timeout).await {
            Ok(Some(reply)) => return reply.status().map(|s| s < 500).unwrap_or(true),
            Ok(None) | Err(_) => continue,
        }
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    /// Healthy iff every sub-check passes.
    All,
    /// Healthy iff at least one sub-check passes.
    Any,
}

/// AND/OR combination of sub-strategies, evaluated in order.
pub struct CompositeHealthCheck {
    checks: Vec<Arc<dyn HealthCheck>>,
    mode: CompositeMode,
}

impl CompositeHealthCheck {
    pub fn new(mode: CompositeMode) -> Self {
        CompositeHealthCheck {
            checks: Vec::new(),
            mode,
        }
    }

    pub fn with(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }
}

#[async_trait]
impl HealthCheck for CompositeHealthCheck {
    async fn check(&self, socket: &mut dyn Socket) -> bool {
        match self.mode {
            CompositeMode::All => {
                for check in &self.checks {
                    if !check.check(socket).await {
                        return false;
                    }
                }
                true
            }
            CompositeMode::Any => {
                for check in &self.checks {
                    if check.check(socket).await {
                        return true;
                    }
                }
                false
            }
        }
    }
}
