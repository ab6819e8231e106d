//! Thread-safe connection pool.
//!
//! Amortizes connection cost and bounds resource use per remote address.
//! Every mutation of the idle list and counters happens under one mutex;
//! long-running work (dialing, health-check I/O) runs outside it with the
//! inflight counter held across the gap, so `idle + in_use + inflight`
//! never exceeds `max_size`.

pub mod health;

pub use health::{
    CompositeHealthCheck, CompositeMode, HealthCheck, HealthCheckBudget, HttpHealthCheck,
    LivenessCheck, PingHealthCheck,
};

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use micro_core::MicroError;
use micro_metrics::MetricsCollector;
use micro_transport::{DialOptions, Socket, Transport, TransportError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub max_idle: usize,
    pub acquire_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub health_check_enabled: bool,
    pub health_check_interval: Duration,
    pub metrics_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_size: 10,
            max_idle: 5,
            acquire_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(30 * 60),
            idle_timeout: Duration::from_secs(5 * 60),
            health_check_enabled: true,
            health_check_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(10),
        }
    }
}

pub enum PoolError {
    /// `acquire` could not produce a connection before `acquire_timeout`.
    AcquireTimeout,
    /// The pool has been closed.
    Closed,
    Dial(TransportError),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::AcquireTimeout => write!(f, "pool acquire timed out"),
            PoolError::Closed => write!(f, "pool is closed"),
            PoolError::Dial(e) => write!(f, "dial failed: {e}"),
        }
    }
}

impl std::fmt::Debug for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for PoolError {}

impl From<PoolError> for MicroError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Dial(e) => e.into(),
            other => MicroError::ServiceUnavailable(other.to_string()),
        }
    }
}

/// A connection owned either by the pool (idle) or by one caller (in use).
pub struct PooledConnection {
    pub id: u64,
    socket: Box<dyn Socket>,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
}

impl PooledConnection {
    pub fn socket(&mut self) -> &mut dyn Socket {
        self.socket.as_mut()
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn eligible(&self, config: &PoolConfig) -> bool {
        !self.socket.is_closed()
            && self.created_at.elapsed() < config.max_lifetime
            && self.last_used_at.elapsed() < config.idle_timeout
    }

    async fn shutdown(mut self, metrics: &MetricsCollector, addr: &str) {
        metrics.observe(
            "pool_connection_lifetime_ms",
            &[("addr", addr)],
            self.created_at.elapsed().as_millis() as f64,
        );
        metrics.observe(
            "pool_connection_use_count",
            &[("addr", addr)],
            self.use_count as f64,
        );
        self.socket.close().await.ok();
    }
}

#[derive(Default)]
struct PoolInner {
    idle: VecDeque<PooledConnection>,
    in_use: usize,
    /// Connections being created or health-checked outside the lock.
    inflight: usize,
}

impl PoolInner {
    fn tracked(&self) -> usize {
        self.idle.len() + self.in_use + self.inflight
    }
}

enum Step {
    Reuse(Box<PooledConnection>),
    Create,
    Wait,
}

/// Bounded set of reusable sockets for one remote address.
pub struct Pool {
    transport: Arc<dyn Transport>,
    addr: String,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    released: Notify,
    closed: AtomicBool,
    stop: CancellationToken,
    next_id: AtomicU64,
    health_check: Arc<dyn HealthCheck>,
    metrics: Arc<MetricsCollector>,
}

impl Pool {
    /// Create a pool and start its background pruning and metrics workers.
    pub fn new(
        transport: Arc<dyn Transport>,
        addr: impl Into<String>,
        config: PoolConfig,
        health_check: Arc<dyn HealthCheck>,
        metrics: Arc<MetricsCollector>,
    ) -> Arc<Pool> {
        let pool = Arc::new(Pool {
            transport,
            addr: addr.into(),
            inner: Mutex::new(PoolInner::default()),
            released: Notify::new(),
            closed: AtomicBool::new(false),
            stop: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            health_check,
            metrics,
            config,
        });
        if pool.config.health_check_enabled {
            spawn_interval(
                Arc::downgrade(&pool),
                pool.config.health_check_interval,
                pool.stop.clone(),
                |pool| async move { pool.prune().await },
            );
        }
        spawn_interval(
            Arc::downgrade(&pool),
            pool.config.metrics_interval,
            pool.stop.clone(),
            |pool| async move { pool.record_gauges() },
        );
        pool
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Get a connection: an eligible idle one, a freshly dialed one when
    /// under `max_size`, or after waiting for a release until
    /// `acquire_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let labels = [("addr", self.addr.as_str())];
        self.metrics
            .inc_counter("pool_acquisitions_total", &labels, 1.0);

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PoolError::Closed);
            }

            let mut evicted = Vec::new();
            let step = {
                let mut inner = self.inner.lock().unwrap();
                let mut step = Step::Wait;
                while let Some(mut conn) = inner.idle.pop_front() {
                    if conn.eligible(&self.config) {
                        conn.use_count += 1;
                        conn.last_used_at = Instant::now();
                        inner.in_use += 1;
                        step = Step::Reuse(Box::new(conn));
                        break;
                    }
                    evicted.push(conn);
                }
                if matches!(step, Step::Wait) && inner.tracked() < self.config.max_size {
                    inner.inflight += 1;
                    step = Step::Create;
                }
                step
            };
            for conn in evicted {
                conn.shutdown(&self.metrics, &self.addr).await;
            }

            match step {
                Step::Reuse(conn) => return Ok(*conn),
                Step::Create => return self.create(deadline).await,
                Step::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.metrics
                            .inc_counter("pool_acquire_timeouts_total", &labels, 1.0);
                        return Err(PoolError::AcquireTimeout);
                    }
                    if tokio::time::timeout(deadline - now, self.released.notified())
                        .await
                        .is_err()
                    {
                        self.metrics
                            .inc_counter("pool_acquire_timeouts_total", &labels, 1.0);
                        return Err(PoolError::AcquireTimeout);
                    }
                }
            }
        }
    }

    /// Dial a new connection. The caller has already incremented `inflight`.
    async fn create(&self, deadline: Instant) -> Result<PooledConnection, PoolError> {
        let labels = [("addr", self.addr.as_str())];
        let opts = DialOptions {
            connect_timeout: Some(deadline.saturating_duration_since(Instant::now())),
            ..Default::default()
        };
        let started = Instant::now();
        let result = self.transport.dial(&self.addr, opts).await;
        self.metrics.observe(
            "pool_creation_duration_ms",
            &labels,
            started.elapsed().as_millis() as f64,
        );
        self.metrics.inc_counter("pool_creations_total", &labels, 1.0);

        match result {
            Ok(socket) => {
                let conn = PooledConnection {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    socket,
                    created_at: Instant::now(),
                    last_used_at: Instant::now(),
                    use_count: 1,
                };
                let mut inner = self.inner.lock().unwrap();
                inner.inflight -= 1;
                inner.in_use += 1;
                Ok(conn)
            }
            Err(e) => {
                self.metrics
                    .inc_counter("pool_creation_failures_total", &labels, 1.0);
                self.metrics
                    .inc_counter("pool_acquire_errors_total", &labels, 1.0);
                self.inner.lock().unwrap().inflight -= 1;
                // Capacity freed; wake one waiter.
                self.released.notify_one();
                Err(PoolError::Dial(e))
            }
        }
    }

    /// Return a connection. It re-enters the idle set iff it still validates
    /// and there is idle room; otherwise it is closed. Either way one waiter
    /// is signalled.
    pub async fn release(&self, mut conn: PooledConnection) {
        let mut to_close = None;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.in_use = inner.in_use.saturating_sub(1);
            let valid = !self.closed.load(Ordering::SeqCst)
                && !conn.socket.is_closed()
                && conn.created_at.elapsed() < self.config.max_lifetime;
            if valid && inner.idle.len() < self.config.max_idle {
                conn.last_used_at = Instant::now();
                inner.idle.push_back(conn);
            } else {
                to_close = Some(conn);
            }
        }
        if let Some(conn) = to_close {
            conn.shutdown(&self.metrics, &self.addr).await;
        }
        self.released.notify_one();
    }

    /// Run the configured health check over every idle connection, dropping
    /// the ones that fail.
    pub async fn prune(&self) {
        let labels = [("addr", self.addr.as_str())];
        let candidates: Vec<PooledConnection> = {
            let mut inner = self.inner.lock().unwrap();
            let count = inner.idle.len();
            inner.inflight += count;
            inner.idle.drain(..).collect()
        };
        let taken = candidates.len();

        let mut healthy = Vec::new();
        for mut conn in candidates {
            let started = Instant::now();
            let ok = conn.eligible(&self.config)
                && self.health_check.check(conn.socket.as_mut()).await;
            self.metrics
                .inc_counter("pool_health_checks_total", &labels, 1.0);
            self.metrics.observe(
                "pool_health_check_duration_ms",
                &labels,
                started.elapsed().as_millis() as f64,
            );
            if ok {
                healthy.push(conn);
            } else {
                self.metrics
                    .inc_counter("pool_health_check_failures_total", &labels, 1.0);
                debug!(addr = %self.addr, id = conn.id, "pruning unhealthy connection");
                conn.shutdown(&self.metrics, &self.addr).await;
            }
        }

        let mut overflow = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.inflight -= taken;
            for conn in healthy {
                if !self.closed.load(Ordering::SeqCst)
                    && inner.idle.len() < self.config.max_idle
                {
                    inner.idle.push_back(conn);
                } else {
                    overflow.push(conn);
                }
            }
        }
        for conn in overflow {
            conn.shutdown(&self.metrics, &self.addr).await;
        }
    }

    /// Shut down: stop background workers, close every idle connection, and
    /// wake all waiters. Idempotent. Connections currently in use are closed
    /// as they are released.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.cancel();
        let conns: Vec<PooledConnection> = {
            let mut inner = self.inner.lock().unwrap();
            inner.idle.drain(..).collect()
        };
        for conn in conns {
            conn.shutdown(&self.metrics, &self.addr).await;
        }
        self.released.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current `(idle, in_use, inflight)` counters.
    pub fn stats(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.idle.len(), inner.in_use, inner.inflight)
    }

    fn record_gauges(&self) {
        let inner = self.inner.lock().unwrap();
        let labels = [("addr", self.addr.as_str())];
        self.metrics
            .set_gauge("pool_idle", &labels, inner.idle.len() as f64);
        self.metrics
            .set_gauge("pool_active", &labels, inner.in_use as f64);
        self.metrics
            .set_gauge("pool_creating", &labels, inner.inflight as f64);
        self.metrics
            .set_gauge("pool_total", &labels, inner.tracked() as f64);
    }
}

fn spawn_interval<F, Fut>(
    pool: Weak<Pool>,
    interval: Duration,
    stop: CancellationToken,
    work: F,
) where
    F: Fn(Arc<Pool>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let Some(pool) = pool.upgrade() else { break };
            work(pool).await;
        }
    });
}
