//! Per-address circuit breaker.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of most recent call outcomes considered.
    pub window: usize,
    /// Failure ratio over the window that trips the breaker.
    pub failure_ratio: f64,
    /// No tripping before this many outcomes are recorded.
    pub min_calls: usize,
    /// Time in `Open` before a half-open probe is allowed.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            window: 20,
            failure_ratio: 0.5,
            min_calls: 10,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_inflight: bool,
}

/// Three-state failure detector: `Closed -> Open` when the failure ratio
/// over the sliding window crosses the threshold, `Open -> HalfOpen` after
/// the cooldown, one successful probe closes it again.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                probe_inflight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// May a call proceed right now? While `Open`, callers short-circuit
    /// without dialing; in `HalfOpen` exactly one probe is admitted.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_inflight = true;
                    debug!("circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_inflight {
                    false
                } else {
                    inner.probe_inflight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                debug!("probe succeeded, closing circuit");
                inner.state = BreakerState::Closed;
                inner.outcomes.clear();
                inner.opened_at = None;
                inner.probe_inflight = false;
            }
            _ => self.push_outcome(&mut inner, true),
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                debug!("probe failed, reopening circuit");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_inflight = false;
            }
            BreakerState::Closed => {
                self.push_outcome(&mut inner, false);
                let total = inner.outcomes.len();
                if total >= self.config.min_calls {
                    let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
                    if failures as f64 / total as f64 >= self.config.failure_ratio {
                        debug!(failures, total, "failure ratio crossed, opening circuit");
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, ok: bool) {
        inner.outcomes.push_back(ok);
        while inner.outcomes.len() > self.config.window {
            inner.outcomes.pop_front();
        }
    }
}
