//! Per-provider circuit breaker.
//!
//! CLOSED admits everything and counts consecutive failures inside a
//! rolling window. Hitting the threshold opens the circuit; while OPEN,
//! calls are rejected without touching the provider. After the cooldown
//! the circuit goes HALF_OPEN and admits a bounded number of probes: any
//! probe failure reopens it, enough consecutive probe successes close it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failures_to_open: u32,
    /// Rolling window the failure streak must fit inside.
    pub failure_window: Duration,
    /// How long the circuit stays open before probing.
    pub cooldown: Duration,
    /// Probe requests admitted while half-open.
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failures_to_open: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_probes: 2,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Rejecting calls until the cooldown elapses.
    Open,
    /// Admitting a bounded number of probes.
    HalfOpen,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    streak_started_at: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_probes_remaining: u32,
    half_open_successes: u32,
}

/// Circuit breaker for one provider.
///
/// One of these lives in each [`crate::ProviderEndpoint`]; the mutex
/// guards a handful of integers, so critical sections are short and
/// never held across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                streak_started_at: None,
                opened_at: None,
                half_open_probes_remaining: 0,
                half_open_successes: 0,
            }),
        }
    }

    /// Ask to admit a call. Returns `false` when the circuit rejects it.
    ///
    /// An open circuit whose cooldown has elapsed transitions to
    /// half-open here and admits the call as a probe.
    #[must_use]
    pub fn try_admit(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit lock");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.cooldown);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_probes_remaining = self.config.half_open_probes;
                    inner.half_open_successes = 0;
                    tracing::debug!("circuit half-open, admitting probe");
                    inner.half_open_probes_remaining -= 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probes_remaining > 0 {
                    inner.half_open_probes_remaining -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit lock");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.streak_started_at = None;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_probes {
                    tracing::debug!("circuit closed after successful probes");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.streak_started_at = None;
                    inner.opened_at = None;
                }
            }
            // A late success from a call admitted before the circuit
            // opened; the cooldown decides, not this call.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit lock");
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                let streak_expired = inner
                    .streak_started_at
                    .is_some_and(|at| now.duration_since(at) > self.config.failure_window);
                if streak_expired || inner.streak_started_at.is_none() {
                    inner.streak_started_at = Some(now);
                    inner.consecutive_failures = 0;
                }
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failures_to_open {
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "circuit opened after consecutive failures"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("probe failed, circuit reopened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Snapshot of the current state (cooldown transitions are applied
    /// lazily in [`try_admit`](Self::try_admit), so an elapsed-cooldown
    /// circuit still reports `Open` here until the next admission check).
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit lock").state
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
