//! Circuit breaker guarding calls to a flaky downstream dependency
//!
//! ```text
//!            failures >= threshold            recovery_timeout elapsed
//!   CLOSED ─────────────────────────▶ OPEN ─────────────────────────▶ HALF_OPEN
//!     ▲                                 ▲                                 │
//!     │            probe succeeds       │          probe fails            │
//!     └─────────────────────────────────┼─────────────────────────────────┘
//!                                       └─────────────────────────────────┘
//! ```
//!
//! While OPEN every call is rejected without invoking the wrapped function.
//! In HALF_OPEN exactly one call is admitted as a probe and its outcome alone
//! decides the next state. The state lock is held for admission and for
//! recording the outcome, never across the guarded call itself.

use crate::RuntimeError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted
    Closed,
    /// Calls are rejected until the recovery timeout elapses
    Open,
    /// A single probe call decides whether to close or re-open
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Result of a guarded call
#[derive(Debug)]
pub enum CallOutcome<T, E> {
    /// The call ran and succeeded
    Ok(T),
    /// The call was rejected without running
    CircuitOpen,
    /// The call ran and failed
    Failed(E),
}

impl<T, E> CallOutcome<T, E> {
    /// Whether the call ran and succeeded
    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Ok(_))
    }

    /// Whether the call was rejected by an open circuit
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallOutcome::CircuitOpen)
    }

    /// The success value, if any
    pub fn ok(self) -> Option<T> {
        match self {
            CallOutcome::Ok(value) => Some(value),
            _ => None,
        }
    }
}

impl<T, E: fmt::Display> CallOutcome<T, E> {
    /// Collapse into a `Result`, keeping rejections distinguishable
    pub fn into_result(self) -> Result<T, RuntimeError> {
        match self {
            CallOutcome::Ok(value) => Ok(value),
            CallOutcome::CircuitOpen => Err(RuntimeError::CircuitOpen),
            CallOutcome::Failed(error) => Err(RuntimeError::task_failed(error)),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    probe_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
    times_opened: u64,
}

/// Per-call guard against cascading failure
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: Arc<Mutex<BreakerState>>,
}

/// Marks an admitted call; a probe that is dropped unfinished frees its slot
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    finished: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probe && !self.finished {
            let mut state = self.breaker.state.lock();
            if state.state == CircuitState::HalfOpen {
                state.probe_in_flight = false;
            }
            debug!(breaker = %self.breaker.name, "Half-open probe cancelled before completion");
        }
    }
}

impl CircuitBreaker {
    /// Create a breaker that opens after `failure_threshold` consecutive
    /// failures and probes again after `recovery_timeout`
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: Arc::from("default"),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                probe_in_flight: false,
                total_calls: 0,
                total_failures: 0,
                total_rejections: 0,
                times_opened: 0,
            })),
        }
    }

    /// Name used in log events
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Arc::from(name.into());
        self
    }

    /// Current state
    ///
    /// An OPEN breaker whose recovery timeout has elapsed still reports OPEN
    /// until the next call is admitted as the probe.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Consecutive failures counted so far
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            state: state.state,
            failure_count: state.failure_count,
            failure_threshold: self.failure_threshold,
            total_calls: state.total_calls,
            total_failures: state.total_failures,
            total_rejections: state.total_rejections,
            times_opened: state.times_opened,
        }
    }

    /// Force the breaker back to CLOSED
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.last_failure_time = None;
        state.probe_in_flight = false;
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Run `f` under the breaker
    ///
    /// `f` is not invoked at all when the call is rejected.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> CallOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut admission = match self.admit() {
            Some(admission) => admission,
            None => return CallOutcome::CircuitOpen,
        };

        let result = f().await;
        admission.finished = true;

        match result {
            Ok(value) => {
                self.on_success(admission.probe);
                CallOutcome::Ok(value)
            }
            Err(error) => {
                self.on_failure(admission.probe);
                CallOutcome::Failed(error)
            }
        }
    }

    fn admit(&self) -> Option<Admission<'_>> {
        let mut state = self.state.lock();

        let probe = match state.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let recovered = state
                    .last_failure_time
                    .map_or(true, |at| at.elapsed() >= self.recovery_timeout);
                if !recovered {
                    state.total_rejections += 1;
                    debug!(breaker = %self.name, "Circuit open, rejecting call");
                    return None;
                }
                state.state = CircuitState::HalfOpen;
                state.probe_in_flight = true;
                info!(breaker = %self.name, "Circuit half-open, admitting probe call");
                true
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    state.total_rejections += 1;
                    debug!(breaker = %self.name, "Probe in flight, rejecting call");
                    return None;
                }
                state.probe_in_flight = true;
                true
            }
        };

        state.total_calls += 1;
        Some(Admission {
            breaker: self,
            probe,
            finished: false,
        })
    }

    fn on_success(&self, probe: bool) {
        let mut state = self.state.lock();

        if probe {
            state.state = CircuitState::Closed;
            state.failure_count = 0;
            state.probe_in_flight = false;
            info!(breaker = %self.name, "Probe succeeded, circuit closed");
        } else if state.state == CircuitState::Closed {
            state.failure_count = 0;
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut state = self.state.lock();
        state.total_failures += 1;
        state.last_failure_time = Some(Instant::now());

        if probe {
            state.state = CircuitState::Open;
            state.probe_in_flight = false;
            state.times_opened += 1;
            warn!(breaker = %self.name, "Probe failed, circuit re-opened");
            return;
        }

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.failure_threshold {
                    state.state = CircuitState::Open;
                    state.times_opened += 1;
                    warn!(
                        breaker = %self.name,
                        failures = state.failure_count,
                        "Failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::Open => state.failure_count += 1,
            // Only the probe's outcome counts while half-open
            CircuitState::HalfOpen => {}
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .field("state", &self.state())
            .finish()
    }
}
