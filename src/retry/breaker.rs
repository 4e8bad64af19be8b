//! Per-service circuit breakers.
//!
//! Five consecutive failures open the breaker for a cooldown; while open,
//! calls fail fast without touching the service. After the cooldown one
//! probe is admitted (half-open); its outcome closes or re-opens the
//! circuit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_OPEN_FOR: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Breaker registry keyed by external-service name.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    open_for: Duration,
    states: Mutex<HashMap<String, State>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_FOR)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_for: Duration) -> Self {
        Self {
            threshold,
            open_for,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a call to `key` may proceed. Transitions Open → HalfOpen
    /// once the cooldown has elapsed, admitting a single probe.
    pub fn allow(&self, key: &str) -> bool {
        let mut states = self.states.lock().expect("breaker state");
        let state = states
            .entry(key.to_string())
            .or_insert(State::Closed {
                consecutive_failures: 0,
            });
        match *state {
            State::Closed { .. } => true,
            State::HalfOpen => false,
            State::Open { until } => {
                if Instant::now() >= until {
                    *state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut states = self.states.lock().expect("breaker state");
        states.insert(
            key.to_string(),
            State::Closed {
                consecutive_failures: 0,
            },
        );
    }

    pub fn record_failure(&self, key: &str) {
        let mut states = self.states.lock().expect("breaker state");
        let state = states
            .entry(key.to_string())
            .or_insert(State::Closed {
                consecutive_failures: 0,
            });
        *state = match *state {
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.threshold {
                    State::Open {
                        until: Instant::now() + self.open_for,
                    }
                } else {
                    State::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            // A failed probe re-opens the circuit for another cooldown.
            State::HalfOpen | State::Open { .. } => State::Open {
                until: Instant::now() + self.open_for,
            },
        };
    }

    /// True when the breaker for `key` is currently refusing calls.
    pub fn is_open(&self, key: &str) -> bool {
        let states = self.states.lock().expect("breaker state");
        matches!(states.get(key), Some(State::Open { until }) if Instant::now() < *until)
    }
}
