// Circuit breaker guarding a remote dependency (backplane, distributed store).
//
// States:
// - Closed: normal operation, calls proceed
// - Open: calls short-circuit until the break duration elapses
// - HalfOpen: one probe is let through; success closes, failure re-opens

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,

    /// Tripped; calls are skipped.
    Open {
        /// When the circuit was opened.
        since: Instant,
    },

    /// Break duration elapsed; probing for recovery.
    HalfOpen,
}

/// What a recorded outcome did to the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Opened,
    Closed,
}

/// Single circuit breaker with a time-based half-open state.
///
/// A zero break duration disables the breaker entirely.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    break_duration: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, break_duration: Duration) -> Self {
        CircuitBreaker {
            name,
            break_duration,
            state: Mutex::new(CircuitState::Closed),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(CircuitState::Closed)
    }

    /// Whether a call should be attempted now.
    ///
    /// An open circuit whose break duration has elapsed moves to half-open and lets
    /// the call through as a probe.
    pub fn is_usable(&self) -> bool {
        if self.break_duration.is_zero() {
            return true;
        }

        let Ok(mut state) = self.state.lock() else {
            return true;
        };
        match *state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= self.break_duration {
                    *state = CircuitState::HalfOpen;
                    tracing::debug!(breaker = self.name, "circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) -> Transition {
        let Ok(mut state) = self.state.lock() else {
            return Transition::None;
        };
        match *state {
            CircuitState::Closed => Transition::None,
            CircuitState::Open { .. } | CircuitState::HalfOpen => {
                *state = CircuitState::Closed;
                tracing::info!(breaker = self.name, "circuit closed after successful recovery");
                Transition::Closed
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) -> Transition {
        if self.break_duration.is_zero() {
            return Transition::None;
        }

        let Ok(mut state) = self.state.lock() else {
            return Transition::None;
        };
        match *state {
            CircuitState::Open { .. } => Transition::None,
            CircuitState::Closed | CircuitState::HalfOpen => {
                *state = CircuitState::Open {
                    since: Instant::now(),
                };
                tracing::warn!(
                    breaker = self.name,
                    break_secs = self.break_duration.as_secs_f64(),
                    "circuit opened"
                );
                Transition::Opened
            }
        }
    }

    /// Close the circuit regardless of its state (e.g. the transport reconnected).
    pub fn reset(&self) -> Transition {
        self.record_success()
    }
}
