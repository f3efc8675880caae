//! Run-scoped circuit breaker for the database path.
//!
//! ```text
//! CLOSED --[threshold consecutive connection failures]--> OPEN (until the run ends)
//! ```
//!
//! There is no half-open probing: a breaker lives exactly as long as the
//! persistence coordinator that owns it, and each run builds a new one.

use std::fmt;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive_failures: u32,
    state: CircuitState,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
            state: CircuitState::Closed,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            info!(
                previous_failures = self.consecutive_failures,
                "database recovered; failure counter reset"
            );
        }
        self.consecutive_failures = 0;
    }

    /// Counts one connection failure. Returns true if this call opened the circuit.
    pub fn record_connection_failure(&mut self) -> bool {
        if self.is_open() {
            return false;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.state = CircuitState::Open;
            warn!(
                failures = self.consecutive_failures,
                threshold = self.threshold,
                "circuit opened; database path disabled for the rest of the run"
            );
            return true;
        }
        warn!(
            failures = self.consecutive_failures,
            threshold = self.threshold,
            "database connection failure"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_exactly_at_threshold() {
        let mut cb = CircuitBreaker::new(3);
        assert!(!cb.record_connection_failure());
        assert!(!cb.record_connection_failure());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.record_connection_failure());
        assert!(cb.is_open());
        assert!(!cb.record_connection_failure());
    }

    #[test]
    fn success_resets_the_counter() {
        let mut cb = CircuitBreaker::new(2);
        cb.record_connection_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(!cb.record_connection_failure());
        assert!(!cb.is_open());
    }

    #[test]
    fn open_circuit_does_not_reset_on_success() {
        let mut cb = CircuitBreaker::new(1);
        cb.record_connection_failure();
        cb.record_success();
        assert!(cb.is_open());
        assert_eq!(cb.state().to_string(), "open");
    }
}
