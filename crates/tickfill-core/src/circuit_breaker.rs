//! Circuit breaker guarding an upstream data endpoint.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// One trial request is let through after the open timeout.
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuit: Mutex<Circuit>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuit: Mutex::new(Circuit {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    /// `Err` carries how long the circuit stays open.
    pub fn check(&self) -> Result<(), Duration> {
        let mut circuit = self.circuit.lock().expect("circuit breaker lock is not poisoned");
        if circuit.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = circuit
            .opened_at
            .map_or(Duration::ZERO, |opened_at| opened_at.elapsed());
        if elapsed >= self.config.open_timeout {
            circuit.state = CircuitState::HalfOpen;
            circuit.opened_at = None;
            return Ok(());
        }
        Err(self.config.open_timeout - elapsed)
    }

    pub fn record_success(&self) {
        let mut circuit = self.circuit.lock().expect("circuit breaker lock is not poisoned");
        circuit.state = CircuitState::Closed;
        circuit.failures = 0;
        circuit.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut circuit = self.circuit.lock().expect("circuit breaker lock is not poisoned");
        circuit.failures = circuit.failures.saturating_add(1);
        if circuit.state == CircuitState::HalfOpen || circuit.failures >= self.config.failure_threshold {
            circuit.state = CircuitState::Open;
            circuit.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> CircuitState {
        self.circuit.lock().expect("circuit breaker lock is not poisoned").state
    }
}
