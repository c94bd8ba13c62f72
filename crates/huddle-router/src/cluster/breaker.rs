//! Failure-isolating circuit breaker for remote delivery.
//!
//! After a configurable run of consecutive failures the breaker opens and
//! short-circuits calls for a cooldown window, so one unreachable peer
//! cannot stall the router with piled-up timeouts. After the cooldown a
//! probe request is allowed through; success closes the breaker.

use std::time::{Duration, Instant};

use tracing::warn;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub threshold: u32,
    /// How long the circuit stays open.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Returns true if a request should be allowed through.
    pub fn allow_request(&self) -> bool {
        match self.opened_at {
            // Allow a probe request after cooldown.
            Some(opened_at) => opened_at.elapsed() > self.config.cooldown,
            None => true,
        }
    }

    /// Record a successful call, closing the circuit.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// Record a failed call, opening the circuit at the threshold.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.config.threshold {
            if self.opened_at.is_none() {
                warn!(
                    threshold = self.config.threshold,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Remote delivery circuit breaker opened"
                );
            }
            self.opened_at = Some(Instant::now());
        }
    }
}
