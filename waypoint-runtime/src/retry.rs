//! Retry logic for transient stage failures

use rand::Rng;
use std::time::Duration;

/// Retry strategy for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry immediately
    None,

    /// Fixed delay between retries
    Fixed,

    /// Exponential backoff
    Exponential,

    /// Exponential backoff with full jitter
    ExponentialWithJitter,
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    pub strategy: RetryStrategy,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::ExponentialWithJitter,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            strategy: RetryStrategy::None,
            ..Default::default()
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        match self.strategy {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed => self.initial_delay,
            RetryStrategy::Exponential => self.exponential(exponent),
            RetryStrategy::ExponentialWithJitter => {
                let ceiling = self.exponential(exponent);
                if ceiling.is_zero() {
                    return ceiling;
                }
                let jittered = rand::thread_rng().gen_range(0.0..=ceiling.as_secs_f64());
                Duration::from_secs_f64(jittered)
            }
        }
    }

    fn exponential(&self, exponent: i32) -> Duration {
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
