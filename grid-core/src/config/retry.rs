use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ext::capped_backoff;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRetryConfig {
    pub initial_backoff_millis: u64,
    pub max_backoff_millis: u64,
    pub multiplier: f64,
    /// Fraction in `[0, 1]` of the backoff that is randomized.
    pub jitter: f64,
    /// Total time budget for reaching the cluster, at startup and per reconnect.
    pub cluster_connect_timeout_millis: u64,
    /// Connection rounds per budget, 0 means bounded by time only.
    pub max_attempts: u32,
}

impl ConnectionRetryConfig {
    pub fn cluster_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster_connect_timeout_millis)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        capped_backoff(
            Duration::from_millis(self.initial_backoff_millis),
            self.multiplier,
            attempt,
            Duration::from_millis(self.max_backoff_millis),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationConfig {
    pub timeout_millis: u64,
    pub retry_pause_millis: u64,
    /// Attempts retried immediately before pausing kicks in.
    pub max_fast_retries: u32,
    pub max_retries: u32,
}

impl InvocationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_millis)
    }

    /// Delay before attempt number `attempt` (1-based retries).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if attempt <= self.max_fast_retries {
            Duration::ZERO
        } else {
            let pause = self.retry_pause();
            capped_backoff(pause, 2.0, attempt - self.max_fast_retries - 1, pause * 8)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::retry::InvocationConfig;

    #[test]
    fn test_retry_delay() {
        let config = InvocationConfig {
            timeout_millis: 1000,
            retry_pause_millis: 100,
            max_fast_retries: 2,
            max_retries: 10,
        };
        assert_eq!(config.retry_delay(1), Duration::ZERO);
        assert_eq!(config.retry_delay(2), Duration::ZERO);
        assert_eq!(config.retry_delay(3), Duration::from_millis(100));
        assert_eq!(config.retry_delay(4), Duration::from_millis(200));
        assert_eq!(config.retry_delay(20), Duration::from_millis(800));
    }
}
