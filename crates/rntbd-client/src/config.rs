use std::path::Path;
use std::time::Duration;

use rntbd_common::protocol::error::{Result, RntbdError};
use rntbd_common::transport::ChannelConfig;
use rntbd_common::ConsistencyLevel;
use serde::{Deserialize, Serialize};

/// What an endpoint does when all of its request permits are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaturationPolicy {
    /// Wait up to `acquire_timeout_ms` for a permit.
    Wait,
    /// Fail with `EndpointSaturated` immediately.
    FailFast,
}

/// Configuration for retry logic with exponential backoff.
///
/// Gone and invalid-partition outcomes are retried up to `max_retries`
/// times, waiting `initial_backoff_ms` first and multiplying by
/// `backoff_multiplier` after each attempt, capped at `max_backoff_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts = max_retries + 1
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn next_backoff_ms(&self, backoff_ms: u64) -> u64 {
        std::cmp::min(
            (backoff_ms as f64 * self.backoff_multiplier) as u64,
            self.max_backoff_ms,
        )
    }
}

/// Direct connectivity configuration.
///
/// # Default Configuration
///
/// - `request_timeout_ms`: 5000
/// - `timer_resolution_ms`: 100
/// - `connect_timeout_ms`: 5000
/// - `max_channels_per_endpoint`: 4
/// - `max_requests_per_endpoint`: 256
/// - `saturation_policy`: `Wait` with `acquire_timeout_ms` 30000
/// - `consistency_level`: `Session`
/// - `max_barrier_attempts`: 6, `barrier_interval_ms`: 10
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectConfig {
    pub request_timeout_ms: u64,
    pub timer_resolution_ms: u64,
    pub connect_timeout_ms: u64,
    pub tcp_nodelay: bool,
    pub max_channels_per_endpoint: usize,
    pub max_requests_per_endpoint: usize,
    pub saturation_policy: SaturationPolicy,
    /// Maximum time to wait for endpoint admission under `Wait`
    pub acquire_timeout_ms: u64,
    /// Used when a request does not name its own level
    pub consistency_level: ConsistencyLevel,
    pub retry: RetryConfig,
    /// Barrier re-reads before a quorum or global-commit wait gives up
    pub max_barrier_attempts: usize,
    pub barrier_interval_ms: u64,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            timer_resolution_ms: 100,
            connect_timeout_ms: 5000,
            tcp_nodelay: true,
            max_channels_per_endpoint: 4,
            max_requests_per_endpoint: 256,
            saturation_policy: SaturationPolicy::Wait,
            acquire_timeout_ms: 30000, // 30 seconds
            consistency_level: ConsistencyLevel::Session,
            retry: RetryConfig::default(),
            max_barrier_attempts: 6,
            barrier_interval_ms: 10,
        }
    }
}

impl DirectConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn timer_resolution(&self) -> Duration {
        Duration::from_millis(self.timer_resolution_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn barrier_interval(&self) -> Duration {
        Duration::from_millis(self.barrier_interval_ms)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            tcp_nodelay: self.tcp_nodelay,
        }
    }

    /// Rejects settings that would make the client unusable.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.request_timeout_ms == 0, "request_timeout_ms must be positive"),
            (self.timer_resolution_ms == 0, "timer_resolution_ms must be positive"),
            (
                self.timer_resolution_ms > self.request_timeout_ms,
                "timer_resolution_ms must not exceed request_timeout_ms",
            ),
            (self.max_channels_per_endpoint == 0, "max_channels_per_endpoint must be positive"),
            (self.max_requests_per_endpoint == 0, "max_requests_per_endpoint must be positive"),
            (
                self.retry.backoff_multiplier < 1.0,
                "retry.backoff_multiplier must be at least 1.0",
            ),
        ];
        for (failed, message) in checks {
            if failed {
                return Err(RntbdError::Config(message.to_string()));
            }
        }
        Ok(())
    }

    /// Parses a JSON document; absent fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: DirectConfig = serde_json::from_str(text)
            .map_err(|e| RntbdError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RntbdError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }
}
