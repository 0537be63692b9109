// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Exchange configuration and retry policy

use crate::error::{ExchangeError, ExchangeResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default byte budget of one exchange client (32MB)
pub const DEFAULT_MAX_QUEUED_BYTES: u64 = 32 * 1024 * 1024;

/// Exchange configuration shared by all clients of a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Default byte budget for queued plus in-flight pages
    pub max_queued_bytes: u64,

    /// Long-poll bound of a size-only request
    pub request_data_sizes_max_wait: Duration,

    /// Long-poll bound of a data request
    pub request_data_max_wait: Duration,

    /// Extra time past the long-poll bound before a request is presumed stalled
    pub request_timeout_grace: Duration,

    /// Retry policy for transient request failures
    pub retry: RetryPolicy,

    /// Task ids longer than this are truncated in construction errors
    pub max_task_id_length_in_error: usize,
}

/// Retry policy with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first failed attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound of a single backoff delay
    pub max_delay: Duration,

    /// Multiplier applied to the delay after every retry
    pub backoff_multiplier: f64,

    /// Overall time after the first failure past which failures become terminal
    pub max_retry_duration: Duration,

    /// Add up to 20% random jitter to every delay
    pub jitter: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
            request_data_sizes_max_wait: Duration::from_secs(10),
            request_data_max_wait: Duration::from_secs(1),
            request_timeout_grace: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            max_task_id_length_in_error: 128,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_retry_duration: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl ExchangeConfig {
    /// Parse a configuration from JSON; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> ExchangeResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ExchangeResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Configuration with short waits, suited to in-process exchanges and tests
    pub fn low_latency() -> Self {
        Self {
            request_data_sizes_max_wait: Duration::from_millis(200),
            request_data_max_wait: Duration::from_millis(100),
            request_timeout_grace: Duration::from_millis(500),
            retry: RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                max_retry_duration: Duration::from_secs(5),
                ..RetryPolicy::default()
            },
            ..Self::default()
        }
    }

    pub fn with_max_queued_bytes(mut self, bytes: u64) -> Self {
        self.max_queued_bytes = bytes;
        self
    }

    pub fn with_request_data_sizes_max_wait(mut self, wait: Duration) -> Self {
        self.request_data_sizes_max_wait = wait;
        self
    }

    pub fn with_request_timeout_grace(mut self, grace: Duration) -> Self {
        self.request_timeout_grace = grace;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_task_id_length_in_error(mut self, length: usize) -> Self {
        self.max_task_id_length_in_error = length;
        self
    }

    /// Check that the configuration is usable
    pub fn validate(&self) -> ExchangeResult<()> {
        if self.max_queued_bytes == 0 {
            return Err(ExchangeError::Config(
                "max_queued_bytes must be positive".to_string(),
            ));
        }
        if self.request_data_sizes_max_wait.is_zero() || self.request_data_max_wait.is_zero() {
            return Err(ExchangeError::Config(
                "request wait bounds must be positive".to_string(),
            ));
        }
        if self.max_task_id_length_in_error == 0 {
            return Err(ExchangeError::Config(
                "max_task_id_length_in_error must be positive".to_string(),
            ));
        }
        self.retry.validate()
    }
}

impl RetryPolicy {
    /// Policy that turns the first failure into a terminal error
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ExchangeResult<()> {
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ExchangeError::Config(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(ExchangeError::Config(
                "initial_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay to wait before retry number `retry` (1-based), without jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff delay with jitter applied when enabled
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if self.jitter {
            delay + delay.mul_f64(fastrand::f64() * 0.2)
        } else {
            delay
        }
    }
}
