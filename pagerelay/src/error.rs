// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Exchange error types

use thiserror::Error;

/// Result alias used throughout the exchange
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Exchange errors
///
/// Errors are `Clone` because a single terminal failure is handed to every
/// consumer waiting on the queue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Failed to create ExchangeSource: {reason}. Task ID: {task_id}.")]
    SourceCreation { reason: String, task_id: String },

    #[error("No exchange source factory matches task ID: {0}")]
    NoMatchingFactory(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request to {task_id} timed out after {waited_ms} ms")]
    RequestTimeout { task_id: String, waited_ms: u64 },

    #[error("Remote task failed: {0}")]
    RemoteFailure(String),

    #[error("Exchange with {task_id} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        task_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Exchange source {0} is closed")]
    SourceClosed(String),

    #[error("Memory limit exceeded: requested {requested} bytes, limit {limit} bytes")]
    MemoryLimitExceeded { limit: u64, requested: u64 },

    #[error("Output buffer error: {0}")]
    OutputBuffer(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ExchangeError {
    /// Whether a failed request may succeed if issued again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transport(_)
                | ExchangeError::RequestTimeout { .. }
                | ExchangeError::MemoryLimitExceeded { .. }
        )
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(error: serde_json::Error) -> Self {
        ExchangeError::Config(error.to_string())
    }
}

impl From<std::io::Error> for ExchangeError {
    fn from(error: std::io::Error) -> Self {
        ExchangeError::Config(error.to_string())
    }
}
