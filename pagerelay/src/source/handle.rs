// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Request protocol driver for one exchange source
//!
//! Serializes requests against a transport, bounds each one by the long-poll
//! wait plus a grace period, and retries transient failures with backoff
//! until the retry policy is exhausted.

use super::{ExchangeSource, SourceResponse};
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, ExchangeResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Request state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Idle,
    RequestOutstanding,
    Closed,
}

#[derive(Debug)]
struct HandleState {
    status: SourceStatus,
    num_requests: i64,
    num_retries: i64,
    num_request_timeouts: i64,
}

/// Owner of one [`ExchangeSource`] and its request state machine
pub struct SourceHandle {
    source: Arc<dyn ExchangeSource>,
    state: Mutex<HandleState>,
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("remote_task_id", &self.source.remote_task_id())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl SourceHandle {
    pub fn new(source: Arc<dyn ExchangeSource>) -> Self {
        Self {
            source,
            state: Mutex::new(HandleState {
                status: SourceStatus::Idle,
                num_requests: 0,
                num_retries: 0,
                num_request_timeouts: 0,
            }),
        }
    }

    pub fn remote_task_id(&self) -> &str {
        self.source.remote_task_id()
    }

    pub fn status(&self) -> SourceStatus {
        self.state.lock().status
    }

    pub fn is_closed(&self) -> bool {
        self.status() == SourceStatus::Closed
    }

    fn begin_request(&self) -> ExchangeResult<()> {
        let mut state = self.state.lock();
        match state.status {
            SourceStatus::Idle => {
                state.status = SourceStatus::RequestOutstanding;
                state.num_requests += 1;
                Ok(())
            }
            SourceStatus::RequestOutstanding => Err(ExchangeError::InvalidState(format!(
                "request to {} already outstanding",
                self.remote_task_id()
            ))),
            SourceStatus::Closed => Err(ExchangeError::SourceClosed(
                self.remote_task_id().to_string(),
            )),
        }
    }

    fn finish_request(&self, at_end: bool) {
        let mut state = self.state.lock();
        if state.status == SourceStatus::RequestOutstanding {
            state.status = if at_end {
                SourceStatus::Closed
            } else {
                SourceStatus::Idle
            };
        }
    }

    /// Issue one request, size-only when `max_bytes` is zero
    ///
    /// Transient failures and stalled requests are retried per
    /// `config.retry`; the returned error is terminal.
    pub async fn fetch(
        &self,
        max_bytes: u64,
        config: &ExchangeConfig,
    ) -> ExchangeResult<SourceResponse> {
        self.begin_request()?;
        let result = self.fetch_with_retry(max_bytes, config).await;
        match &result {
            Ok(response) => self.finish_request(response.at_end),
            Err(_) => self.finish_request(false),
        }
        result
    }

    async fn fetch_with_retry(
        &self,
        max_bytes: u64,
        config: &ExchangeConfig,
    ) -> ExchangeResult<SourceResponse> {
        let max_wait = if max_bytes == 0 {
            config.request_data_sizes_max_wait
        } else {
            config.request_data_max_wait
        };
        let bound = max_wait + config.request_timeout_grace;
        let policy = &config.retry;
        let mut attempts = 0u32;
        let mut first_failure: Option<Instant> = None;

        loop {
            attempts += 1;
            let error = match tokio::time::timeout(bound, self.issue(max_bytes, max_wait)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(error)) => error,
                Err(_) => {
                    self.state.lock().num_request_timeouts += 1;
                    log::warn!(
                        "Request to {} stalled for {:?}; presuming it lost",
                        self.remote_task_id(),
                        bound
                    );
                    ExchangeError::RequestTimeout {
                        task_id: self.remote_task_id().to_string(),
                        waited_ms: bound.as_millis() as u64,
                    }
                }
            };

            if !error.is_retryable() {
                log::error!("Request to {} failed: {}", self.remote_task_id(), error);
                return Err(error);
            }

            let failing_for = first_failure.get_or_insert_with(Instant::now).elapsed();
            if attempts > policy.max_retries || failing_for >= policy.max_retry_duration {
                log::error!(
                    "Giving up on {} after {} attempts: {}",
                    self.remote_task_id(),
                    attempts,
                    error
                );
                return Err(ExchangeError::RetriesExhausted {
                    task_id: self.remote_task_id().to_string(),
                    attempts,
                    last_error: error.to_string(),
                });
            }

            let delay = policy.delay_for(attempts);
            {
                let mut state = self.state.lock();
                if state.status == SourceStatus::Closed {
                    return Err(ExchangeError::SourceClosed(
                        self.remote_task_id().to_string(),
                    ));
                }
                state.status = SourceStatus::Idle;
                state.num_retries += 1;
            }
            log::warn!(
                "Request to {} failed ({}); retry {}/{} in {:?}",
                self.remote_task_id(),
                error,
                attempts,
                policy.max_retries,
                delay
            );
            self.wait_before_retry(delay).await?;
        }
    }

    async fn wait_before_retry(&self, delay: Duration) -> ExchangeResult<()> {
        tokio::time::sleep(delay).await;
        let mut state = self.state.lock();
        if state.status == SourceStatus::Closed {
            return Err(ExchangeError::SourceClosed(
                self.remote_task_id().to_string(),
            ));
        }
        state.status = SourceStatus::RequestOutstanding;
        state.num_requests += 1;
        Ok(())
    }

    async fn issue(&self, max_bytes: u64, max_wait: Duration) -> ExchangeResult<SourceResponse> {
        if max_bytes == 0 {
            self.source.request_data_sizes(max_wait).await
        } else {
            self.source.request(max_bytes, max_wait).await
        }
    }

    /// Stop issuing requests and notify the producer; idempotent
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.status == SourceStatus::Closed {
                return;
            }
            state.status = SourceStatus::Closed;
        }
        self.source.close();
    }

    /// Transport counters plus request, retry and timeout counts
    pub fn stats(&self) -> HashMap<String, i64> {
        let mut stats = self.source.stats();
        let state = self.state.lock();
        stats.insert("num_requests".to_string(), state.num_requests);
        stats.insert("num_retries".to_string(), state.num_retries);
        stats.insert("num_request_timeouts".to_string(), state.num_request_timeouts);
        stats
    }
}
