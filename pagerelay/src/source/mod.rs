// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Exchange sources
//!
//! An [`ExchangeSource`] fetches pages from exactly one remote producer and
//! pushes them into the queue it was created with. Transports are pluggable:
//! a [`SourceRegistry`] picks the factory from the scheme of the remote task
//! id, and [`SourceHandle`] drives the request protocol (timeouts, retries,
//! state transitions) on top of any transport.

pub mod handle;
pub mod local;
pub mod registry;

pub use handle::{SourceHandle, SourceStatus};
pub use local::LocalExchangeSource;
pub use registry::{SourceFactory, SourceRegistry, TaskIdPattern};

use crate::error::ExchangeResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Outcome of one request against a producer
///
/// The pages themselves have already been pushed into the queue; the response
/// only carries what flow control needs to know.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceResponse {
    /// Bytes enqueued by this request
    pub bytes: u64,

    /// Producer is done; the end-marker has been enqueued
    pub at_end: bool,

    /// Sizes of pages the producer still holds for this consumer
    pub remaining_bytes: Vec<u64>,
}

impl SourceResponse {
    /// Response that moved no data and learned nothing
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn finished(bytes: u64) -> Self {
        Self {
            bytes,
            at_end: true,
            remaining_bytes: Vec::new(),
        }
    }
}

/// Transport bound to one remote producer
#[async_trait]
pub trait ExchangeSource: Send + Sync {
    fn remote_task_id(&self) -> &str;

    /// Destination partition this source reads
    fn destination(&self) -> u32;

    /// Fetch up to `max_bytes` and enqueue the pages
    ///
    /// Long-polls for at most `max_wait` when nothing is available, then
    /// returns an empty response. Always makes progress on the first page even
    /// when it is larger than `max_bytes`.
    async fn request(&self, max_bytes: u64, max_wait: Duration) -> ExchangeResult<SourceResponse>;

    /// Ask how much data is ready without transferring it
    ///
    /// Also releases producer memory held for pages this source already
    /// received.
    async fn request_data_sizes(&self, max_wait: Duration) -> ExchangeResult<SourceResponse>;

    /// Tell the producer this consumer is gone; best effort
    fn close(&self);

    /// Transport counters
    fn stats(&self) -> HashMap<String, i64> {
        HashMap::new()
    }
}
