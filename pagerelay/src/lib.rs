// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! PageRelay - data exchange transport for distributed query execution
//!
//! Moves serialized pages from the output buffers of many producing tasks into
//! the input queue of one consuming task, under a byte budget.
//!
//! # Features
//!
//! - **Fan-in queue**: one ordered, byte-accounted queue per consumer
//! - **Flow control**: queued plus in-flight bytes stay within the budget
//! - **Acknowledge handshake**: producers release delivered pages early
//! - **Retries**: stalled and failed requests are retried with backoff
//! - **Pluggable transports**: sources are built from a registry keyed by
//!   task-id scheme; `local://` reads in-process output buffers
//!
//! # Usage
//!
//! ```ignore
//! let manager = Arc::new(OutputBufferManager::default());
//! manager.initialize_task("producer.0", 1, None)?;
//!
//! let ctx = ExchangeContext::local(manager.clone(), ExchangeConfig::default())?;
//! let client = ExchangeClient::new("consumer", 0, 1 << 20, MemoryPool::unlimited("exchange"), &ctx)?;
//! client.add_remote_task_id("local://producer.0")?;
//! client.no_more_remote_tasks();
//!
//! loop {
//!     let batch = client.next(64 * 1024)?;
//!     // consume batch.pages ...
//!     if batch.at_end {
//!         break;
//!     }
//!     if let Some(future) = batch.future {
//!         future.await?;
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod future;
pub mod memory;
pub mod page;
pub mod producer;
pub mod queue;
pub mod source;

pub use client::{ExchangeClient, ExchangeContext, ExchangeStats, RuntimeMetric};
pub use config::{ExchangeConfig, RetryPolicy};
pub use error::{ExchangeError, ExchangeResult};
pub use future::{make_continue_future, ContinueFuture, ContinuePromise};
pub use memory::{MemoryPool, MemoryReservation, MemoryStats};
pub use page::SerializedPage;
pub use producer::OutputBufferManager;
pub use queue::{ExchangeQueue, NextBatch};
pub use source::{ExchangeSource, SourceRegistry, SourceResponse, TaskIdPattern};

/// PageRelay version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// PageRelay crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
