// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Exchange client
//!
//! Fans pages from many producers into one queue under a byte budget. The
//! consumer pulls with [`ExchangeClient::next`]; fetches run as tasks on the
//! context's tokio runtime.
//!
//! Locking: the client state lock may be held while taking the queue lock or
//! a source lock, never the other way around. Request specs are computed
//! under the client lock and issued after it is released.

pub mod flow_control;
pub mod stats;

pub use flow_control::{FlowControl, RequestSpec};
pub use stats::{ExchangeStats, RuntimeMetric};

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, ExchangeResult};
use crate::memory::MemoryPool;
use crate::producer::OutputBufferManager;
use crate::queue::{ExchangeQueue, NextBatch};
use crate::source::{SourceHandle, SourceRegistry, SourceResponse};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Process-wide dependencies of exchange clients
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    /// Runtime the fetch tasks are spawned on
    pub executor: Handle,
    pub registry: Arc<SourceRegistry>,
    pub config: ExchangeConfig,
}

impl ExchangeContext {
    pub fn new(executor: Handle, registry: Arc<SourceRegistry>, config: ExchangeConfig) -> Self {
        Self {
            executor,
            registry,
            config,
        }
    }

    /// Context on the runtime of the calling task
    pub fn try_current(
        registry: Arc<SourceRegistry>,
        config: ExchangeConfig,
    ) -> ExchangeResult<Self> {
        let executor = Handle::try_current()
            .map_err(|e| ExchangeError::InvalidState(format!("no tokio runtime: {}", e)))?;
        Ok(Self::new(executor, registry, config))
    }

    /// Context on the current runtime with only the `local://` transport
    pub fn local(manager: Arc<OutputBufferManager>, config: ExchangeConfig) -> ExchangeResult<Self> {
        Self::try_current(Arc::new(SourceRegistry::with_local(manager)), config)
    }
}

#[derive(Debug)]
struct ClientState {
    /// Sources in the order they were added
    sources: Vec<Arc<SourceHandle>>,
    task_ids: HashSet<String>,
    flow: FlowControl,
    no_more_sources: bool,
    closed: bool,
}

/// Consumer side of one exchange
pub struct ExchangeClient {
    client_id: String,
    destination: u32,
    max_queued_bytes: u64,
    pool: MemoryPool,
    queue: Arc<ExchangeQueue>,
    executor: Handle,
    registry: Arc<SourceRegistry>,
    config: Arc<ExchangeConfig>,
    state: Mutex<ClientState>,
    closed_tx: watch::Sender<bool>,
    weak_self: Weak<ExchangeClient>,
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("client_id", &self.client_id)
            .field("destination", &self.destination)
            .field("max_queued_bytes", &self.max_queued_bytes)
            .finish()
    }
}

impl ExchangeClient {
    /// Create a client reading partition `destination` of every producer
    pub fn new(
        client_id: impl Into<String>,
        destination: u32,
        max_queued_bytes: u64,
        pool: MemoryPool,
        ctx: &ExchangeContext,
    ) -> ExchangeResult<Arc<Self>> {
        if max_queued_bytes == 0 {
            return Err(ExchangeError::Config(
                "max_queued_bytes must be positive".to_string(),
            ));
        }
        let client_id = client_id.into();
        let (closed_tx, _) = watch::channel(false);
        log::debug!(
            "Creating exchange client {} for destination {} with budget {}",
            client_id,
            destination,
            max_queued_bytes
        );
        Ok(Arc::new_cyclic(|weak_self| Self {
            client_id,
            destination,
            max_queued_bytes,
            pool,
            queue: Arc::new(ExchangeQueue::new()),
            executor: ctx.executor.clone(),
            registry: ctx.registry.clone(),
            config: Arc::new(ctx.config.clone()),
            state: Mutex::new(ClientState {
                sources: Vec::new(),
                task_ids: HashSet::new(),
                flow: FlowControl::new(max_queued_bytes),
                no_more_sources: false,
                closed: false,
            }),
            closed_tx,
            weak_self: weak_self.clone(),
        }))
    }

    /// Client with the default budget of `ctx.config`
    pub fn with_default_budget(
        client_id: impl Into<String>,
        destination: u32,
        pool: MemoryPool,
        ctx: &ExchangeContext,
    ) -> ExchangeResult<Arc<Self>> {
        Self::new(client_id, destination, ctx.config.max_queued_bytes, pool, ctx)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn destination(&self) -> u32 {
        self.destination
    }

    pub fn max_queued_bytes(&self) -> u64 {
        self.max_queued_bytes
    }

    pub fn queue(&self) -> &Arc<ExchangeQueue> {
        &self.queue
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Add the producer `task_id` and start fetching from it
    ///
    /// Adding a task twice is ignored, as is adding after close.
    pub fn add_remote_task_id(&self, task_id: &str) -> ExchangeResult<()> {
        {
            let state = self.state.lock();
            if state.closed || state.task_ids.contains(task_id) {
                return Ok(());
            }
            if state.no_more_sources {
                return Err(no_more_sources_error(task_id));
            }
        }

        let source = self
            .registry
            .create(
                task_id,
                self.destination,
                self.queue.clone(),
                self.pool.clone(),
            )
            .map_err(|e| self.creation_error(task_id, e))?;
        let handle = Arc::new(SourceHandle::new(source));

        let requests = {
            let mut state = self.state.lock();
            // Lost a race with close or another add of the same task. The
            // new source never issued a request, so it is simply dropped.
            if state.closed || state.task_ids.contains(task_id) {
                return Ok(());
            }
            if state.no_more_sources {
                return Err(no_more_sources_error(task_id));
            }
            self.queue.add_source()?;
            state.task_ids.insert(task_id.to_string());
            state.sources.push(handle.clone());
            state.flow.add_source(handle);
            self.pick_sources_locked(&mut state)
        };

        log::debug!("Exchange client {} added source {}", self.client_id, task_id);
        self.request(requests);
        Ok(())
    }

    fn creation_error(&self, task_id: &str, error: ExchangeError) -> ExchangeError {
        let reason = match error {
            ExchangeError::SourceCreation { reason, .. } => reason,
            other => other.to_string(),
        };
        let shown = truncate(task_id, self.config.max_task_id_length_in_error);
        // Reasons often quote the id; keep those quotes bounded as well.
        let reason = if shown.len() < task_id.len() {
            reason.replace(task_id, shown)
        } else {
            reason
        };
        let error = ExchangeError::SourceCreation {
            reason,
            task_id: shown.to_string(),
        };
        log::warn!("Exchange client {}: {}", self.client_id, error);
        error
    }

    /// No producers follow; at-end becomes reachable
    pub fn no_more_remote_tasks(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.no_more_sources = true;
        }
        self.queue.no_more_sources();
    }

    /// Pull up to `max_bytes` of pages
    ///
    /// Returns pages when any are queued, otherwise a future resolving when
    /// that may have changed. A finished or closed client returns an empty
    /// at-end batch without a future. A terminal fetch failure is returned as
    /// the error.
    pub fn next(&self, max_bytes: u64) -> ExchangeResult<NextBatch> {
        let (batch, requests) = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(NextBatch::finished());
            }
            let batch = self.queue.dequeue(max_bytes)?;
            let requests = self.pick_sources_locked(&mut state);
            (batch, requests)
        };
        self.request(requests);
        Ok(batch)
    }

    fn pick_sources_locked(&self, state: &mut ClientState) -> Vec<RequestSpec> {
        if state.closed {
            return Vec::new();
        }
        let queue = self.queue.lock();
        let requests = state.flow.pick_sources(queue.total_bytes());
        drop(queue);
        requests
    }

    /// Spawn one fetch task per request
    fn request(&self, requests: Vec<RequestSpec>) {
        for request in requests {
            log::trace!(
                "Exchange client {} requesting {} bytes from {}{}",
                self.client_id,
                request.max_bytes,
                request.source.remote_task_id(),
                if request.acknowledge { " (acknowledge)" } else { "" }
            );
            let client = self.weak_self.clone();
            let config = self.config.clone();
            let mut closed_rx = self.closed_tx.subscribe();
            self.executor.spawn(async move {
                let source = request.source.clone();
                let result = tokio::select! {
                    result = source.fetch(request.max_bytes, &config) => result,
                    _ = closed_rx.wait_for(|closed| *closed) => return,
                };
                if let Some(client) = client.upgrade() {
                    client.on_response(request, result);
                }
            });
        }
    }

    fn on_response(&self, request: RequestSpec, result: ExchangeResult<SourceResponse>) {
        let requests = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            match &result {
                Ok(response) => {
                    state.flow.on_response(&request, response);
                    self.pick_sources_locked(&mut state)
                }
                Err(_) => {
                    state.flow.on_failure(&request);
                    Vec::new()
                }
            }
        };

        match result {
            Ok(_) => self.request(requests),
            Err(error) => {
                log::error!(
                    "Exchange client {} failed fetching from {}: {}",
                    self.client_id,
                    request.source.remote_task_id(),
                    error
                );
                self.queue.set_error(error);
            }
        }
    }

    /// Snapshot of queue, flow-control and source counters
    pub fn stats(&self) -> ExchangeStats {
        let (sources, pending_bytes, num_acknowledge_requests) = {
            let state = self.state.lock();
            (
                state.sources.clone(),
                state.flow.pending_bytes(),
                state.flow.num_acknowledge_requests(),
            )
        };

        let mut stats = {
            let queue = self.queue.lock();
            ExchangeStats {
                queued_bytes: queue.total_bytes(),
                peak_bytes: queue.peak_bytes(),
                num_received_pages: queue.received_pages(),
                received_bytes: queue.received_bytes(),
                average_received_page_bytes: queue.average_received_page_bytes(),
                pending_bytes,
                num_sources: sources.len(),
                num_acknowledge_requests,
                ..ExchangeStats::default()
            }
        };
        for source in &sources {
            stats.add_source_stats(source.stats());
        }
        stats
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close every source and the queue; idempotent
    ///
    /// In-flight fetches are abandoned and late responses ignored.
    pub fn close(&self) {
        let sources = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.flow.clear();
            state.sources.clone()
        };
        self.closed_tx.send_replace(true);
        for source in &sources {
            source.close();
        }
        self.queue.close();
        log::debug!(
            "Exchange client {} closed with {} sources",
            self.client_id,
            sources.len()
        );
    }
}

impl Drop for ExchangeClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn no_more_sources_error(task_id: &str) -> ExchangeError {
    ExchangeError::InvalidState(format!(
        "cannot add remote task {} after no-more-remote-tasks",
        task_id
    ))
}

/// Longest prefix of `s` of at most `max_len` bytes ending on a char boundary
fn truncate(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
