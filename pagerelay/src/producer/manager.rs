// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Process-wide registry of producer output buffers
//!
//! Producing tasks push pages into their buffer through the manager; the
//! local transport answers consumer queries from the same buffers. Task
//! lookups take the manager lock only long enough to clone the buffer handle.

use super::output_buffer::{BufferRead, DataBatch, OutputBuffer};
use crate::config::DEFAULT_MAX_QUEUED_BYTES;
use crate::error::{ExchangeError, ExchangeResult};
use crate::future::{make_continue_future, ContinueFuture, ContinuePromise};
use crate::page::SerializedPage;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
struct ManagerState {
    buffers: HashMap<String, Arc<OutputBuffer>>,
    /// Consumers that asked for a task before it was initialized
    task_waiters: HashMap<String, Vec<ContinuePromise>>,
    /// Tasks dropped by `remove_task`; their readers are answered at-end
    removed: HashSet<String>,
}

/// Owner of every [`OutputBuffer`] in the process
#[derive(Debug)]
pub struct OutputBufferManager {
    default_max_buffered_bytes: u64,
    state: Mutex<ManagerState>,
}

impl Default for OutputBufferManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUED_BYTES)
    }
}

impl OutputBufferManager {
    pub fn new(default_max_buffered_bytes: u64) -> Self {
        Self {
            default_max_buffered_bytes,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Create the output buffer of `task_id`
    ///
    /// `max_buffered_bytes` falls back to the manager default.
    pub fn initialize_task(
        &self,
        task_id: &str,
        num_destinations: u32,
        max_buffered_bytes: Option<u64>,
    ) -> ExchangeResult<()> {
        let waiters = {
            let mut state = self.state.lock();
            if state.buffers.contains_key(task_id) {
                return Err(ExchangeError::OutputBuffer(format!(
                    "task {} is already initialized",
                    task_id
                )));
            }
            let buffer = OutputBuffer::new(
                task_id,
                num_destinations as usize,
                max_buffered_bytes.unwrap_or(self.default_max_buffered_bytes),
            );
            state.buffers.insert(task_id.to_string(), Arc::new(buffer));
            state.removed.remove(task_id);
            state.task_waiters.remove(task_id).unwrap_or_default()
        };
        log::debug!(
            "Initialized output buffer for task {} with {} destinations",
            task_id,
            num_destinations
        );
        for waiter in waiters {
            waiter.set_value();
        }
        Ok(())
    }

    fn buffer(&self, task_id: &str) -> Option<Arc<OutputBuffer>> {
        self.state.lock().buffers.get(task_id).cloned()
    }

    fn require_buffer(&self, task_id: &str) -> ExchangeResult<Arc<OutputBuffer>> {
        self.buffer(task_id).ok_or_else(|| {
            ExchangeError::OutputBuffer(format!("task {} is not initialized", task_id))
        })
    }

    /// Push a page for `destination`
    ///
    /// Returns `Some(future)` when the producer is blocked; it should wait for
    /// the future before pushing more.
    pub fn enqueue(
        &self,
        task_id: &str,
        destination: u32,
        page: SerializedPage,
    ) -> ExchangeResult<Option<ContinueFuture>> {
        self.require_buffer(task_id)?.enqueue(destination, page)
    }

    pub fn no_more_data(&self, task_id: &str) -> ExchangeResult<()> {
        self.require_buffer(task_id)?.no_more_data();
        Ok(())
    }

    /// Mark the producer failed; consumers see `RemoteFailure(message)`
    pub fn fail_task(&self, task_id: &str, message: &str) -> ExchangeResult<()> {
        log::warn!("Output buffer of task {} failed: {}", task_id, message);
        self.require_buffer(task_id)?.fail(message);
        Ok(())
    }

    /// Drop the buffer of `task_id`; returns whether it existed
    ///
    /// Later reads of the task report at-end instead of waiting for it.
    pub fn remove_task(&self, task_id: &str) -> bool {
        let (removed, waiters) = {
            let mut state = self.state.lock();
            state.removed.insert(task_id.to_string());
            let waiters = state.task_waiters.remove(task_id).unwrap_or_default();
            (state.buffers.remove(task_id), waiters)
        };
        for waiter in waiters {
            waiter.set_value();
        }
        match removed {
            Some(buffer) => {
                log::debug!("Removed output buffer of task {}", task_id);
                buffer.abort();
                true
            }
            None => false,
        }
    }

    /// Fraction of the buffer capacity in use, `None` for unknown tasks
    pub fn utilization(&self, task_id: &str) -> Option<f64> {
        self.buffer(task_id).map(|buffer| buffer.utilization())
    }

    /// Acknowledge pages below `sequence` and read from there
    ///
    /// Reading a task that is not initialized yet returns a future resolved
    /// once it is.
    pub fn get_data(
        &self,
        task_id: &str,
        destination: u32,
        max_bytes: u64,
        sequence: u64,
    ) -> ExchangeResult<BufferRead> {
        let buffer = {
            let mut state = self.state.lock();
            match state.buffers.get(task_id) {
                Some(buffer) => buffer.clone(),
                None if state.removed.contains(task_id) => {
                    return Ok(BufferRead::Ready(DataBatch {
                        at_end: true,
                        ..DataBatch::default()
                    }));
                }
                None => {
                    let (promise, future) = make_continue_future();
                    let waiters = state.task_waiters.entry(task_id.to_string()).or_default();
                    waiters.retain(|waiter| !waiter.is_abandoned());
                    waiters.push(promise);
                    return Ok(BufferRead::Pending(future));
                }
            }
        };
        buffer.get_data(destination, max_bytes, sequence)
    }

    /// Release pages below `sequence`; unknown tasks are ignored
    pub fn acknowledge(&self, task_id: &str, destination: u32, sequence: u64) -> ExchangeResult<()> {
        match self.buffer(task_id) {
            Some(buffer) => buffer.acknowledge(destination, sequence),
            None => Ok(()),
        }
    }

    /// Drop the results held for `destination`; unknown tasks are ignored
    pub fn delete_results(&self, task_id: &str, destination: u32) -> ExchangeResult<()> {
        match self.buffer(task_id) {
            Some(buffer) => buffer.delete_results(destination),
            None => Ok(()),
        }
    }

    pub fn num_tasks(&self) -> usize {
        self.state.lock().buffers.len()
    }
}
