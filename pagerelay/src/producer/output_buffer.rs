// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Partitioned output buffer of one producing task

use crate::error::{ExchangeError, ExchangeResult};
use crate::future::{make_continue_future, ContinueFuture, ContinuePromise};
use crate::page::SerializedPage;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Pages handed out by one read of a destination
#[derive(Debug, Default)]
pub struct DataBatch {
    pub pages: Vec<SerializedPage>,

    /// Sizes of pages still buffered after the returned ones
    pub remaining_bytes: Vec<u64>,

    /// No page follows the returned ones and the producer is done
    pub at_end: bool,
}

/// Outcome of reading a destination
#[derive(Debug)]
pub enum BufferRead {
    Ready(DataBatch),
    /// Nothing to hand out yet; resolves when that changes
    Pending(ContinueFuture),
}

#[derive(Debug, Default)]
struct DestinationBuffer {
    pages: VecDeque<SerializedPage>,
    /// Sequence number of `pages.front()`
    sequence: u64,
    waiters: Vec<ContinuePromise>,
    deleted: bool,
}

#[derive(Debug, Default)]
struct BufferState {
    destinations: Vec<DestinationBuffer>,
    total_bytes: u64,
    no_more_data: bool,
    failure: Option<String>,
    blocked: Vec<ContinuePromise>,
}

impl BufferState {
    /// Drop pages below `sequence`; returns the freed bytes
    fn acknowledge_locked(&mut self, destination: usize, sequence: u64) -> u64 {
        let buffer = &mut self.destinations[destination];
        let mut freed = 0;
        while buffer.sequence < sequence {
            let Some(page) = buffer.pages.pop_front() else {
                break;
            };
            freed += page.size();
            buffer.sequence += 1;
        }
        self.total_bytes -= freed;
        freed
    }

    fn release_blocked_locked(&mut self, max_buffered_bytes: u64, promises: &mut Vec<ContinuePromise>) {
        if self.total_bytes < max_buffered_bytes {
            promises.append(&mut self.blocked);
        }
    }

    fn wake_all_locked(&mut self, promises: &mut Vec<ContinuePromise>) {
        for destination in &mut self.destinations {
            promises.append(&mut destination.waiters);
        }
    }
}

/// Per-task buffer of serialized pages, one queue per destination
///
/// Pages stay buffered after being handed out until the consumer acknowledges
/// them, either implicitly through the sequence of its next read or through an
/// explicit acknowledge.
#[derive(Debug)]
pub struct OutputBuffer {
    task_id: String,
    max_buffered_bytes: u64,
    state: Mutex<BufferState>,
}

impl OutputBuffer {
    pub fn new(task_id: impl Into<String>, num_destinations: usize, max_buffered_bytes: u64) -> Self {
        let destinations = (0..num_destinations)
            .map(|_| DestinationBuffer::default())
            .collect();
        Self {
            task_id: task_id.into(),
            max_buffered_bytes,
            state: Mutex::new(BufferState {
                destinations,
                ..BufferState::default()
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn check_destination(&self, state: &BufferState, destination: u32) -> ExchangeResult<usize> {
        let index = destination as usize;
        if index >= state.destinations.len() {
            return Err(ExchangeError::OutputBuffer(format!(
                "destination {} out of range for task {} with {} destinations",
                destination,
                self.task_id,
                state.destinations.len()
            )));
        }
        Ok(index)
    }

    /// Add a page for `destination`
    ///
    /// Returns a future when the buffer is full; the producer should wait on
    /// it before enqueueing more.
    pub fn enqueue(
        &self,
        destination: u32,
        page: SerializedPage,
    ) -> ExchangeResult<Option<ContinueFuture>> {
        let mut promises = Vec::new();
        let blocked = {
            let mut state = self.state.lock();
            if let Some(failure) = &state.failure {
                return Err(ExchangeError::RemoteFailure(failure.clone()));
            }
            if state.no_more_data {
                return Err(ExchangeError::OutputBuffer(format!(
                    "task {} already signalled no more data",
                    self.task_id
                )));
            }
            let index = self.check_destination(&state, destination)?;
            if state.destinations[index].deleted {
                // Consumer is gone.
                return Ok(None);
            }

            state.total_bytes += page.size();
            let buffer = &mut state.destinations[index];
            buffer.pages.push_back(page);
            promises.append(&mut buffer.waiters);

            if state.total_bytes >= self.max_buffered_bytes {
                let (promise, future) = make_continue_future();
                state.blocked.push(promise);
                Some(future)
            } else {
                None
            }
        };
        fulfill(promises);
        Ok(blocked)
    }

    /// Acknowledge pages below `sequence`, then read up to `max_bytes` from it
    ///
    /// `max_bytes == 0` only reports the sizes of the buffered pages.
    pub fn get_data(
        &self,
        destination: u32,
        max_bytes: u64,
        sequence: u64,
    ) -> ExchangeResult<BufferRead> {
        let mut promises = Vec::new();
        let read = {
            let mut state = self.state.lock();
            if let Some(failure) = &state.failure {
                return Err(ExchangeError::RemoteFailure(failure.clone()));
            }
            let index = self.check_destination(&state, destination)?;
            if state.destinations[index].deleted {
                return Ok(BufferRead::Ready(DataBatch {
                    at_end: true,
                    ..DataBatch::default()
                }));
            }

            let first = state.destinations[index].sequence;
            let available = state.destinations[index].pages.len() as u64;
            if sequence < first || sequence > first + available {
                return Err(ExchangeError::OutputBuffer(format!(
                    "sequence {} outside [{}, {}] for task {} destination {}",
                    sequence,
                    first,
                    first + available,
                    self.task_id,
                    destination
                )));
            }

            if state.acknowledge_locked(index, sequence) > 0 {
                state.release_blocked_locked(self.max_buffered_bytes, &mut promises);
            }

            let no_more_data = state.no_more_data;
            let buffer = &mut state.destinations[index];
            let mut pages = Vec::new();
            let mut bytes = 0u64;
            if max_bytes > 0 {
                for page in &buffer.pages {
                    if !pages.is_empty() && bytes + page.size() > max_bytes {
                        break;
                    }
                    bytes += page.size();
                    pages.push(page.share());
                }
            }
            let remaining_bytes: Vec<u64> = buffer
                .pages
                .iter()
                .skip(pages.len())
                .map(SerializedPage::size)
                .collect();
            let at_end = no_more_data && remaining_bytes.is_empty();

            if pages.is_empty() && remaining_bytes.is_empty() && !at_end {
                // Readers whose long poll expired dropped their futures.
                buffer.waiters.retain(|waiter| !waiter.is_abandoned());
                let (promise, future) = make_continue_future();
                buffer.waiters.push(promise);
                BufferRead::Pending(future)
            } else {
                BufferRead::Ready(DataBatch {
                    pages,
                    remaining_bytes,
                    at_end,
                })
            }
        };
        fulfill(promises);
        Ok(read)
    }

    /// Release pages below `sequence` without reading
    pub fn acknowledge(&self, destination: u32, sequence: u64) -> ExchangeResult<()> {
        let mut promises = Vec::new();
        {
            let mut state = self.state.lock();
            let index = self.check_destination(&state, destination)?;
            let first = state.destinations[index].sequence;
            if sequence > first {
                state.acknowledge_locked(index, sequence);
                state.release_blocked_locked(self.max_buffered_bytes, &mut promises);
            }
        }
        fulfill(promises);
        Ok(())
    }

    /// Drop everything buffered for `destination`; later enqueues are discarded
    pub fn delete_results(&self, destination: u32) -> ExchangeResult<()> {
        let mut promises = Vec::new();
        {
            let mut state = self.state.lock();
            let index = self.check_destination(&state, destination)?;
            let buffer = &mut state.destinations[index];
            buffer.deleted = true;
            let freed: u64 = buffer.pages.drain(..).map(|page| page.size()).sum();
            buffer.sequence = 0;
            promises.append(&mut buffer.waiters);
            state.total_bytes -= freed;
            state.release_blocked_locked(self.max_buffered_bytes, &mut promises);
        }
        fulfill(promises);
        Ok(())
    }

    /// Producer finished; destinations reach at-end once drained
    pub fn no_more_data(&self) {
        let mut promises = Vec::new();
        {
            let mut state = self.state.lock();
            state.no_more_data = true;
            state.wake_all_locked(&mut promises);
        }
        fulfill(promises);
    }

    /// Producer failed; every later read reports `message`
    pub fn fail(&self, message: impl Into<String>) {
        let mut promises = Vec::new();
        {
            let mut state = self.state.lock();
            if state.failure.is_none() {
                state.failure = Some(message.into());
            }
            state.wake_all_locked(&mut promises);
            promises.append(&mut state.blocked);
        }
        fulfill(promises);
    }

    /// Release every waiter; used when the task is removed
    pub fn abort(&self) {
        let mut promises = Vec::new();
        {
            let mut state = self.state.lock();
            state.wake_all_locked(&mut promises);
            promises.append(&mut state.blocked);
        }
        fulfill(promises);
    }

    /// Buffered bytes as a fraction of the buffer capacity
    pub fn utilization(&self) -> f64 {
        let state = self.state.lock();
        if self.max_buffered_bytes == 0 {
            return 0.0;
        }
        state.total_bytes as f64 / self.max_buffered_bytes as f64
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }
}

fn fulfill(promises: Vec<ContinuePromise>) {
    for promise in promises {
        promise.set_value();
    }
}
