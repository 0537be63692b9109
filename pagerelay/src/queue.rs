// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Fan-in page queue shared by all sources of one exchange client
//!
//! Every structural change happens under a single mutex. Mutators collect the
//! promises they have to fulfil into a local vector and fulfil them only after
//! the guard is dropped, so a woken consumer that re-enters the queue cannot
//! deadlock against the producer that woke it.

use crate::error::{ExchangeError, ExchangeResult};
use crate::future::{make_continue_future, ContinueFuture, ContinuePromise};
use crate::page::SerializedPage;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;

/// Result of pulling from the queue
#[derive(Debug, Default)]
pub struct NextBatch {
    pub pages: Vec<SerializedPage>,

    /// All sources finished and nothing is left to read
    pub at_end: bool,

    /// Set only when no page was available and the queue is not finished
    pub future: Option<ContinueFuture>,
}

impl NextBatch {
    /// Empty, at-end result with no future to wait on
    pub fn finished() -> Self {
        Self {
            pages: Vec::new(),
            at_end: true,
            future: None,
        }
    }

    fn pending(future: ContinueFuture) -> Self {
        Self {
            pages: Vec::new(),
            at_end: false,
            future: Some(future),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.pages.iter().map(SerializedPage::size).sum()
    }
}

/// State guarded by the queue mutex
#[derive(Debug, Default)]
pub struct QueueState {
    pages: VecDeque<SerializedPage>,
    total_bytes: u64,
    peak_bytes: u64,
    received_pages: u64,
    received_bytes: u64,
    num_sources: usize,
    num_completed: usize,
    no_more_sources: bool,
    closed: bool,
    error: Option<ExchangeError>,
    promises: VecDeque<ContinuePromise>,
}

impl QueueState {
    /// Register one more expected source
    pub fn add_source_locked(&mut self) -> ExchangeResult<()> {
        if self.no_more_sources {
            return Err(ExchangeError::InvalidState(
                "cannot add a source after no-more-sources".to_string(),
            ));
        }
        self.num_sources += 1;
        Ok(())
    }

    pub fn no_more_sources_locked(&mut self, promises: &mut Vec<ContinuePromise>) {
        self.no_more_sources = true;
        if self.all_sources_complete() {
            promises.extend(self.promises.drain(..));
        }
    }

    /// Append a page, or count a finished source when `page` is `None`
    pub fn enqueue_locked(
        &mut self,
        page: Option<SerializedPage>,
        promises: &mut Vec<ContinuePromise>,
    ) {
        if self.closed {
            return;
        }

        let Some(page) = page else {
            if self.num_completed >= self.num_sources {
                log::warn!(
                    "Ignoring end-marker: {} of {} sources already completed",
                    self.num_completed,
                    self.num_sources
                );
                return;
            }
            self.num_completed += 1;
            if self.all_sources_complete() {
                promises.extend(self.promises.drain(..));
            }
            return;
        };

        let size = page.size();
        self.total_bytes += size;
        self.peak_bytes = self.peak_bytes.max(self.total_bytes);
        self.received_pages += 1;
        self.received_bytes += size;
        self.pages.push_back(page);

        // Resume one waiting consumer, skipping the ones that gave up.
        while let Some(promise) = self.promises.pop_front() {
            if !promise.is_abandoned() {
                promises.push(promise);
                break;
            }
        }
    }

    /// Pop pages whose cumulative size stays within `max_bytes`
    ///
    /// At least one page is returned when any is queued, even if it alone is
    /// larger than `max_bytes`.
    pub fn dequeue_locked(&mut self, max_bytes: u64) -> ExchangeResult<NextBatch> {
        if self.closed {
            return Ok(NextBatch::finished());
        }
        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        if self.pages.is_empty() {
            if self.all_sources_complete() {
                return Ok(NextBatch::finished());
            }
            let (promise, future) = make_continue_future();
            self.promises.push_back(promise);
            return Ok(NextBatch::pending(future));
        }

        let mut pages = Vec::new();
        let mut bytes = 0u64;
        while let Some(front) = self.pages.front() {
            if !pages.is_empty() && bytes + front.size() > max_bytes {
                break;
            }
            let Some(page) = self.pages.pop_front() else {
                break;
            };
            bytes += page.size();
            self.total_bytes -= page.size();
            pages.push(page);
        }

        Ok(NextBatch {
            pages,
            at_end: self.is_at_end(),
            future: None,
        })
    }

    fn all_sources_complete(&self) -> bool {
        self.no_more_sources && self.num_completed == self.num_sources
    }

    /// All sources finished and every page was consumed
    pub fn is_at_end(&self) -> bool {
        self.all_sources_complete() && self.pages.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }

    pub fn received_pages(&self) -> u64 {
        self.received_pages
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn average_received_page_bytes(&self) -> u64 {
        if self.received_pages == 0 {
            0
        } else {
            self.received_bytes / self.received_pages
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Synchronized fan-in queue of serialized pages
#[derive(Debug, Default)]
pub struct ExchangeQueue {
    state: Mutex<QueueState>,
}

impl ExchangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the queue mutex for a multi-step mutation
    ///
    /// Promises collected while holding the guard must be fulfilled after it
    /// is dropped.
    pub fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }

    pub fn add_source(&self) -> ExchangeResult<()> {
        self.state.lock().add_source_locked()
    }

    /// Freeze the number of sources; at-end becomes reachable
    pub fn no_more_sources(&self) {
        let mut promises = Vec::new();
        self.state.lock().no_more_sources_locked(&mut promises);
        fulfill(promises);
    }

    /// Append a page, or an end-marker when `page` is `None`
    pub fn enqueue(&self, page: Option<SerializedPage>) {
        let mut promises = Vec::new();
        self.state.lock().enqueue_locked(page, &mut promises);
        fulfill(promises);
    }

    /// Append all pages of one response, followed by an end-marker when the
    /// producer reported completion
    pub fn enqueue_batch(&self, pages: Vec<SerializedPage>, at_end: bool) {
        let mut promises = Vec::new();
        {
            let mut state = self.state.lock();
            for page in pages {
                state.enqueue_locked(Some(page), &mut promises);
            }
            if at_end {
                state.enqueue_locked(None, &mut promises);
            }
        }
        fulfill(promises);
    }

    /// Pull up to `max_bytes` worth of pages, or a future to wait on
    pub fn dequeue(&self, max_bytes: u64) -> ExchangeResult<NextBatch> {
        self.state.lock().dequeue_locked(max_bytes)
    }

    /// Record a terminal failure and fail every waiter
    ///
    /// Only the first error is kept. Ignored once the queue is closed.
    pub fn set_error(&self, error: ExchangeError) {
        let promises: Vec<ContinuePromise> = {
            let mut state = self.state.lock();
            if state.closed || state.error.is_some() {
                return;
            }
            state.error = Some(error.clone());
            state.promises.drain(..).collect()
        };
        for promise in promises {
            promise.set_error(error.clone());
        }
    }

    /// Discard queued pages and release every waiter; idempotent
    pub fn close(&self) {
        let (promises, pages) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.total_bytes = 0;
            let pages = std::mem::take(&mut state.pages);
            let promises: Vec<ContinuePromise> = state.promises.drain(..).collect();
            (promises, pages)
        };
        drop(pages);
        fulfill(promises);
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn peak_bytes(&self) -> u64 {
        self.state.lock().peak_bytes
    }

    pub fn received_pages(&self) -> u64 {
        self.state.lock().received_pages
    }

    pub fn received_bytes(&self) -> u64 {
        self.state.lock().received_bytes
    }

    pub fn average_received_page_bytes(&self) -> u64 {
        self.state.lock().average_received_page_bytes()
    }

    pub fn num_sources(&self) -> usize {
        self.state.lock().num_sources
    }

    pub fn num_completed(&self) -> usize {
        self.state.lock().num_completed
    }

    pub fn num_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn is_at_end(&self) -> bool {
        self.state.lock().is_at_end()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn error(&self) -> Option<ExchangeError> {
        self.state.lock().error.clone()
    }
}

fn fulfill(promises: Vec<ContinuePromise>) {
    for promise in promises {
        promise.set_value();
    }
}
