// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! In-process transport reading an [`OutputBufferManager`]

use super::{ExchangeSource, SourceResponse};
use crate::error::{ExchangeError, ExchangeResult};
use crate::memory::MemoryPool;
use crate::page::SerializedPage;
use crate::producer::{BufferRead, DataBatch, OutputBufferManager};
use crate::queue::ExchangeQueue;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct LocalState {
    /// Sequence of the next page to read; everything below is acknowledged
    sequence: u64,
    at_end: bool,
    closed: bool,
    num_pages: i64,
    received_bytes: i64,
    num_timeouts: i64,
}

/// Exchange source for producers living in the same process
///
/// The producer task id is the remote task id without its scheme, so
/// `local://stage1.0` reads the output buffer of task `stage1.0`.
pub struct LocalExchangeSource {
    remote_task_id: String,
    task_id: String,
    destination: u32,
    queue: Arc<ExchangeQueue>,
    pool: MemoryPool,
    manager: Arc<OutputBufferManager>,
    state: Mutex<LocalState>,
}

impl LocalExchangeSource {
    pub fn new(
        remote_task_id: &str,
        destination: u32,
        queue: Arc<ExchangeQueue>,
        pool: MemoryPool,
        manager: Arc<OutputBufferManager>,
    ) -> ExchangeResult<Self> {
        let task_id = match remote_task_id.split_once("://") {
            Some((_, task_id)) => task_id,
            None => remote_task_id,
        };
        if task_id.is_empty() {
            return Err(ExchangeError::SourceCreation {
                reason: "empty producer task id".to_string(),
                task_id: remote_task_id.to_string(),
            });
        }
        Ok(Self {
            remote_task_id: remote_task_id.to_string(),
            task_id: task_id.to_string(),
            destination,
            queue,
            pool,
            manager,
            state: Mutex::new(LocalState::default()),
        })
    }

    /// Producer task id this source reads from
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    async fn poll(&self, max_bytes: u64, max_wait: Duration) -> ExchangeResult<SourceResponse> {
        let deadline = Instant::now() + max_wait;
        loop {
            let sequence = {
                let state = self.state.lock();
                if state.closed {
                    return Err(ExchangeError::SourceClosed(self.remote_task_id.clone()));
                }
                if state.at_end {
                    return Ok(SourceResponse::finished(0));
                }
                state.sequence
            };

            let read =
                self.manager
                    .get_data(&self.task_id, self.destination, max_bytes, sequence)?;
            match read {
                BufferRead::Ready(batch) => return self.deliver(batch, sequence),
                BufferRead::Pending(future) => {
                    if tokio::time::timeout_at(deadline, future).await.is_err() {
                        self.state.lock().num_timeouts += 1;
                        log::trace!(
                            "No data from {} within {:?}",
                            self.remote_task_id,
                            max_wait
                        );
                        return Ok(SourceResponse::empty());
                    }
                }
            }
        }
    }

    /// Account received pages to the consumer pool and enqueue them
    fn deliver(&self, batch: DataBatch, sequence: u64) -> ExchangeResult<SourceResponse> {
        let pages = batch
            .pages
            .into_iter()
            .map(|page| {
                let reservation = self.pool.reserve(page.size())?;
                let num_rows = page.num_rows();
                Ok(SerializedPage::with_reservation(
                    page.into_bytes(),
                    num_rows,
                    reservation,
                ))
            })
            .collect::<ExchangeResult<Vec<_>>>()?;
        let bytes: u64 = pages.iter().map(SerializedPage::size).sum();

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ExchangeError::SourceClosed(self.remote_task_id.clone()));
            }
            state.sequence = sequence + pages.len() as u64;
            state.at_end = batch.at_end;
            state.num_pages += pages.len() as i64;
            state.received_bytes += bytes as i64;
        }

        self.queue.enqueue_batch(pages, batch.at_end);
        if batch.at_end {
            self.delete_results();
        }

        Ok(SourceResponse {
            bytes,
            at_end: batch.at_end,
            remaining_bytes: batch.remaining_bytes,
        })
    }

    fn delete_results(&self) {
        if let Err(e) = self.manager.delete_results(&self.task_id, self.destination) {
            log::warn!(
                "Failed to delete results of {} for destination {}: {}",
                self.remote_task_id,
                self.destination,
                e
            );
        }
    }
}

#[async_trait]
impl ExchangeSource for LocalExchangeSource {
    fn remote_task_id(&self) -> &str {
        &self.remote_task_id
    }

    fn destination(&self) -> u32 {
        self.destination
    }

    async fn request(&self, max_bytes: u64, max_wait: Duration) -> ExchangeResult<SourceResponse> {
        // Zero would turn this into a size-only read.
        self.poll(max_bytes.max(1), max_wait).await
    }

    async fn request_data_sizes(&self, max_wait: Duration) -> ExchangeResult<SourceResponse> {
        self.poll(0, max_wait).await
    }

    fn close(&self) {
        let already_done = {
            let mut state = self.state.lock();
            let done = state.closed || state.at_end;
            state.closed = true;
            done
        };
        if !already_done {
            self.delete_results();
        }
    }

    fn stats(&self) -> HashMap<String, i64> {
        let state = self.state.lock();
        HashMap::from([
            ("num_pages".to_string(), state.num_pages),
            ("received_bytes".to_string(), state.received_bytes),
            ("num_timeouts".to_string(), state.num_timeouts),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(max_buffered_bytes: u64) -> (Arc<OutputBufferManager>, Arc<ExchangeQueue>, MemoryPool) {
        let manager = Arc::new(OutputBufferManager::new(max_buffered_bytes));
        let queue = Arc::new(ExchangeQueue::new());
        queue.add_source().unwrap();
        queue.no_more_sources();
        (manager, queue, MemoryPool::unlimited("local-test"))
    }

    #[test]
    fn test_task_id_strips_scheme() {
        let (manager, queue, pool) = setup(1_000);
        let source =
            LocalExchangeSource::new("local://stage1.0", 0, queue.clone(), pool.clone(), manager.clone())
                .unwrap();
        assert_eq!(source.task_id(), "stage1.0");
        assert_eq!(source.remote_task_id(), "local://stage1.0");

        assert!(LocalExchangeSource::new("local://", 0, queue, pool, manager).is_err());
    }

    #[tokio::test]
    async fn test_request_enqueues_accounted_pages() {
        let (manager, queue, pool) = setup(10_000);
        manager.initialize_task("t1", 1, None).unwrap();
        for _ in 0..3 {
            manager.enqueue("t1", 0, SerializedPage::zeroed(100)).unwrap();
        }

        let source =
            LocalExchangeSource::new("local://t1", 0, queue.clone(), pool.clone(), manager.clone())
                .unwrap();
        let response = source.request(250, Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.bytes, 200);
        assert_eq!(response.remaining_bytes, vec![100]);
        assert!(!response.at_end);
        assert_eq!(queue.num_pages(), 2);
        assert_eq!(pool.allocated(), 200);

        // Size-only read acknowledges the two delivered pages.
        let response = source.request_data_sizes(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.bytes, 0);
        assert_eq!(response.remaining_bytes, vec![100]);
        assert_eq!(manager.utilization("t1"), Some(0.01));

        drop(queue.dequeue(u64::MAX).unwrap());
        assert_eq!(pool.allocated(), 0);
    }

    #[tokio::test]
    async fn test_end_marker_and_results_deleted() {
        let (manager, queue, pool) = setup(10_000);
        manager.initialize_task("t1", 1, None).unwrap();
        manager.enqueue("t1", 0, SerializedPage::zeroed(10)).unwrap();
        manager.no_more_data("t1").unwrap();

        let source =
            LocalExchangeSource::new("local://t1", 0, queue.clone(), pool, manager.clone()).unwrap();
        let response = source.request(1_000, Duration::from_secs(1)).await.unwrap();
        assert!(response.at_end);
        assert_eq!(manager.utilization("t1"), Some(0.0));

        let batch = queue.dequeue(1_000).unwrap();
        assert_eq!(batch.pages.len(), 1);
        assert!(batch.at_end);

        // Later requests report completion without reading again.
        let response = source.request(1_000, Duration::from_secs(1)).await.unwrap();
        assert!(response.at_end);
        assert_eq!(queue.num_completed(), 1);
    }

    #[tokio::test]
    async fn test_long_poll_expires_with_empty_response() {
        let (manager, queue, pool) = setup(10_000);
        manager.initialize_task("t1", 1, None).unwrap();
        let source = LocalExchangeSource::new("local://t1", 0, queue, pool, manager).unwrap();

        let response = source.request(100, Duration::from_millis(20)).await.unwrap();
        assert_eq!(response, SourceResponse::empty());
        assert_eq!(source.stats()["num_timeouts"], 1);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_data() {
        let (manager, queue, pool) = setup(10_000);
        manager.initialize_task("t1", 1, None).unwrap();
        let source = Arc::new(
            LocalExchangeSource::new("local://t1", 0, queue.clone(), pool, manager.clone()).unwrap(),
        );

        let request = tokio::spawn({
            let source = source.clone();
            async move { source.request(100, Duration::from_secs(10)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.enqueue("t1", 0, SerializedPage::zeroed(64)).unwrap();

        let response = request.await.unwrap().unwrap();
        assert_eq!(response.bytes, 64);
        assert_eq!(queue.total_bytes(), 64);
    }

    #[tokio::test]
    async fn test_pool_limit_keeps_pages_at_producer() {
        let (manager, queue, _) = setup(10_000);
        let pool = MemoryPool::new("small", 50);
        manager.initialize_task("t1", 1, None).unwrap();
        manager.enqueue("t1", 0, SerializedPage::zeroed(100)).unwrap();

        let source = LocalExchangeSource::new("local://t1", 0, queue.clone(), pool, manager.clone())
            .unwrap();
        let error = source.request(1_000, Duration::from_secs(1)).await.unwrap_err();
        assert!(error.is_retryable());
        assert_eq!(queue.num_pages(), 0);
        assert_eq!(manager.utilization("t1"), Some(0.01));
    }

    #[tokio::test]
    async fn test_close_deletes_results() {
        let (manager, queue, pool) = setup(10_000);
        manager.initialize_task("t1", 1, None).unwrap();
        manager.enqueue("t1", 0, SerializedPage::zeroed(100)).unwrap();

        let source = LocalExchangeSource::new("local://t1", 0, queue, pool, manager.clone()).unwrap();
        source.close();
        source.close();
        assert_eq!(manager.utilization("t1"), Some(0.0));
        assert!(matches!(
            source.request(100, Duration::from_millis(10)).await,
            Err(ExchangeError::SourceClosed(_))
        ));
    }
}
