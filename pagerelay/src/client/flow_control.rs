// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Cross-source flow control
//!
//! Decides which sources to request from, and how many bytes each request may
//! bring back, so that queued plus in-flight bytes stay within the client
//! budget. Every source is in exactly one place: waiting for a response (not
//! tracked here), known to have nothing ready (`empty`), or parked with data
//! ready at the producer (`producing`).

use crate::source::{SourceHandle, SourceResponse};
use std::collections::VecDeque;
use std::sync::Arc;

/// One request to issue
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub source: Arc<SourceHandle>,

    /// Bytes to request; zero asks for data sizes only
    pub max_bytes: u64,

    /// Size-only request sent to a parked source so the producer can release
    /// the pages it already delivered
    pub acknowledge: bool,
}

/// Source with data ready at the producer
#[derive(Debug)]
pub struct ProducingSource {
    pub source: Arc<SourceHandle>,
    pub remaining_bytes: Vec<u64>,

    /// The last request to this source was size-only, so the producer has
    /// already been told about every page it delivered
    pub acknowledged: bool,
}

#[derive(Debug)]
pub struct FlowControl {
    max_queued_bytes: u64,
    pending_bytes: u64,
    empty: VecDeque<Arc<SourceHandle>>,
    producing: VecDeque<ProducingSource>,
    num_acknowledge_requests: u64,
}

impl FlowControl {
    pub fn new(max_queued_bytes: u64) -> Self {
        Self {
            max_queued_bytes,
            pending_bytes: 0,
            empty: VecDeque::new(),
            producing: VecDeque::new(),
            num_acknowledge_requests: 0,
        }
    }

    /// Track a new source; its first request asks for data sizes
    pub fn add_source(&mut self, source: Arc<SourceHandle>) {
        self.empty.push_back(source);
    }

    /// Choose the requests to issue given `queued_bytes` already in the queue
    ///
    /// Every returned request counts against the budget until
    /// [`FlowControl::on_response`] or [`FlowControl::on_failure`] is called
    /// for it.
    pub fn pick_sources(&mut self, queued_bytes: u64) -> Vec<RequestSpec> {
        let mut requests: Vec<RequestSpec> = self
            .empty
            .drain(..)
            .map(|source| RequestSpec {
                source,
                max_bytes: 0,
                acknowledge: false,
            })
            .collect();

        let mut available =
            self.max_queued_bytes as i64 - queued_bytes as i64 - self.pending_bytes as i64;
        while available > 0 {
            let Some(front) = self.producing.front() else {
                break;
            };
            let mut request_bytes = 0u64;
            for &bytes in &front.remaining_bytes {
                available -= bytes as i64;
                if available < 0 {
                    break;
                }
                request_bytes += bytes;
            }
            if request_bytes == 0 {
                // The front source's next page does not fit.
                break;
            }
            if let Some(producing) = self.producing.pop_front() {
                requests.push(RequestSpec {
                    source: producing.source,
                    max_bytes: request_bytes,
                    acknowledge: false,
                });
            }
        }

        // Nothing queued or in flight: take one page whatever its size, or
        // the exchange stalls on pages larger than the budget.
        if queued_bytes == 0 && self.pending_bytes == 0 {
            let has_data_request = requests.iter().any(|request| request.max_bytes > 0);
            if !has_data_request {
                if let Some(producing) = self.producing.pop_front() {
                    let max_bytes = producing.remaining_bytes.first().copied().unwrap_or(1);
                    requests.push(RequestSpec {
                        source: producing.source,
                        max_bytes,
                        acknowledge: false,
                    });
                }
            }
        }

        // Parked sources still hold delivered pages at the producer.
        let mut parked = VecDeque::with_capacity(self.producing.len());
        for producing in self.producing.drain(..) {
            if producing.acknowledged {
                parked.push_back(producing);
            } else {
                self.num_acknowledge_requests += 1;
                requests.push(RequestSpec {
                    source: producing.source,
                    max_bytes: 0,
                    acknowledge: true,
                });
            }
        }
        self.producing = parked;

        for request in &requests {
            self.pending_bytes += request.max_bytes;
        }
        requests
    }

    /// Account a completed request and re-park its source
    pub fn on_response(&mut self, request: &RequestSpec, response: &SourceResponse) {
        self.release(request.max_bytes);
        if response.at_end {
            return;
        }
        if response.remaining_bytes.is_empty() {
            self.empty.push_back(request.source.clone());
        } else {
            self.producing.push_back(ProducingSource {
                source: request.source.clone(),
                remaining_bytes: response.remaining_bytes.clone(),
                acknowledged: request.max_bytes == 0,
            });
        }
    }

    /// Release the budget of a request that failed terminally
    pub fn on_failure(&mut self, request: &RequestSpec) {
        self.release(request.max_bytes);
    }

    fn release(&mut self, bytes: u64) {
        self.pending_bytes = self.pending_bytes.saturating_sub(bytes);
    }

    /// Bytes promised to requests in flight
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    pub fn num_acknowledge_requests(&self) -> u64 {
        self.num_acknowledge_requests
    }

    pub fn num_producing(&self) -> usize {
        self.producing.len()
    }

    /// Forget every parked source
    pub fn clear(&mut self) {
        self.empty.clear();
        self.producing.clear();
        self.pending_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeResult;
    use crate::source::ExchangeSource;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Idle(String);

    #[async_trait]
    impl ExchangeSource for Idle {
        fn remote_task_id(&self) -> &str {
            &self.0
        }
        fn destination(&self) -> u32 {
            0
        }
        async fn request(&self, _: u64, _: Duration) -> ExchangeResult<SourceResponse> {
            Ok(SourceResponse::empty())
        }
        async fn request_data_sizes(&self, _: Duration) -> ExchangeResult<SourceResponse> {
            Ok(SourceResponse::empty())
        }
        fn close(&self) {}
    }

    fn handle(name: &str) -> Arc<SourceHandle> {
        Arc::new(SourceHandle::new(Arc::new(Idle(name.to_string()))))
    }

    fn sizes(remaining_bytes: Vec<u64>) -> SourceResponse {
        SourceResponse {
            bytes: 0,
            at_end: false,
            remaining_bytes,
        }
    }

    fn names(requests: &[RequestSpec]) -> Vec<(String, u64)> {
        requests
            .iter()
            .map(|r| (r.source.remote_task_id().to_string(), r.max_bytes))
            .collect()
    }

    fn expected(specs: &[(&str, u64)]) -> Vec<(String, u64)> {
        specs
            .iter()
            .map(|(name, bytes)| (name.to_string(), *bytes))
            .collect()
    }

    #[test]
    fn test_new_sources_get_size_requests() {
        let mut flow = FlowControl::new(1_000);
        flow.add_source(handle("a"));
        flow.add_source(handle("b"));

        let requests = flow.pick_sources(0);
        assert_eq!(names(&requests), expected(&[("a", 0), ("b", 0)]));
        assert_eq!(flow.pending_bytes(), 0);
        assert!(flow.pick_sources(0).is_empty());
    }

    #[test]
    fn test_data_requests_fit_budget() {
        let mut flow = FlowControl::new(350);
        flow.add_source(handle("a"));
        flow.add_source(handle("b"));
        let sizes_requests = flow.pick_sources(0);

        flow.on_response(&sizes_requests[0], &sizes(vec![100, 100, 100]));
        let requests = flow.pick_sources(0);
        assert_eq!(names(&requests), expected(&[("a", 300)]));
        assert_eq!(flow.pending_bytes(), 300);

        // Only 50 bytes left; b's first page does not fit and b is not
        // re-acknowledged after a size-only request.
        flow.on_response(&sizes_requests[1], &sizes(vec![100]));
        assert!(flow.pick_sources(0).is_empty());
        assert_eq!(flow.num_producing(), 1);
    }

    #[test]
    fn test_oversized_page_requested_when_idle() {
        let mut flow = FlowControl::new(100);
        flow.add_source(handle("a"));
        let requests = flow.pick_sources(0);
        flow.on_response(&requests[0], &sizes(vec![5_000]));

        let requests = flow.pick_sources(0);
        assert_eq!(names(&requests), expected(&[("a", 5_000)]));

        // Not while something is queued.
        flow.on_response(&requests[0], &sizes(vec![5_000]));
        assert!(flow
            .pick_sources(10)
            .iter()
            .all(|request| request.max_bytes == 0));
    }

    #[test]
    fn test_parked_source_acknowledged_once() {
        let mut flow = FlowControl::new(100);
        flow.add_source(handle("a"));
        let requests = flow.pick_sources(0);
        flow.on_response(&requests[0], &sizes(vec![100, 100]));
        let requests = flow.pick_sources(0);
        assert_eq!(names(&requests), expected(&[("a", 100)]));

        // Delivered one page, queue is full now.
        flow.on_response(&requests[0], &sizes(vec![100]));
        let requests = flow.pick_sources(100);
        assert_eq!(requests.len(), 1);
        assert!(requests[0].acknowledge);
        assert_eq!(requests[0].max_bytes, 0);
        assert_eq!(flow.num_acknowledge_requests(), 1);

        flow.on_response(&requests[0], &sizes(vec![100]));
        assert!(flow.pick_sources(100).is_empty());
        assert_eq!(flow.num_acknowledge_requests(), 1);
    }

    #[test]
    fn test_round_robin_order() {
        let mut flow = FlowControl::new(200);
        for name in ["a", "b", "c"] {
            flow.add_source(handle(name));
        }
        let requests = flow.pick_sources(0);
        for request in &requests {
            flow.on_response(request, &sizes(vec![100]));
        }

        let first = flow.pick_sources(0);
        assert_eq!(names(&first), expected(&[("a", 100), ("b", 100)]));
        flow.on_response(&first[0], &sizes(vec![100]));
        flow.on_response(&first[1], &sizes(vec![100]));

        // c was waiting longest.
        let second = flow.pick_sources(0);
        assert_eq!(second[0].source.remote_task_id(), "c");
    }

    #[test]
    fn test_end_of_source_drops_it() {
        let mut flow = FlowControl::new(100);
        flow.add_source(handle("a"));
        let requests = flow.pick_sources(0);
        flow.on_response(&requests[0], &SourceResponse::finished(0));
        assert!(flow.pick_sources(0).is_empty());
    }

    #[test]
    fn test_failure_releases_budget() {
        let mut flow = FlowControl::new(100);
        flow.add_source(handle("a"));
        let requests = flow.pick_sources(0);
        flow.on_response(&requests[0], &sizes(vec![80]));
        let requests = flow.pick_sources(0);
        assert_eq!(flow.pending_bytes(), 80);
        flow.on_failure(&requests[0]);
        assert_eq!(flow.pending_bytes(), 0);
    }
}
