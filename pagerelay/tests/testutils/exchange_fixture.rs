//! Exchange fixture for integration tests
//!
//! Every fixture owns its own output buffer manager and registry, so tests can
//! run in parallel without sharing producers.

use bytes::Bytes;
use pagerelay::{
    ExchangeClient, ExchangeConfig, ExchangeContext, ExchangeError, ExchangeResult, MemoryPool,
    NextBatch, OutputBufferManager, SerializedPage, SourceRegistry,
};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single wait in a test
pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct ExchangeFixture {
    pub manager: Arc<OutputBufferManager>,
    pub registry: Arc<SourceRegistry>,
    pub config: ExchangeConfig,
    pub pool: MemoryPool,
}

impl ExchangeFixture {
    /// Fixture with the `local://` transport and short waits
    pub fn new() -> Self {
        Self::with_config(ExchangeConfig::low_latency())
    }

    pub fn with_config(config: ExchangeConfig) -> Self {
        init_logging();
        let manager = Arc::new(OutputBufferManager::default());
        let registry = Arc::new(SourceRegistry::with_local(manager.clone()));
        Self {
            manager,
            registry,
            config,
            pool: MemoryPool::unlimited(format!("exchange-test-{}", uuid::Uuid::new_v4())),
        }
    }

    pub fn context(&self) -> ExchangeContext {
        ExchangeContext::try_current(self.registry.clone(), self.config.clone())
            .expect("tests run inside a tokio runtime")
    }

    pub fn client(&self, max_queued_bytes: u64) -> Arc<ExchangeClient> {
        self.client_for_destination(0, max_queued_bytes)
    }

    pub fn client_for_destination(
        &self,
        destination: u32,
        max_queued_bytes: u64,
    ) -> Arc<ExchangeClient> {
        ExchangeClient::new(
            format!("client-{}", uuid::Uuid::new_v4()),
            destination,
            max_queued_bytes,
            self.pool.clone(),
            &self.context(),
        )
        .expect("Failed to create exchange client")
    }

    /// Initialize a producer with a unique task id; returns the task id
    pub fn start_producer(&self, num_destinations: u32, max_buffered_bytes: Option<u64>) -> String {
        let task_id = unique_task_id("producer");
        self.manager
            .initialize_task(&task_id, num_destinations, max_buffered_bytes)
            .expect("Failed to initialize producer");
        task_id
    }

    /// Push a zero-filled page of `size` bytes
    pub fn enqueue(&self, task_id: &str, destination: u32, size: usize) {
        self.manager
            .enqueue(task_id, destination, SerializedPage::zeroed(size))
            .expect("Failed to enqueue page");
    }

    /// Push a page tagged with its producer index and sequence number
    pub fn enqueue_tagged(&self, task_id: &str, producer: u8, sequence: u64, size: usize) {
        let page = SerializedPage::new(Bytes::from(vec![producer; size]), Some(sequence));
        self.manager
            .enqueue(task_id, 0, page)
            .expect("Failed to enqueue page");
    }

    pub fn finish_producer(&self, task_id: &str) {
        self.manager
            .no_more_data(task_id)
            .expect("Failed to finish producer");
    }
}

pub fn unique_task_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

pub fn local(task_id: &str) -> String {
    format!("local://{}", task_id)
}

/// Next non-empty or at-end batch, waiting on futures as needed
pub async fn next_batch(client: &ExchangeClient, max_bytes: u64) -> ExchangeResult<NextBatch> {
    loop {
        let mut batch = client.next(max_bytes)?;
        if !batch.pages.is_empty() || batch.at_end {
            return Ok(batch);
        }
        if let Some(future) = batch.future.take() {
            tokio::time::timeout(WAIT, future).await.map_err(|_| {
                ExchangeError::InvalidState("timed out waiting for pages".to_string())
            })??;
        }
    }
}

/// Every page until the client reports at-end
pub async fn drain(client: &ExchangeClient, max_bytes: u64) -> ExchangeResult<Vec<SerializedPage>> {
    let mut pages = Vec::new();
    loop {
        let batch = next_batch(client, max_bytes).await?;
        pages.extend(batch.pages);
        if batch.at_end {
            return Ok(pages);
        }
    }
}

/// Poll `condition` until it holds or [`WAIT`] passes
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
