//! Scripted exchange sources for failure scenarios

use async_trait::async_trait;
use pagerelay::source::LocalExchangeSource;
use pagerelay::{
    ExchangeError, ExchangeResult, ExchangeSource, MemoryPool, OutputBufferManager,
    SourceRegistry, SourceResponse, TaskIdPattern,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Local source whose first `failures` requests fail with a transport error
pub struct FlakySource {
    inner: LocalExchangeSource,
    failures: u32,
    calls: AtomicU32,
}

impl FlakySource {
    fn maybe_fail(&self) -> ExchangeResult<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(ExchangeError::Transport("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeSource for FlakySource {
    fn remote_task_id(&self) -> &str {
        self.inner.remote_task_id()
    }

    fn destination(&self) -> u32 {
        self.inner.destination()
    }

    async fn request(&self, max_bytes: u64, max_wait: Duration) -> ExchangeResult<SourceResponse> {
        self.maybe_fail()?;
        self.inner.request(max_bytes, max_wait).await
    }

    async fn request_data_sizes(&self, max_wait: Duration) -> ExchangeResult<SourceResponse> {
        self.maybe_fail()?;
        self.inner.request_data_sizes(max_wait).await
    }

    fn close(&self) {
        self.inner.close();
    }

    fn stats(&self) -> HashMap<String, i64> {
        self.inner.stats()
    }
}

/// Register `flaky://<task>` sources reading `manager`, each failing
/// `failures` times before delegating to the local transport
pub fn register_flaky(registry: &SourceRegistry, manager: Arc<OutputBufferManager>, failures: u32) {
    registry.register_factory(
        TaskIdPattern::scheme("flaky"),
        move |task_id, destination, queue, pool| {
            let inner =
                LocalExchangeSource::new(task_id, destination, queue, pool, manager.clone())?;
            Ok(Arc::new(FlakySource {
                inner,
                failures,
                calls: AtomicU32::new(0),
            }) as Arc<dyn ExchangeSource>)
        },
    );
}

/// Source whose requests never complete
pub struct StalledSource {
    remote_task_id: String,
    destination: u32,
}

#[async_trait]
impl ExchangeSource for StalledSource {
    fn remote_task_id(&self) -> &str {
        &self.remote_task_id
    }

    fn destination(&self) -> u32 {
        self.destination
    }

    async fn request(&self, _max_bytes: u64, _max_wait: Duration) -> ExchangeResult<SourceResponse> {
        std::future::pending().await
    }

    async fn request_data_sizes(&self, _max_wait: Duration) -> ExchangeResult<SourceResponse> {
        std::future::pending().await
    }

    fn close(&self) {}
}

pub fn register_stalled(registry: &SourceRegistry) {
    registry.register_factory(
        TaskIdPattern::scheme("stalled"),
        |task_id, destination, _queue, _pool: MemoryPool| {
            Ok(Arc::new(StalledSource {
                remote_task_id: task_id.to_string(),
                destination,
            }) as Arc<dyn ExchangeSource>)
        },
    );
}

/// Register a catch-all factory that always fails with `reason`
pub fn register_failing(registry: &SourceRegistry, reason: &'static str) {
    registry.register_factory(TaskIdPattern::Any, move |task_id, _, _, _| {
        Err(ExchangeError::SourceCreation {
            reason: reason.to_string(),
            task_id: task_id.to_string(),
        })
    });
}
