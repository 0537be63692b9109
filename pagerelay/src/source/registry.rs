// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transport factory registry
//!
//! Maps the shape of a remote task id to the factory that builds its
//! [`ExchangeSource`]. The registry is an ordinary value shared through the
//! exchange context, so tests and embedders can install their own transports.

use super::{ExchangeSource, LocalExchangeSource};
use crate::error::{ExchangeError, ExchangeResult};
use crate::memory::MemoryPool;
use crate::producer::OutputBufferManager;
use crate::queue::ExchangeQueue;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Builds a source for `(remote_task_id, destination, queue, pool)`
pub type SourceFactory = Arc<
    dyn Fn(&str, u32, Arc<ExchangeQueue>, MemoryPool) -> ExchangeResult<Arc<dyn ExchangeSource>>
        + Send
        + Sync,
>;

/// Which remote task ids a factory accepts
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskIdPattern {
    /// Task ids of the form `<scheme>://...`
    Scheme(String),
    /// Any task id; consulted after every scheme factory
    Any,
}

impl TaskIdPattern {
    pub fn scheme(scheme: impl Into<String>) -> Self {
        TaskIdPattern::Scheme(scheme.into())
    }

    pub fn matches(&self, task_id: &str) -> bool {
        match self {
            TaskIdPattern::Scheme(scheme) => scheme_of(task_id) == Some(scheme.as_str()),
            TaskIdPattern::Any => true,
        }
    }
}

impl fmt::Display for TaskIdPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskIdPattern::Scheme(scheme) => write!(f, "{}://*", scheme),
            TaskIdPattern::Any => write!(f, "*"),
        }
    }
}

/// Scheme prefix of a task id, if it has one
pub fn scheme_of(task_id: &str) -> Option<&str> {
    task_id.split_once("://").map(|(scheme, _)| scheme)
}

/// Registry of transport factories
#[derive(Default)]
pub struct SourceRegistry {
    factories: RwLock<Vec<(TaskIdPattern, SourceFactory)>>,
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("factories", &self.factories())
            .finish()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `local://` transport reading from `manager`
    pub fn with_local(manager: Arc<OutputBufferManager>) -> Self {
        let registry = Self::new();
        registry.register_factory(
            TaskIdPattern::scheme("local"),
            move |task_id, destination, queue, pool| {
                let source =
                    LocalExchangeSource::new(task_id, destination, queue, pool, manager.clone())?;
                Ok(Arc::new(source) as Arc<dyn ExchangeSource>)
            },
        );
        registry
    }

    pub fn register_factory<F>(&self, pattern: TaskIdPattern, factory: F)
    where
        F: Fn(&str, u32, Arc<ExchangeQueue>, MemoryPool) -> ExchangeResult<Arc<dyn ExchangeSource>>
            + Send
            + Sync
            + 'static,
    {
        log::debug!("Registering exchange source factory for {}", pattern);
        self.factories.write().push((pattern, Arc::new(factory)));
    }

    /// Registered patterns in registration order
    pub fn factories(&self) -> Vec<TaskIdPattern> {
        self.factories
            .read()
            .iter()
            .map(|(pattern, _)| pattern.clone())
            .collect()
    }

    /// Remove every factory registered for `pattern`; returns how many
    pub fn unregister(&self, pattern: &TaskIdPattern) -> usize {
        let mut factories = self.factories.write();
        let before = factories.len();
        factories.retain(|(registered, _)| registered != pattern);
        before - factories.len()
    }

    pub fn clear(&self) {
        self.factories.write().clear();
    }

    fn lookup(&self, task_id: &str) -> Option<SourceFactory> {
        let factories = self.factories.read();
        let by_scheme = factories.iter().find(|(pattern, _)| {
            matches!(pattern, TaskIdPattern::Scheme(_)) && pattern.matches(task_id)
        });
        by_scheme
            .or_else(|| {
                factories
                    .iter()
                    .find(|(pattern, _)| *pattern == TaskIdPattern::Any)
            })
            .map(|(_, factory)| factory.clone())
    }

    /// Build the source for `task_id`
    ///
    /// The factory runs without the registry lock held.
    pub fn create(
        &self,
        task_id: &str,
        destination: u32,
        queue: Arc<ExchangeQueue>,
        pool: MemoryPool,
    ) -> ExchangeResult<Arc<dyn ExchangeSource>> {
        let factory = self
            .lookup(task_id)
            .ok_or_else(|| ExchangeError::NoMatchingFactory(task_id.to_string()))?;
        factory(task_id, destination, queue, pool)
    }
}
