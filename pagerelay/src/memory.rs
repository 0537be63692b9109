// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Memory accounting for received pages
//!
//! Tracks the bytes held by pages that a transport received on behalf of a
//! consumer. A page keeps its reservation until it is dropped, so the pool
//! reflects queued pages as well as pages the consumer still holds.

use crate::error::{ExchangeError, ExchangeResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Byte-accounting memory pool
///
/// Cheap to clone; clones share the same counters.
///
/// # Usage
/// ```ignore
/// let pool = MemoryPool::new("exchange", 100 * 1024 * 1024); // 100MB limit
///
/// let reservation = pool.reserve(1024)?;
/// assert_eq!(pool.allocated(), 1024);
///
/// drop(reservation);
/// assert_eq!(pool.allocated(), 0);
/// ```
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,

    /// Maximum allowed memory in bytes
    limit: u64,

    /// Currently reserved memory
    allocated: AtomicU64,

    /// Peak reserved memory (for statistics)
    peak: AtomicU64,
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.inner.name)
            .field("limit", &self.inner.limit)
            .field("allocated", &self.allocated())
            .field("peak", &self.peak())
            .finish()
    }
}

impl MemoryPool {
    /// Create a pool with the given limit in bytes
    pub fn new(name: impl Into<String>, limit: u64) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                limit,
                allocated: AtomicU64::new(0),
                peak: AtomicU64::new(0),
            }),
        }
    }

    /// Create a pool without a limit
    pub fn unlimited(name: impl Into<String>) -> Self {
        Self::new(name, u64::MAX)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Reserve `bytes` from the pool
    ///
    /// The returned reservation gives the bytes back when dropped.
    pub fn reserve(&self, bytes: u64) -> ExchangeResult<MemoryReservation> {
        let current = self.inner.allocated.fetch_add(bytes, Ordering::SeqCst);
        let new_total = current.saturating_add(bytes);

        if new_total > self.inner.limit {
            // Rollback
            self.inner.allocated.fetch_sub(bytes, Ordering::SeqCst);
            return Err(ExchangeError::MemoryLimitExceeded {
                limit: self.inner.limit,
                requested: new_total,
            });
        }

        self.inner.peak.fetch_max(new_total, Ordering::SeqCst);
        Ok(MemoryReservation {
            pool: self.clone(),
            bytes,
        })
    }

    fn release(&self, bytes: u64) {
        self.inner.allocated.fetch_sub(bytes, Ordering::SeqCst);
    }

    /// Currently reserved bytes
    pub fn allocated(&self) -> u64 {
        self.inner.allocated.load(Ordering::SeqCst)
    }

    /// Peak reserved bytes
    pub fn peak(&self) -> u64 {
        self.inner.peak.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u64 {
        self.inner.limit
    }

    pub fn available(&self) -> u64 {
        self.inner.limit.saturating_sub(self.allocated())
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            limit: self.limit(),
            allocated: self.allocated(),
            peak: self.peak(),
            available: self.available(),
        }
    }
}

/// Bytes held against a [`MemoryPool`], released on drop
#[derive(Debug)]
pub struct MemoryReservation {
    pool: MemoryPool,
    bytes: u64,
}

impl MemoryReservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.pool.release(self.bytes);
    }
}

/// Memory usage statistics
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStats {
    /// Memory limit in bytes
    pub limit: u64,

    /// Currently reserved memory in bytes
    pub allocated: u64,

    /// Peak reserved memory in bytes
    pub peak: u64,

    /// Available memory in bytes
    pub available: u64,
}

impl MemoryStats {
    /// Format as human-readable string
    pub fn format_human_readable(&self) -> String {
        if self.limit == u64::MAX {
            return format!(
                "Memory: {} (unlimited), Peak: {}",
                format_bytes(self.allocated),
                format_bytes(self.peak)
            );
        }
        format!(
            "Memory: {}/{} ({:.1}%), Peak: {}",
            format_bytes(self.allocated),
            format_bytes(self.limit),
            (self.allocated as f64 / self.limit as f64) * 100.0,
            format_bytes(self.peak)
        )
    }
}

/// Format bytes as human-readable (KB, MB, GB)
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_released_on_drop() {
        let pool = MemoryPool::new("test", 1000);

        let first = pool.reserve(100).unwrap();
        let second = pool.reserve(200).unwrap();
        assert_eq!(pool.allocated(), 300);

        drop(first);
        assert_eq!(pool.allocated(), 200);
        assert_eq!(second.bytes(), 200);

        drop(second);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn test_limit_exceeded() {
        let pool = MemoryPool::new("test", 1000);

        let _held = pool.reserve(900).unwrap();
        let result = pool.reserve(200);
        assert!(matches!(
            result,
            Err(ExchangeError::MemoryLimitExceeded {
                limit: 1000,
                requested: 1100
            })
        ));

        // Allocation should not have happened
        assert_eq!(pool.allocated(), 900);
    }

    #[test]
    fn test_peak_tracking() {
        let pool = MemoryPool::unlimited("test");

        let a = pool.reserve(100).unwrap();
        let b = pool.reserve(200).unwrap();
        assert_eq!(pool.peak(), 300);

        drop(a);
        drop(b);
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.peak(), 300); // Peak doesn't decrease
    }

    #[test]
    fn test_clones_share_counters() {
        let pool = MemoryPool::new("shared", 1000);
        let clone = pool.clone();

        let _held = clone.reserve(400).unwrap();
        assert_eq!(pool.allocated(), 400);
        assert_eq!(pool.available(), 600);
    }

    #[test]
    fn test_stats_format() {
        let pool = MemoryPool::new("test", 100 * 1024 * 1024); // 100MB
        let _held = pool.reserve(50 * 1024 * 1024).unwrap(); // 50MB

        let formatted = pool.stats().format_human_readable();
        assert!(formatted.contains("50.00MB"));
        assert!(formatted.contains("100.00MB"));
        assert!(formatted.contains("50.0%"));
    }

    #[test]
    fn test_unlimited_stats_format() {
        let pool = MemoryPool::unlimited("test");
        let _held = pool.reserve(512).unwrap();
        assert_eq!(
            pool.stats().format_human_readable(),
            "Memory: 512B (unlimited), Peak: 512B"
        );
    }
}
