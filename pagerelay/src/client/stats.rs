// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Exchange client statistics

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Aggregate of one counter across sources
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMetric {
    pub sum: i64,
    pub count: u64,
    pub min: i64,
    pub max: i64,
}

impl RuntimeMetric {
    pub fn new(value: i64) -> Self {
        Self {
            sum: value,
            count: 1,
            min: value,
            max: value,
        }
    }

    pub fn add_value(&mut self, value: i64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    pub fn merge(&mut self, other: &RuntimeMetric) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.sum += other.sum;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

/// Snapshot of an exchange client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeStats {
    /// Bytes currently queued for the consumer
    pub queued_bytes: u64,

    /// Highest value `queued_bytes` reached
    pub peak_bytes: u64,

    pub num_received_pages: u64,
    pub received_bytes: u64,
    pub average_received_page_bytes: u64,

    /// Bytes promised to requests in flight
    pub pending_bytes: u64,

    pub num_sources: usize,
    pub num_acknowledge_requests: u64,

    /// Every source counter, aggregated across sources
    pub source_metrics: BTreeMap<String, RuntimeMetric>,
}

impl ExchangeStats {
    /// Fold one source's counters into `source_metrics`
    pub fn add_source_stats(&mut self, stats: HashMap<String, i64>) {
        for (name, value) in stats {
            self.source_metrics.entry(name).or_default().add_value(value);
        }
    }

    pub fn source_metric(&self, name: &str) -> Option<&RuntimeMetric> {
        self.source_metrics.get(name)
    }
}
