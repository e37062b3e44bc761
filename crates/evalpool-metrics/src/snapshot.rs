// Copyright 2025 evalpool Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::custom::{LabelSet, MetricKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Server information served by `_info`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub version: String,
    pub uptime_ms: u64,
    pub pool_size: usize,
}

impl ServerInfo {
    pub fn new(uptime_ms: u64, pool_size: usize) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms,
            pool_size,
        }
    }
}

/// Count, mean and percentiles of a [`LogHistogram`](crate::LogHistogram)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistogramSummary {
    pub count: u64,
    pub avg: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

/// Executions that finished with one particular status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusMetrics {
    pub count: u64,
    /// Duration distribution in microseconds
    pub duration_us: HistogramSummary,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolMetrics {
    pub capacity: u64,
    /// Best-effort; may lag the pool by one acquire or release
    pub available: u64,
    pub active_executions: i64,
    /// Worker threads still running a script nobody waits for any more
    pub abandoned_workers: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SeriesValue {
    Scalar {
        value: f64,
    },
    Distribution {
        count: u64,
        sum: f64,
        /// `(upper bound, cumulative count)`; the implicit `+Inf` bucket equals `count`
        buckets: Vec<(f64, u64)>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomSeries {
    pub labels: LabelSet,
    #[serde(flatten)]
    pub value: SeriesValue,
}

/// One script-defined metric and all of its label series
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomMetricSnapshot {
    pub name: String,
    pub kind: MetricKind,
    pub series: Vec<CustomSeries>,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub total_executions: u64,
    pub uptime_ms: u64,
    /// Keyed by status name (`success`, `error`, `timeout`, `unavailable`)
    pub executions: BTreeMap<String, StatusMetrics>,
    /// Submitted script sizes in bytes
    pub code_size_bytes: HistogramSummary,
    pub pool: PoolMetrics,
    pub custom: Vec<CustomMetricSnapshot>,
}
