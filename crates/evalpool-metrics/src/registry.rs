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

use crate::histogram::LogHistogram;
use crate::snapshot::{HistogramSummary, PoolMetrics, StatusMetrics};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Final status of one execution.
///
/// Every execution is counted under exactly one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
    /// No interpreter could be acquired (caller cancelled or shutting down)
    Unavailable,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 4] = [
        ExecutionStatus::Success,
        ExecutionStatus::Error,
        ExecutionStatus::Timeout,
        ExecutionStatus::Unavailable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Unavailable => "unavailable",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-status counter plus duration histogram
#[derive(Debug, Default)]
struct StatusStats {
    count: AtomicU64,
    duration_us: LogHistogram,
}

impl StatusStats {
    fn record(&self, duration: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.duration_us
            .record(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX));
    }

    fn snapshot(&self) -> StatusMetrics {
        StatusMetrics {
            count: self.count.load(Ordering::Relaxed),
            duration_us: self.duration_us.summary(),
        }
    }
}

/// Engine-level metrics storage.
///
/// All updates are single atomic operations, so the registry can be shared
/// freely between the coordinator, background reclaim tasks and the metrics
/// endpoint.
///
/// # Gauges
///
/// - `pool_capacity`: fixed after startup
/// - `pool_available`: best-effort mirror of the pool, written after every
///   acquire and release; may transiently diverge from the real pool
/// - `active_executions`: scripts currently in the Running state
/// - `abandoned_workers`: interpreter threads given up on after ignoring an
///   interrupt that are still busy with their script
#[derive(Debug)]
pub struct MetricsRegistry {
    statuses: [StatusStats; 4],
    code_size_bytes: LogHistogram,
    pool_capacity: AtomicU64,
    pool_available: AtomicU64,
    active_executions: AtomicI64,
    abandoned_workers: AtomicI64,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            statuses: Default::default(),
            code_size_bytes: LogHistogram::new(),
            pool_capacity: AtomicU64::new(0),
            pool_available: AtomicU64::new(0),
            active_executions: AtomicI64::new(0),
            abandoned_workers: AtomicI64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Counts one finished execution and its duration.
    pub fn record_execution(&self, status: ExecutionStatus, duration: Duration) {
        self.statuses[status.index()].record(duration);
    }

    pub fn record_code_size(&self, bytes: usize) {
        self.code_size_bytes.record(bytes as u64);
    }

    pub fn set_pool_capacity(&self, capacity: usize) {
        self.pool_capacity.store(capacity as u64, Ordering::Relaxed);
    }

    pub fn set_pool_available(&self, available: usize) {
        self.pool_available.store(available as u64, Ordering::Relaxed);
    }

    pub fn execution_started(&self) {
        self.active_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execution_finished(&self) {
        self.active_executions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn worker_abandoned(&self) {
        self.abandoned_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn abandoned_worker_exited(&self) {
        self.abandoned_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn abandoned_workers(&self) -> i64 {
        self.abandoned_workers.load(Ordering::Relaxed)
    }

    pub fn status_count(&self, status: ExecutionStatus) -> u64 {
        self.statuses[status.index()].count.load(Ordering::Relaxed)
    }

    pub fn total_executions(&self) -> u64 {
        ExecutionStatus::ALL
            .iter()
            .map(|status| self.status_count(*status))
            .sum()
    }

    pub fn pool_available(&self) -> u64 {
        self.pool_available.load(Ordering::Relaxed)
    }

    pub fn active_executions(&self) -> i64 {
        self.active_executions.load(Ordering::Relaxed)
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn executions(&self) -> BTreeMap<String, StatusMetrics> {
        ExecutionStatus::ALL
            .iter()
            .map(|status| {
                (
                    status.as_str().to_string(),
                    self.statuses[status.index()].snapshot(),
                )
            })
            .collect()
    }

    pub fn code_size_summary(&self) -> HistogramSummary {
        self.code_size_bytes.summary()
    }

    pub fn pool(&self) -> PoolMetrics {
        PoolMetrics {
            capacity: self.pool_capacity.load(Ordering::Relaxed),
            available: self.pool_available(),
            active_executions: self.active_executions(),
            abandoned_workers: self.abandoned_workers(),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
