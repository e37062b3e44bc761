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

//! evalpool Metrics Collection
//!
//! Observability for the pooled script engine. Nothing in this crate gates
//! control flow: the engine reports into it and callers read snapshots out.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: lock-free counters, gauges and histograms describing
//!   executions (per final status), submitted code sizes and pool occupancy
//! - [`ExecutionObserver`]: the seam the engine reports through; implemented by
//!   [`EngineMetricsCollector`]
//! - [`CustomMetricsRegistry`]: metrics created at runtime by scripts through
//!   the sandbox `metrics.*` bindings, shared by every interpreter
//! - [`MetricsSnapshot`]: serializable view served by the `_metrics` method
//!
//! # Usage Example
//!
//! ```rust
//! use evalpool_metrics::{
//!     CustomMetricsRegistry, EngineMetricsCollector, ExecutionObserver, ExecutionStatus,
//! };
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! let custom = Arc::new(CustomMetricsRegistry::new());
//! let collector = EngineMetricsCollector::new(custom.clone());
//!
//! let started = Instant::now();
//! collector.record_code_size(24);
//! collector.record_execution(ExecutionStatus::Success, started);
//!
//! custom.increment("jobs_total", &Default::default()).unwrap();
//!
//! let snapshot = collector.snapshot();
//! assert_eq!(snapshot.total_executions, 1);
//! assert_eq!(snapshot.custom.len(), 1);
//! ```
//!
//! # Thread Safety
//!
//! Engine metrics use atomics only. The custom registry guards its name table
//! with an `RwLock` and each metric's series map with its own `Mutex`, so
//! concurrent updates from different interpreters are never lost.

mod collector;
mod custom;
mod histogram;
mod registry;
mod snapshot;

pub use collector::{EngineMetricsCollector, ExecutionObserver};
pub use custom::{
    labels_from_json, CustomMetric, CustomMetricError, CustomMetricsRegistry, LabelSet,
    MetricKind, CUSTOM_METRIC_PREFIX, DEFAULT_BUCKETS,
};
pub use histogram::LogHistogram;
pub use registry::{ExecutionStatus, MetricsRegistry};
pub use snapshot::{
    CustomMetricSnapshot, CustomSeries, HistogramSummary, MetricsSnapshot, PoolMetrics,
    SeriesValue, ServerInfo, StatusMetrics,
};
