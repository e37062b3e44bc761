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

use crate::custom::CustomMetricsRegistry;
use crate::registry::{ExecutionStatus, MetricsRegistry};
use crate::snapshot::{MetricsSnapshot, ServerInfo};
use std::sync::Arc;
use std::time::Instant;

/// Seam through which the engine reports what it is doing.
///
/// The engine never reads back from an observer to make decisions; every
/// method is fire-and-forget. Implementations must be cheap and must not
/// block, they are called on the execution hot path.
///
/// # Reporting Order
///
/// For one execution the engine calls, in order:
///
/// 1. `record_code_size` once, before acquisition
/// 2. `set_pool_available` after a successful acquire
/// 3. `execution_started` / `execution_finished` around the Running state
/// 4. `set_pool_available` again after the interpreter went back to the pool
/// 5. `record_execution` exactly once, with the final status
pub trait ExecutionObserver: Send + Sync {
    fn record_code_size(&self, bytes: usize);

    /// Records the final status; duration is measured from `started`.
    fn record_execution(&self, status: ExecutionStatus, started: Instant);

    fn execution_started(&self);

    fn execution_finished(&self);

    fn set_pool_capacity(&self, capacity: usize);

    fn set_pool_available(&self, available: usize);

    /// An interpreter was dropped from the pool while its thread was still
    /// running a script.
    fn worker_abandoned(&self);

    /// A thread reported through `worker_abandoned` has finished.
    fn abandoned_worker_exited(&self);

    fn snapshot(&self) -> MetricsSnapshot;

    fn info(&self) -> ServerInfo;
}

/// Default observer backed by a [`MetricsRegistry`] and the engine's
/// [`CustomMetricsRegistry`].
///
/// # Example
///
/// ```rust
/// use evalpool_metrics::{CustomMetricsRegistry, EngineMetricsCollector, ExecutionObserver};
/// use std::sync::Arc;
///
/// let collector = EngineMetricsCollector::new(Arc::new(CustomMetricsRegistry::new()));
/// collector.set_pool_capacity(4);
/// assert_eq!(collector.info().pool_size, 4);
/// ```
pub struct EngineMetricsCollector {
    registry: Arc<MetricsRegistry>,
    custom: Arc<CustomMetricsRegistry>,
}

impl EngineMetricsCollector {
    pub fn new(custom: Arc<CustomMetricsRegistry>) -> Self {
        Self {
            registry: Arc::new(MetricsRegistry::new()),
            custom,
        }
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn custom_metrics(&self) -> &Arc<CustomMetricsRegistry> {
        &self.custom
    }
}

impl ExecutionObserver for EngineMetricsCollector {
    fn record_code_size(&self, bytes: usize) {
        self.registry.record_code_size(bytes);
    }

    fn record_execution(&self, status: ExecutionStatus, started: Instant) {
        self.registry.record_execution(status, started.elapsed());
    }

    fn execution_started(&self) {
        self.registry.execution_started();
    }

    fn execution_finished(&self) {
        self.registry.execution_finished();
    }

    fn set_pool_capacity(&self, capacity: usize) {
        self.registry.set_pool_capacity(capacity);
    }

    fn set_pool_available(&self, available: usize) {
        self.registry.set_pool_available(available);
    }

    fn worker_abandoned(&self) {
        self.registry.worker_abandoned();
    }

    fn abandoned_worker_exited(&self) {
        self.registry.abandoned_worker_exited();
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_executions: self.registry.total_executions(),
            uptime_ms: self.registry.uptime_ms(),
            executions: self.registry.executions(),
            code_size_bytes: self.registry.code_size_summary(),
            pool: self.registry.pool(),
            custom: self.custom.snapshot(),
        }
    }

    fn info(&self) -> ServerInfo {
        ServerInfo::new(
            self.registry.uptime_ms(),
            self.registry.pool().capacity as usize,
        )
    }
}
