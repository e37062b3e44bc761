//! Execution call surface handed out by [`Engine::rpc`](crate::Engine::rpc).

use evalpool_common::protocol::{ExecuteRequest, ExecuteResponse};
use evalpool_metrics::{EngineMetricsCollector, ExecutionObserver, MetricsSnapshot, ServerInfo};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::executor::Executor;

/// Runs [`ExecuteRequest`]s. Cheap to clone.
///
/// Every outcome is an [`ExecuteResponse`]: an empty `error` means success,
/// anything else describes the validation, acquisition, script or timeout
/// failure. Empty code is rejected before the pool is touched.
#[derive(Clone)]
pub struct ExecuteHandler {
    executor: Arc<Executor>,
    collector: Arc<EngineMetricsCollector>,
}

impl ExecuteHandler {
    pub(crate) fn new(executor: Arc<Executor>, collector: Arc<EngineMetricsCollector>) -> Self {
        Self {
            executor,
            collector,
        }
    }

    pub async fn execute(&self, request: ExecuteRequest) -> ExecuteResponse {
        self.execute_with_cancel(request, std::future::pending())
            .await
    }

    /// Like [`execute`](Self::execute), but gives up waiting for a free
    /// interpreter once `cancel` resolves.
    pub async fn execute_with_cancel<F>(&self, request: ExecuteRequest, cancel: F) -> ExecuteResponse
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();

        if let Err(e) = request.validate() {
            tracing::debug!("Rejected request: {}", e);
            return ExecuteResponse::failure(&e, elapsed_ms(started), request.request_id);
        }

        let timeout = request.timeout();
        let ExecuteRequest {
            code, request_id, ..
        } = request;

        let outcome = self
            .executor
            .execute_with_cancel(code, timeout, request_id, cancel)
            .await;

        match outcome.result {
            Ok(value) => ExecuteResponse::success(value, elapsed_ms(started), outcome.request_id),
            Err(e) => ExecuteResponse::failure(&e, elapsed_ms(started), outcome.request_id),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.collector.snapshot()
    }

    pub fn info(&self) -> ServerInfo {
        self.collector.info()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
