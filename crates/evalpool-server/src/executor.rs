//! Execution coordinator.
//!
//! Runs one script on a pooled interpreter under a deadline:
//!
//! 1. acquire an interpreter (bounded only by the caller's cancellation)
//! 2. dispatch the script and arm a watchdog for the deadline
//! 3. the first of "script reported back" and "watchdog fired" decides the
//!    outcome
//!
//! An interpreter goes back to the pool only once its worker has reported
//! that it is idle. When the watchdog wins, the caller gets
//! [`EvalError::Timeout`] right away while a background reclaim task waits
//! up to the interrupt grace period for that report. Interpreters that
//! report themselves unhealthy are replaced instead of recycled; those that
//! do not report in time are abandoned and replaced.

use evalpool_common::protocol::error::{EvalError, Result};
use evalpool_metrics::{ExecutionObserver, ExecutionStatus};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};

use crate::runtime::{Interpreter, InterpreterPool, ScriptOutcome, ScriptReport};

/// Result of one execution, with the time it took from the acquisition
/// request to the outcome.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub result: Result<JsonValue>,
    pub elapsed: Duration,
    pub request_id: Option<String>,
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        status_of(&self.result)
    }
}

fn status_of(result: &Result<JsonValue>) -> ExecutionStatus {
    match result {
        Ok(_) => ExecutionStatus::Success,
        Err(EvalError::Timeout(_)) => ExecutionStatus::Timeout,
        Err(EvalError::Acquisition(_)) => ExecutionStatus::Unavailable,
        Err(_) => ExecutionStatus::Error,
    }
}

/// Counts executions and reclaim tasks that have not finished yet.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(self.clone())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Resolves once the count drops to zero.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct Executor {
    supervisor: Supervisor,
    default_timeout: Duration,
}

impl Executor {
    pub fn new(
        pool: Arc<InterpreterPool>,
        observer: Arc<dyn ExecutionObserver>,
        default_timeout: Duration,
        interrupt_grace: Duration,
    ) -> Self {
        Self {
            supervisor: Supervisor {
                pool,
                observer,
                in_flight: Arc::new(InFlight::new()),
                interrupt_grace,
            },
            default_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<InterpreterPool> {
        &self.supervisor.pool
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.supervisor.in_flight
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Runs `code` with no way to abandon the acquisition wait.
    pub async fn execute(
        &self,
        code: String,
        timeout: Option<Duration>,
        request_id: Option<String>,
    ) -> ExecutionOutcome {
        self.execute_with_cancel(code, timeout, request_id, std::future::pending())
            .await
    }

    /// Runs `code` on a pooled interpreter.
    ///
    /// `timeout` bounds the script's run time only; `cancel` bounds the wait
    /// for a free interpreter. `None` uses the configured default deadline.
    ///
    /// Once an interpreter is acquired the script runs on its own task.
    /// Dropping the returned future stops the wait for the outcome, not the
    /// execution: the deadline still applies and the interpreter still goes
    /// back to the pool.
    pub async fn execute_with_cancel<F>(
        &self,
        code: String,
        timeout: Option<Duration>,
        request_id: Option<String>,
        cancel: F,
    ) -> ExecutionOutcome
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let supervisor = &self.supervisor;
        let _guard = supervisor.in_flight.enter();
        supervisor.observer.record_code_size(code.len());

        let (result, elapsed) = match supervisor.pool.acquire_with(cancel).await {
            Ok(interpreter) => {
                let limit = timeout.unwrap_or(self.default_timeout);
                let supervisor = supervisor.clone();
                let guard = supervisor.in_flight.enter();
                let id = request_id.clone();

                let execution = tokio::spawn(async move {
                    let _guard = guard;
                    let result = supervisor.run(interpreter, code, limit, id.clone()).await;
                    let elapsed = supervisor.finish(&result, started, id.as_deref());
                    (result, elapsed)
                });

                match execution.await {
                    Ok(finished) => finished,
                    Err(e) => (
                        Err(EvalError::Interpreter(format!("execution task failed: {}", e))),
                        started.elapsed(),
                    ),
                }
            }
            Err(e) => {
                tracing::warn!("Could not acquire interpreter: {}", e);
                let result = Err(EvalError::Acquisition(e));
                let elapsed = supervisor.finish(&result, started, request_id.as_deref());
                (result, elapsed)
            }
        };

        ExecutionOutcome {
            result,
            elapsed,
            request_id,
        }
    }
}

/// What a running execution needs from its executor. Owned by the
/// execution's task, so the script stays watched after the caller is gone.
#[derive(Clone)]
struct Supervisor {
    pool: Arc<InterpreterPool>,
    observer: Arc<dyn ExecutionObserver>,
    in_flight: Arc<InFlight>,
    interrupt_grace: Duration,
}

impl Supervisor {
    /// Records the final status and returns the execution's duration.
    fn finish(
        &self,
        result: &Result<JsonValue>,
        started: Instant,
        request_id: Option<&str>,
    ) -> Duration {
        let status = status_of(result);
        self.observer.record_execution(status, started);
        let elapsed = started.elapsed();
        tracing::debug!(
            request_id = request_id.unwrap_or(""),
            "Execution finished with status {} in {:?}",
            status,
            elapsed
        );
        elapsed
    }

    async fn run(
        &self,
        interpreter: Interpreter,
        code: String,
        limit: Duration,
        request_id: Option<String>,
    ) -> Result<JsonValue> {
        let slot = interpreter.slot();
        let (interrupt_tx, interrupt_rx) = oneshot::channel();

        let mut report_rx = match interpreter.dispatch(code, request_id, interrupt_rx) {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!("Dispatch to interpreter {} failed: {}", slot, e);
                self.recycle(interpreter, false);
                return Err(e);
            }
        };

        self.observer.execution_started();
        tracing::debug!("Interpreter {} running script (limit {:?})", slot, limit);

        let deadline = tokio::time::Instant::now() + limit;
        let (disarm_tx, disarm_rx) = oneshot::channel::<()>();
        let mut watchdog = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = interrupt_tx.send(());
                }
                _ = disarm_rx => {}
            }
        });

        let result = tokio::select! {
            biased;
            report = &mut report_rx => {
                drop(disarm_tx);
                let _ = (&mut watchdog).await;
                self.settle(interpreter, report, limit)
            }
            _ = &mut watchdog => {
                tracing::warn!(
                    "Interpreter {} exceeded {}ms, interrupting",
                    slot,
                    millis(limit)
                );
                self.spawn_reclaim(interpreter, report_rx);
                Err(EvalError::Timeout(millis(limit)))
            }
        };

        self.observer.execution_finished();
        result
    }

    fn settle(
        &self,
        interpreter: Interpreter,
        report: std::result::Result<ScriptReport, oneshot::error::RecvError>,
        limit: Duration,
    ) -> Result<JsonValue> {
        let slot = interpreter.slot();
        match report {
            Ok(ScriptReport { outcome, healthy }) => {
                self.recycle(interpreter, healthy);
                match outcome {
                    ScriptOutcome::Completed(result) => result,
                    // The watchdog fired while the report was already on its way.
                    ScriptOutcome::Interrupted => Err(EvalError::Timeout(millis(limit))),
                }
            }
            Err(_) => {
                self.recycle(interpreter, false);
                Err(EvalError::Interpreter(format!(
                    "interpreter {} stopped without reporting",
                    slot
                )))
            }
        }
    }

    /// Puts a finished interpreter back, or replaces it in the background.
    fn recycle(&self, interpreter: Interpreter, healthy: bool) {
        if healthy {
            self.pool.release(interpreter);
            return;
        }

        let pool = self.pool.clone();
        let guard = self.in_flight.enter();
        tokio::spawn(async move {
            let _guard = guard;
            pool.replace(interpreter).await;
        });
    }

    /// Waits for a timed-out script to honor its interrupt, then releases or
    /// replaces its interpreter. A worker that never answers is abandoned.
    fn spawn_reclaim(
        &self,
        interpreter: Interpreter,
        report_rx: oneshot::Receiver<ScriptReport>,
    ) {
        let pool = self.pool.clone();
        let grace = self.interrupt_grace;
        let guard = self.in_flight.enter();

        tokio::spawn(async move {
            let _guard = guard;
            let slot = interpreter.slot();
            match tokio::time::timeout(grace, report_rx).await {
                Ok(Ok(report)) if report.healthy => {
                    tracing::debug!("Interpreter {} honored its interrupt", slot);
                    pool.release(interpreter);
                }
                Ok(_) => {
                    tracing::warn!("Interpreter {} is unusable after interrupt, replacing", slot);
                    pool.replace(interpreter).await;
                }
                Err(_) => {
                    tracing::warn!(
                        "Interpreter {} ignored its interrupt for {:?}, abandoning",
                        slot,
                        grace
                    );
                    pool.abandon(interpreter).await;
                }
            }
        });
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::InterpreterFactory;
    use evalpool_common::protocol::error::AcquireError;
    use evalpool_metrics::{CustomMetricsRegistry, EngineMetricsCollector};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn executor_with_grace(
        size: usize,
        grace: Duration,
    ) -> (
        Executor,
        Arc<EngineMetricsCollector>,
        mpsc::UnboundedReceiver<EvalError>,
    ) {
        let custom = Arc::new(CustomMetricsRegistry::new());
        let collector = Arc::new(EngineMetricsCollector::new(custom.clone()));
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let pool = InterpreterPool::new(
            size,
            InterpreterFactory::new(1024, custom),
            collector.clone(),
            errors_tx,
        )
        .unwrap();
        let executor = Executor::new(
            Arc::new(pool),
            collector.clone(),
            Duration::from_secs(5),
            grace,
        );
        (executor, collector, errors)
    }

    fn executor(size: usize) -> (Executor, Arc<EngineMetricsCollector>) {
        let (executor, collector, _) = executor_with_grace(size, Duration::from_millis(500));
        (executor, collector)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(&Ok(json!(1))), ExecutionStatus::Success);
        assert_eq!(status_of(&Err(EvalError::Timeout(5))), ExecutionStatus::Timeout);
        assert_eq!(
            status_of(&Err(EvalError::Acquisition(AcquireError::Cancelled))),
            ExecutionStatus::Unavailable
        );
        assert_eq!(
            status_of(&Err(EvalError::Script("x".into()))),
            ExecutionStatus::Error
        );
        assert_eq!(
            status_of(&Err(EvalError::Conversion("x".into()))),
            ExecutionStatus::Error
        );
    }

    #[tokio::test]
    async fn test_in_flight_wait_idle() {
        let in_flight = Arc::new(InFlight::new());
        in_flight.wait_idle().await;

        let guard = in_flight.enter();
        assert_eq!(in_flight.count(), 1);

        let waiter = {
            let in_flight = in_flight.clone();
            tokio::spawn(async move { in_flight.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(in_flight.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_success_records_metrics() {
        let (executor, collector) = executor(1);
        let outcome = executor
            .execute("1 + 2".into(), None, Some("abc".into()))
            .await;
        assert_eq!(outcome.result.unwrap(), json!(3));
        assert_eq!(outcome.request_id.as_deref(), Some("abc"));

        let registry = collector.registry();
        assert_eq!(registry.status_count(ExecutionStatus::Success), 1);
        assert_eq!(registry.total_executions(), 1);
        assert_eq!(registry.active_executions(), 0);
        assert_eq!(executor.pool().available(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_returns_promptly_and_reclaims() {
        let (executor, collector) = executor(1);
        let outcome = executor
            .execute("while (true) {}".into(), Some(Duration::from_millis(100)), None)
            .await;

        assert!(matches!(outcome.result, Err(EvalError::Timeout(100))));
        assert!(outcome.elapsed >= Duration::from_millis(100));
        assert!(outcome.elapsed < Duration::from_millis(600));

        executor.in_flight().wait_idle().await;
        assert_eq!(executor.pool().available(), 1);
        assert_eq!(
            collector.registry().status_count(ExecutionStatus::Timeout),
            1
        );

        let next = executor.execute("'alive'".into(), None, None).await;
        assert_eq!(next.result.unwrap(), json!("alive"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_acquisition_is_unavailable() {
        let (executor, collector) = executor(1);
        let executor = Arc::new(executor);

        let blocker = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .execute(
                        "while (true) {}".into(),
                        Some(Duration::from_millis(300)),
                        None,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = executor
            .execute_with_cancel(
                "1".into(),
                None,
                None,
                tokio::time::sleep(Duration::from_millis(20)),
            )
            .await;
        assert!(matches!(
            outcome.result,
            Err(EvalError::Acquisition(AcquireError::Cancelled))
        ));
        assert_eq!(
            collector.registry().status_count(ExecutionStatus::Unavailable),
            1
        );

        assert!(blocker.await.unwrap().result.unwrap_err().is_timeout());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropped_caller_still_returns_interpreter() {
        let (executor, collector) = executor(1);
        let executor = Arc::new(executor);

        let caller = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .execute(
                        "var i = 0; while (true) { i++; }".into(),
                        Some(Duration::from_millis(300)),
                        None,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        executor.in_flight().wait_idle().await;
        assert_eq!(executor.pool().available(), 1);
        assert_eq!(executor.pool().lost(), 0);

        let registry = collector.registry();
        assert_eq!(registry.active_executions(), 0);
        assert_eq!(registry.status_count(ExecutionStatus::Timeout), 1);

        let next = executor.execute("'free'".into(), None, None).await;
        assert_eq!(next.result.unwrap(), json!("free"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_stuck_in_native_callback_is_abandoned() {
        let (executor, collector, mut errors) =
            executor_with_grace(1, Duration::from_millis(100));
        let stuck = "[1].forEach(function () { \
                     var end = Date.now() + 1500; while (Date.now() < end) {} }); 'done'";

        let outcome = executor
            .execute(stuck.into(), Some(Duration::from_millis(100)), None)
            .await;
        assert!(matches!(outcome.result, Err(EvalError::Timeout(100))));
        assert!(outcome.elapsed < Duration::from_millis(600));

        executor.in_flight().wait_idle().await;
        assert_eq!(executor.pool().abandoned(), 1);
        assert_eq!(executor.pool().available(), 1);
        assert_eq!(collector.registry().abandoned_workers(), 1);
        assert!(matches!(errors.try_recv(), Ok(EvalError::Interpreter(_))));

        // The replacement serves work while the old thread is still busy.
        let next = executor.execute("'fresh'".into(), None, None).await;
        assert_eq!(next.result.unwrap(), json!("fresh"));

        let deadline = Instant::now() + Duration::from_secs(10);
        while collector.registry().abandoned_workers() != 0 {
            assert!(Instant::now() < deadline, "abandoned worker never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
