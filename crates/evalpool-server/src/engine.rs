//! Engine lifecycle.
//!
//! ```text
//! Engine::init(config) -> start() -> rpc().execute(..) ... -> stop(grace)
//! ```
//!
//! `start` pre-allocates every interpreter before it returns. `stop` flips
//! the pool into shutdown (pending and future acquisitions fail at once),
//! waits up to `grace` for in-flight executions and reclaim tasks, and then
//! tears the pool down whether or not they finished.
//!
//! Engines own all of their state; any number of them can coexist in one
//! process.

use evalpool_common::protocol::error::{EvalError, Result};
use evalpool_metrics::{CustomMetricsRegistry, EngineMetricsCollector, ExecutionObserver};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{ConfigSource, EngineConfig};
use crate::executor::Executor;
use crate::rpc::ExecuteHandler;
use crate::runtime::{InterpreterFactory, InterpreterPool};

pub struct Engine {
    config: EngineConfig,
    custom_metrics: Arc<CustomMetricsRegistry>,
    collector: Arc<EngineMetricsCollector>,
    executor: Mutex<Option<Arc<Executor>>>,
}

impl Engine {
    /// Builds an engine from the `evalpool` section of `source`.
    ///
    /// # Errors
    ///
    /// `EvalError::NotConfigured` when the section is absent,
    /// `EvalError::InvalidConfig` when it is malformed or out of range.
    pub fn init(source: &dyn ConfigSource) -> Result<Self> {
        let config = EngineConfig::from_source(source)?;
        Self::with_config(config)
    }

    /// Builds an engine from an explicit configuration, with a private
    /// custom-metrics registry.
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        Self::with_registry(config, Arc::new(CustomMetricsRegistry::new()))
    }

    /// Builds an engine whose scripts report custom metrics into `registry`.
    pub fn with_registry(config: EngineConfig, registry: Arc<CustomMetricsRegistry>) -> Result<Self> {
        let config = config.with_defaults();
        config.validate().map_err(EvalError::InvalidConfig)?;

        tracing::info!(
            pool_size = config.pool_size,
            default_timeout_ms = config.default_timeout_ms,
            interrupt_grace_ms = config.interrupt_grace_ms,
            "Engine configured"
        );

        Ok(Self {
            collector: Arc::new(EngineMetricsCollector::new(registry.clone())),
            custom_metrics: registry,
            config,
            executor: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn custom_metrics(&self) -> &Arc<CustomMetricsRegistry> {
        &self.custom_metrics
    }

    pub fn metrics(&self) -> &Arc<EngineMetricsCollector> {
        &self.collector
    }

    pub fn is_started(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<Executor>> {
        self.executor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Spawns the interpreter pool.
    ///
    /// Returns the engine's error channel, on which failures that happen
    /// outside any request (such as an interpreter that could not be
    /// replaced) are published.
    ///
    /// # Errors
    ///
    /// `EvalError::AlreadyStarted` on a second call, or the first
    /// interpreter construction error.
    pub fn start(&self) -> Result<mpsc::UnboundedReceiver<EvalError>> {
        let mut slot = self.executor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(EvalError::AlreadyStarted);
        }

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let observer: Arc<dyn ExecutionObserver> = self.collector.clone();
        let factory =
            InterpreterFactory::new(self.config.instruction_budget, self.custom_metrics.clone());
        let pool = InterpreterPool::new(self.config.pool_size, factory, observer.clone(), errors_tx)?;

        *slot = Some(Arc::new(Executor::new(
            Arc::new(pool),
            observer,
            self.config.default_timeout(),
            self.config.interrupt_grace(),
        )));

        tracing::info!("Engine started with {} interpreters", self.config.pool_size);
        Ok(errors_rx)
    }

    /// Drains and tears down the pool. A no-op on an engine that was never
    /// started or is already stopped.
    ///
    /// Returns once in-flight work finished or `grace` elapsed, whichever
    /// comes first; work still running after `grace` is abandoned.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let Some(executor) = self
            .executor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let pool = executor.pool();
        pool.shutdown();

        let in_flight = executor.in_flight();
        if tokio::time::timeout(grace, in_flight.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                "Degraded shutdown: {} executions still running after {:?}, abandoning them",
                in_flight.count(),
                grace
            );
        }

        let dropped = pool.teardown();
        tracing::info!("Engine stopped ({} idle interpreters released)", dropped);
        Ok(())
    }

    /// The execution surface of a started engine.
    ///
    /// # Errors
    ///
    /// `EvalError::NotStarted` before `start` or after `stop`.
    pub fn rpc(&self) -> Result<ExecuteHandler> {
        let executor = self.current().ok_or(EvalError::NotStarted)?;
        Ok(ExecuteHandler::new(executor, self.collector.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JsonConfigSource;
    use serde_json::json;

    fn small_config() -> EngineConfig {
        EngineConfig::new().with_pool_size(2)
    }

    #[test]
    fn test_init_requires_section() {
        let source = JsonConfigSource::from_value(json!({}));
        assert!(matches!(
            Engine::init(&source),
            Err(EvalError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_init_rejects_invalid_section() {
        let source = JsonConfigSource::from_value(json!({"evalpool": {"pool_size": 0, "default_timeout_ms": 5}}));
        assert!(matches!(
            Engine::init(&source),
            Err(EvalError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_with_config_validates() {
        let config = EngineConfig::new().with_pool_size(1000);
        assert!(matches!(
            Engine::with_config(config),
            Err(EvalError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let engine = Engine::with_config(small_config()).unwrap();
        assert!(!engine.is_started());
        assert!(matches!(engine.rpc(), Err(EvalError::NotStarted)));

        let _errors = engine.start().unwrap();
        assert!(engine.is_started());
        assert!(matches!(engine.start(), Err(EvalError::AlreadyStarted)));
        assert_eq!(engine.metrics().registry().pool().capacity, 2);
        assert!(engine.rpc().is_ok());

        engine.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!engine.is_started());
        assert!(matches!(engine.rpc(), Err(EvalError::NotStarted)));

        // Stopping twice is harmless.
        engine.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let engine = Engine::with_config(small_config()).unwrap();
        engine.stop(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_engines_are_independent() {
        let a = Engine::with_config(small_config()).unwrap();
        let b = Engine::with_config(EngineConfig::new().with_pool_size(1)).unwrap();
        let _ea = a.start().unwrap();
        let _eb = b.start().unwrap();

        a.stop(Duration::from_secs(1)).await.unwrap();
        assert!(b.is_started());
        assert!(b.rpc().is_ok());
        b.stop(Duration::from_secs(1)).await.unwrap();
    }
}
