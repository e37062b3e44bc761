//! Interpreter pool.
//!
//! A semaphore counts idle interpreters; the interpreters themselves sit in a
//! plain vector. Acquiring takes a permit and forgets it, releasing pushes the
//! interpreter back and adds the permit again, so `available()` is always the
//! number of interpreters waiting in the vector.
//!
//! The pool-available gauge is written while the vector is locked, so it
//! never trails a concurrent release.
//!
//! Shutdown closes the semaphore. Waiting acquirers fail right away, and
//! interpreters released afterwards are dropped instead of being parked.
//!
//! Interpreters that come back with a dead worker, or whose worker never
//! came back from an interrupt, are replaced by freshly spawned ones so the
//! pool keeps its size outside of a drain.

use evalpool_common::protocol::error::{AcquireError, EvalError, Result};
use evalpool_metrics::ExecutionObserver;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Semaphore};

use crate::runtime::interpreter::{Interpreter, InterpreterFactory};

pub struct InterpreterPool {
    idle: Mutex<Vec<Interpreter>>,
    permits: Semaphore,
    capacity: usize,
    lost: AtomicUsize,
    abandoned: AtomicUsize,
    shutting_down: AtomicBool,
    factory: InterpreterFactory,
    observer: Arc<dyn ExecutionObserver>,
    errors: mpsc::UnboundedSender<EvalError>,
}

impl InterpreterPool {
    /// Spawns `size` interpreters up front.
    ///
    /// # Errors
    ///
    /// Fails with the first interpreter error; interpreters already started
    /// are shut down again.
    pub fn new(
        size: usize,
        factory: InterpreterFactory,
        observer: Arc<dyn ExecutionObserver>,
        errors: mpsc::UnboundedSender<EvalError>,
    ) -> Result<Self> {
        let mut idle = Vec::with_capacity(size);
        for slot in 0..size {
            idle.push(factory.spawn(slot)?);
        }

        observer.set_pool_capacity(size);
        observer.set_pool_available(size);
        tracing::info!("Interpreter pool ready with {} interpreters", size);

        Ok(Self {
            idle: Mutex::new(idle),
            permits: Semaphore::new(size),
            capacity: size,
            lost: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            factory,
            observer,
            errors,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Interpreters that are idle right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Interpreters that were discarded and could not be replaced.
    pub fn lost(&self) -> usize {
        self.lost.load(Ordering::Relaxed)
    }

    /// Interpreters given up on while their worker was still running a
    /// script, since startup.
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Waits for an idle interpreter, or until `cancel` resolves.
    pub async fn acquire_with<F>(&self, cancel: F) -> std::result::Result<Interpreter, AcquireError>
    where
        F: Future<Output = ()>,
    {
        if self.is_shutting_down() {
            return Err(AcquireError::ShuttingDown);
        }

        let permit = tokio::select! {
            biased;
            permit = self.permits.acquire() => permit.map_err(|_| AcquireError::ShuttingDown)?,
            _ = cancel => return Err(AcquireError::Cancelled),
        };
        permit.forget();

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let interpreter = idle.pop().ok_or(AcquireError::ShuttingDown)?;
        self.observer.set_pool_available(idle.len());
        Ok(interpreter)
    }

    /// Waits for an idle interpreter with no way to give up other than
    /// shutdown.
    pub async fn acquire(&self) -> std::result::Result<Interpreter, AcquireError> {
        self.acquire_with(std::future::pending()).await
    }

    /// Returns an idle interpreter to the pool.
    ///
    /// One whose worker has exited is replaced in the background.
    pub fn release(self: &Arc<Self>, interpreter: Interpreter) {
        if !interpreter.is_alive() && !self.is_shutting_down() {
            tracing::warn!(
                "Interpreter {} came back without a worker, replacing",
                interpreter.slot()
            );
            tokio::spawn(self.clone().replace(interpreter));
            return;
        }
        self.park(interpreter);
    }

    fn park(&self, interpreter: Interpreter) {
        if self.is_shutting_down() {
            tracing::debug!("Dropping interpreter {} on release", interpreter.slot());
            return;
        }

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.push(interpreter);
        self.permits.add_permits(1);
        self.observer.set_pool_available(idle.len());
    }

    /// Discards `stale` and fills its slot with a freshly spawned interpreter.
    ///
    /// If the new interpreter cannot be created the pool shrinks by one and
    /// the failure is published on the engine's error channel.
    pub async fn replace(self: Arc<Self>, stale: Interpreter) {
        let slot = stale.slot();
        drop(stale);
        self.refill(slot).await;
    }

    /// Gives up on an interpreter whose worker ignored its interrupt and
    /// fills the slot like [`replace`](Self::replace).
    ///
    /// The worker thread cannot be stopped from outside. It keeps running
    /// until its script returns on its own, counted in the abandoned-worker
    /// gauge until then, and the abandonment is published on the engine's
    /// error channel.
    pub async fn abandon(self: Arc<Self>, stuck: Interpreter) {
        let slot = stuck.slot();
        if stuck.abandon(self.observer.clone()) {
            let total = self.abandoned.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::error!(
                "Interpreter {} abandoned with its worker still busy ({} so far)",
                slot,
                total
            );
            let _ = self.errors.send(EvalError::Interpreter(format!(
                "interpreter {} abandoned while still running a script",
                slot
            )));
        }
        self.refill(slot).await;
    }

    async fn refill(self: Arc<Self>, slot: usize) {
        if self.is_shutting_down() {
            return;
        }

        let factory = self.factory.clone();
        match tokio::task::spawn_blocking(move || factory.spawn(slot)).await {
            Ok(Ok(fresh)) => {
                tracing::info!("Interpreter {} replaced", slot);
                self.park(fresh);
            }
            Ok(Err(e)) => self.record_loss(slot, e),
            Err(join) => self.record_loss(slot, EvalError::Interpreter(join.to_string())),
        }
    }

    fn record_loss(&self, slot: usize, cause: EvalError) {
        let lost = self.lost.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::error!(
            "Interpreter {} could not be replaced ({} lost): {}",
            slot,
            lost,
            cause
        );
        let _ = self.errors.send(EvalError::Interpreter(format!(
            "interpreter {} could not be replaced: {}",
            slot, cause
        )));
    }

    /// Stops handing out interpreters. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            self.permits.close();
            tracing::info!("Interpreter pool shutting down");
        }
    }

    /// Drops every idle interpreter, which stops their worker threads.
    pub fn teardown(&self) -> usize {
        let drained: Vec<Interpreter> = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        self.observer.set_pool_available(0);
        drained.len()
    }
}
