//! Interpreter workers.
//!
//! An [`Interpreter`] is the `Send` handle to one [`ScriptContext`] living on
//! a dedicated OS thread. The thread runs a single-threaded tokio runtime and
//! serves one [`ScriptTask`] at a time, so an interpreter never runs two
//! scripts concurrently.
//!
//! Every task carries an interrupt receiver. Firing it drops the evaluation
//! future at the next VM check-point; the worker then rebuilds its context
//! and reports whether the rebuild succeeded. A worker that cannot rebuild
//! reports itself unhealthy and exits.
//!
//! Check-points only exist in bytecode run by the VM loop. Script functions
//! called back from native code (`Array.prototype.forEach`, sort comparators,
//! getters hit while exporting) and promise reactions run to completion
//! without one. A worker stuck in such a callback cannot be stopped from
//! outside; the pool [abandons](Interpreter::abandon) it and the thread exits
//! on its own once the callback returns.

use evalpool_common::protocol::error::{EvalError, Result};
use evalpool_metrics::{CustomMetricsRegistry, ExecutionObserver};
use futures::FutureExt;
use serde_json::Value as JsonValue;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, OnceLock};
use std::thread;
use tokio::sync::{mpsc, oneshot};

use crate::runtime::context::{InterpreterSettings, ScriptContext};

/// One script submitted to an interpreter.
pub struct ScriptTask {
    pub code: String,
    pub request_id: Option<String>,
    /// Resolves when the caller wants the script aborted.
    pub interrupt: oneshot::Receiver<()>,
    pub reply: oneshot::Sender<ScriptReport>,
}

/// How a task ended.
#[derive(Debug)]
pub enum ScriptOutcome {
    Completed(Result<JsonValue>),
    Interrupted,
}

/// Sent back once the interpreter is idle again.
#[derive(Debug)]
pub struct ScriptReport {
    pub outcome: ScriptOutcome,
    /// `false` when the interpreter could not restore a usable context and
    /// has shut its worker down.
    pub healthy: bool,
}

const WORKER_RUNNING: u8 = 0;
const WORKER_ABANDONED: u8 = 1;
const WORKER_EXITED: u8 = 2;

/// Lifecycle of one worker thread, shared by its handle and the thread.
#[derive(Default)]
struct WorkerState {
    phase: AtomicU8,
    observer: OnceLock<Arc<dyn ExecutionObserver>>,
}

impl WorkerState {
    fn abandon(&self, observer: Arc<dyn ExecutionObserver>) -> bool {
        // Stored before the exchange so `exited` always finds it.
        let _ = self.observer.set(observer.clone());
        observer.worker_abandoned();

        let still_running = self
            .phase
            .compare_exchange(
                WORKER_RUNNING,
                WORKER_ABANDONED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !still_running {
            observer.abandoned_worker_exited();
        }
        still_running
    }

    fn exited(&self) {
        if self.phase.swap(WORKER_EXITED, Ordering::AcqRel) == WORKER_ABANDONED {
            if let Some(observer) = self.observer.get() {
                observer.abandoned_worker_exited();
            }
        }
    }
}

impl fmt::Debug for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerState")
            .field("phase", &self.phase.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Marks the worker exited however its thread returns.
struct ExitGuard(Arc<WorkerState>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.exited();
    }
}

/// Handle to an interpreter worker thread.
///
/// Dropping the handle closes the task channel; the worker exits as soon as
/// it is idle.
#[derive(Debug)]
pub struct Interpreter {
    slot: usize,
    tasks: mpsc::UnboundedSender<ScriptTask>,
    worker: Arc<WorkerState>,
}

impl Interpreter {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_alive(&self) -> bool {
        !self.tasks.is_closed()
    }

    /// Hands `code` to the worker. The returned receiver yields exactly one
    /// report, after the worker is done with the task.
    pub fn dispatch(
        &self,
        code: String,
        request_id: Option<String>,
        interrupt: oneshot::Receiver<()>,
    ) -> Result<oneshot::Receiver<ScriptReport>> {
        let (reply, report) = oneshot::channel();
        let task = ScriptTask {
            code,
            request_id,
            interrupt,
            reply,
        };
        self.tasks.send(task).map_err(|_| {
            EvalError::Interpreter(format!("interpreter {} is no longer running", self.slot))
        })?;
        Ok(report)
    }

    /// Gives up on the worker without waiting for it.
    ///
    /// Returns `true` when the thread was still running; it then counts in
    /// the observer's abandoned-worker gauge until it exits.
    pub fn abandon(self, observer: Arc<dyn ExecutionObserver>) -> bool {
        self.worker.abandon(observer)
    }

    /// A handle whose worker has already gone away.
    #[cfg(test)]
    pub(crate) fn detached(slot: usize) -> Self {
        let (tasks, _) = mpsc::unbounded_channel();
        let worker = Arc::new(WorkerState::default());
        worker.exited();
        Self {
            slot,
            tasks,
            worker,
        }
    }
}

/// Creates interpreters. Cheap to clone; shared by the pool for
/// replacements.
#[derive(Debug, Clone)]
pub struct InterpreterFactory {
    settings: InterpreterSettings,
}

impl InterpreterFactory {
    pub fn new(instruction_budget: u32, custom_metrics: Arc<CustomMetricsRegistry>) -> Self {
        Self {
            settings: InterpreterSettings {
                instruction_budget,
                custom_metrics,
            },
        }
    }

    /// Starts a worker thread and blocks until its context is ready.
    ///
    /// # Errors
    ///
    /// Returns the worker's initialization error, or `EvalError::Io` if the
    /// thread could not be spawned.
    pub fn spawn(&self, slot: usize) -> Result<Interpreter> {
        let (tasks, inbox) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let settings = self.settings.clone();
        let worker = Arc::new(WorkerState::default());
        let exit = ExitGuard(worker.clone());

        thread::Builder::new()
            .name(format!("evalpool-interp-{}", slot))
            .spawn(move || worker_main(slot, settings, inbox, ready_tx, exit))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::debug!("Interpreter {} ready", slot);
                Ok(Interpreter {
                    slot,
                    tasks,
                    worker,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EvalError::Interpreter(format!(
                "interpreter {} exited during startup",
                slot
            ))),
        }
    }
}

fn worker_main(
    slot: usize,
    settings: InterpreterSettings,
    inbox: mpsc::UnboundedReceiver<ScriptTask>,
    ready: std_mpsc::SyncSender<Result<()>>,
    _exit: ExitGuard,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(EvalError::Io(e)));
            return;
        }
    };

    let mut script_ctx = match ScriptContext::new(slot, settings) {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        return;
    }
    drop(ready);

    runtime.block_on(serve(slot, &mut script_ctx, inbox));
    tracing::debug!("Interpreter {} worker exiting", slot);
}

async fn serve(
    slot: usize,
    script_ctx: &mut ScriptContext,
    mut inbox: mpsc::UnboundedReceiver<ScriptTask>,
) {
    while let Some(task) = inbox.recv().await {
        if !run_task(slot, script_ctx, task).await {
            tracing::error!("Interpreter {} could not restore its context, retiring", slot);
            break;
        }
    }
}

/// Runs one task and reports. Returns the interpreter's health.
async fn run_task(slot: usize, script_ctx: &mut ScriptContext, task: ScriptTask) -> bool {
    let ScriptTask {
        code,
        request_id,
        mut interrupt,
        reply,
    } = task;

    script_ctx.scope().enter(request_id);

    let (outcome, needs_reset) = {
        let evaluation = AssertUnwindSafe(script_ctx.evaluate(&code)).catch_unwind();
        tokio::select! {
            biased;
            Ok(()) = &mut interrupt => (ScriptOutcome::Interrupted, true),
            finished = evaluation => match finished {
                Ok(result) => (ScriptOutcome::Completed(result), false),
                Err(_) => {
                    tracing::error!("Interpreter {} panicked while evaluating", slot);
                    let error = EvalError::Interpreter("interpreter panicked".into());
                    (ScriptOutcome::Completed(Err(error)), true)
                }
            },
        }
    };

    script_ctx.scope().leave();

    let healthy = if needs_reset {
        match script_ctx.reset() {
            Ok(()) => {
                tracing::debug!("Interpreter {} context rebuilt", slot);
                true
            }
            Err(e) => {
                tracing::error!("Interpreter {} reset failed: {}", slot, e);
                false
            }
        }
    } else {
        true
    };

    // The coordinator may have given up waiting; nothing to do then.
    let _ = reply.send(ScriptReport { outcome, healthy });
    healthy
}
