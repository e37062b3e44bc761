//! Job queue for promises and native async jobs.
//!
//! Each interpreter owns one [`ScriptJobExecutor`]. After a script finishes
//! evaluating, the interpreter drains the queue with
//! [`run_jobs_async`](JobExecutor::run_jobs_async) so that a completion value
//! which is a promise gets a chance to settle. The async drain yields to the
//! interpreter thread's runtime between rounds, so an endless chain of
//! reactions can still be interrupted between two jobs. A single reaction
//! that never returns cannot; see [`crate::runtime::interpreter`].
//!
//! # Job Types
//!
//! - **PromiseJob**: microtasks (`then`/`catch` reactions)
//! - **AsyncJob**: native async jobs
//! - **GenericJob**: host-defined macrotasks
//!
//! Timeout jobs (`setTimeout`) are not supported; no timer globals are
//! installed.

use boa_engine::{
    context::Context,
    job::{GenericJob, Job, JobExecutor, NativeAsyncJob, PromiseJob},
    JsResult,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Default)]
pub struct ScriptJobExecutor {
    promise_jobs: RefCell<VecDeque<PromiseJob>>,
    async_jobs: RefCell<VecDeque<NativeAsyncJob>>,
    generic_jobs: RefCell<VecDeque<GenericJob>>,
}

impl ScriptJobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_pending_jobs(&self) -> bool {
        !self.promise_jobs.borrow().is_empty()
            || !self.async_jobs.borrow().is_empty()
            || !self.generic_jobs.borrow().is_empty()
    }

    /// Drops every queued job without running it.
    ///
    /// Used when a script is interrupted: its pending reactions belong to a
    /// context that is about to be rebuilt.
    pub fn clear(&self) {
        self.promise_jobs.borrow_mut().clear();
        self.async_jobs.borrow_mut().clear();
        self.generic_jobs.borrow_mut().clear();
    }

    /// Runs one generic job, then every promise job queued so far.
    fn drain_sync(&self, context: &mut Context) {
        let generic = self.generic_jobs.borrow_mut().pop_front();
        if let Some(generic) = generic {
            if let Err(err) = generic.call(context) {
                tracing::debug!("Uncaught error in generic job: {err}");
            }
        }

        let jobs = std::mem::take(&mut *self.promise_jobs.borrow_mut());
        for job in jobs {
            if let Err(err) = job.call(context) {
                tracing::debug!("Uncaught error in promise job: {err}");
            }
        }

        context.clear_kept_objects();
    }
}

impl JobExecutor for ScriptJobExecutor {
    fn enqueue_job(self: Rc<Self>, job: Job, _context: &mut Context) {
        match job {
            Job::PromiseJob(job) => self.promise_jobs.borrow_mut().push_back(job),
            Job::AsyncJob(job) => self.async_jobs.borrow_mut().push_back(job),
            Job::GenericJob(job) => self.generic_jobs.borrow_mut().push_back(job),
            _ => tracing::warn!("Unsupported job type enqueued by script, ignoring"),
        }
    }

    /// Synchronous drain. Async jobs are skipped here; they only make progress
    /// through [`run_jobs_async`](Self::run_jobs_async).
    fn run_jobs(self: Rc<Self>, context: &mut Context) -> JsResult<()> {
        while !self.promise_jobs.borrow().is_empty() || !self.generic_jobs.borrow().is_empty() {
            self.drain_sync(context);
        }
        Ok(())
    }

    async fn run_jobs_async(self: Rc<Self>, context: &RefCell<&mut Context>) -> JsResult<()>
    where
        Self: Sized,
    {
        loop {
            if !self.has_pending_jobs() {
                return Ok(());
            }

            let async_jobs = std::mem::take(&mut *self.async_jobs.borrow_mut());
            for job in async_jobs {
                if let Err(err) = job.call(context).await {
                    tracing::debug!("Uncaught error in async job: {err}");
                }
            }

            self.drain_sync(&mut context.borrow_mut());
            tokio::task::yield_now().await;
        }
    }
}
