use boa_engine::{
    builtins::promise::PromiseState, job::JobExecutor, object::builtins::JsPromise,
    value::JsValue, Context, JsError, Script, Source,
};
use evalpool_common::protocol::error::{EvalError, Result};
use evalpool_metrics::CustomMetricsRegistry;
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::runtime::{
    bindings::{self, ExecutionScope},
    conversions::js_value_to_json,
    job_executor::ScriptJobExecutor,
};

/// Settings shared by every interpreter of one pool.
#[derive(Debug, Clone)]
pub struct InterpreterSettings {
    /// VM instructions executed between two cooperative check-points.
    pub instruction_budget: u32,
    pub custom_metrics: Arc<CustomMetricsRegistry>,
}

/// One Boa context with the sandbox bindings installed.
///
/// Lives on, and never leaves, its interpreter's worker thread: Boa contexts
/// and their garbage-collected heap are thread-local. Global state persists
/// between scripts until [`reset`](Self::reset) rebuilds the realm.
pub struct ScriptContext {
    ctx: Context,
    jobs: Rc<ScriptJobExecutor>,
    scope: Rc<ExecutionScope>,
    settings: InterpreterSettings,
}

impl ScriptContext {
    pub fn new(slot: usize, settings: InterpreterSettings) -> Result<Self> {
        let scope = Rc::new(ExecutionScope::new(slot));
        let (ctx, jobs) = Self::build(&scope, &settings)?;
        Ok(Self {
            ctx,
            jobs,
            scope,
            settings,
        })
    }

    fn build(
        scope: &Rc<ExecutionScope>,
        settings: &InterpreterSettings,
    ) -> Result<(Context, Rc<ScriptJobExecutor>)> {
        let jobs = Rc::new(ScriptJobExecutor::new());
        let mut ctx = Context::builder()
            .job_executor(jobs.clone())
            .build()
            .map_err(|e| EvalError::Interpreter(format!("failed to create context: {}", e)))?;

        bindings::install_bindings(&mut ctx, scope.clone(), settings.custom_metrics.clone())?;
        Ok((ctx, jobs))
    }

    pub fn scope(&self) -> &ExecutionScope {
        &self.scope
    }

    /// Discards the realm and every global the previous scripts left behind.
    pub fn reset(&mut self) -> Result<()> {
        self.jobs.clear();
        let (ctx, jobs) = Self::build(&self.scope, &self.settings)?;
        self.ctx = ctx;
        self.jobs = jobs;
        Ok(())
    }

    /// Evaluates `code` and exports its completion value.
    ///
    /// The VM yields every `instruction_budget` instructions, so the returned
    /// future can be dropped at any yield point to abort the script. After
    /// such an abort the context must be [`reset`](Self::reset) before reuse.
    ///
    /// A completion value that is a promise is settled by draining the job
    /// queue first: fulfilled promises export their value, rejected ones
    /// become script errors, and a promise still pending once the queue is
    /// empty is an error as well.
    pub async fn evaluate(&mut self, code: &str) -> Result<JsonValue> {
        let script = Script::parse(Source::from_bytes(code), None, &mut self.ctx)
            .map_err(|e| self.script_error(e))?;

        let value = script
            .evaluate_async_with_budget(&mut self.ctx, self.settings.instruction_budget)
            .await
            .map_err(|e| self.script_error(e))?;

        let drained = {
            let ctx = RefCell::new(&mut self.ctx);
            self.jobs.clone().run_jobs_async(&ctx).await
        };
        drained.map_err(|e| self.script_error(e))?;

        let value = self.settle(value)?;
        js_value_to_json(&value, &mut self.ctx)
    }

    fn settle(&mut self, value: JsValue) -> Result<JsValue> {
        let Some(obj) = value.as_object() else {
            return Ok(value);
        };
        let Ok(promise) = JsPromise::from_object(obj.clone()) else {
            return Ok(value);
        };

        match promise.state() {
            PromiseState::Fulfilled(result) => Ok(result),
            PromiseState::Rejected(reason) => Err(self.script_error(JsError::from_opaque(reason))),
            PromiseState::Pending => Err(EvalError::Script(
                "script returned a promise that never settled".into(),
            )),
        }
    }

    /// Turns a thrown value into `EvalError::Script`, preferring the
    /// `Name: message` form of native errors.
    fn script_error(&mut self, err: JsError) -> EvalError {
        let message = err
            .try_native(&mut self.ctx)
            .map(|native| native.to_string())
            .unwrap_or_else(|_| err.to_string());
        EvalError::Script(message)
    }
}
