//! Sandbox bindings.
//!
//! Native functions exposed to scripts. This is the only place where host
//! functionality is made visible to the JavaScript VM.
//!
//! # JavaScript API
//!
//! - `log.debug|info|warn|error(message, fields?)`
//! - `metrics.increment(name, labels?)`
//! - `metrics.add(name, value, labels?)`
//! - `metrics.gauge(name, value, labels?)` / `metrics.set(name, value, labels?)`
//! - `metrics.histogram(name, value, labels?)` / `metrics.observe(name, value, labels?)`
//!
//! None of these functions ever throw into the script. Bad arguments are
//! logged on the host side and the call becomes a no-op.

use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{FunctionObjectBuilder, JsObject},
    property::Attribute,
    value::JsValue,
    Context, JsResult,
};
use boa_gc::{Finalize, Trace};
use evalpool_common::protocol::error::{EvalError, Result};
use evalpool_metrics::{labels_from_json, CustomMetricsRegistry, LabelSet};
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::runtime::conversions::js_value_to_json;

/// Tracing target of every record emitted through the `log` binding.
pub const SCRIPT_LOG_TARGET: &str = "evalpool::script";

/// Which interpreter is running and on behalf of which request.
///
/// Shared between the interpreter worker (which sets the request id around
/// each execution) and the native functions (which stamp it on log records).
#[derive(Debug)]
pub struct ExecutionScope {
    slot: usize,
    request_id: RefCell<Option<String>>,
}

impl ExecutionScope {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            request_id: RefCell::new(None),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn enter(&self, request_id: Option<String>) {
        *self.request_id.borrow_mut() = request_id;
    }

    pub fn leave(&self) {
        self.request_id.borrow_mut().take();
    }

    pub fn request_id(&self) -> String {
        self.request_id.borrow().clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Trace, Finalize)]
struct LogCaptures {
    #[unsafe_ignore_trace]
    level: LogLevel,
    #[unsafe_ignore_trace]
    scope: Rc<ExecutionScope>,
}

#[derive(Debug, Clone, Copy)]
enum MetricOp {
    Increment,
    Add,
    Set,
    Observe,
}

#[derive(Trace, Finalize)]
struct MetricCaptures {
    #[unsafe_ignore_trace]
    op: MetricOp,
    #[unsafe_ignore_trace]
    registry: Arc<CustomMetricsRegistry>,
    #[unsafe_ignore_trace]
    scope: Rc<ExecutionScope>,
}

/// Installs the `log` and `metrics` globals into a fresh context.
///
/// # Errors
///
/// Returns `EvalError::Interpreter` if an object property or global cannot
/// be defined.
pub(crate) fn install_bindings(
    ctx: &mut Context,
    scope: Rc<ExecutionScope>,
    registry: Arc<CustomMetricsRegistry>,
) -> Result<()> {
    let log = JsObject::with_object_proto(ctx.intrinsics());
    for (name, level) in [
        ("debug", LogLevel::Debug),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
    ] {
        let captures = LogCaptures {
            level,
            scope: scope.clone(),
        };
        let function = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(log_native, captures),
        )
        .name(js_string!(name))
        .length(2)
        .build();

        log.set(js_string!(name), function, false, ctx)
            .map_err(install_error)?;
    }

    let metrics = JsObject::with_object_proto(ctx.intrinsics());
    for (name, op) in [
        ("increment", MetricOp::Increment),
        ("add", MetricOp::Add),
        ("gauge", MetricOp::Set),
        ("set", MetricOp::Set),
        ("histogram", MetricOp::Observe),
        ("observe", MetricOp::Observe),
    ] {
        let captures = MetricCaptures {
            op,
            registry: registry.clone(),
            scope: scope.clone(),
        };
        let function = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(metric_native, captures),
        )
        .name(js_string!(name))
        .length(3)
        .build();

        metrics
            .set(js_string!(name), function, false, ctx)
            .map_err(install_error)?;
    }

    ctx.register_global_property(js_string!("log"), log, Attribute::all())
        .map_err(install_error)?;
    ctx.register_global_property(js_string!("metrics"), metrics, Attribute::all())
        .map_err(install_error)?;

    Ok(())
}

fn install_error(err: boa_engine::JsError) -> EvalError {
    EvalError::Interpreter(format!("failed to install bindings: {}", err))
}

fn log_native(
    _this: &JsValue,
    args: &[JsValue],
    captures: &LogCaptures,
    ctx: &mut Context,
) -> JsResult<JsValue> {
    let message = match args.first() {
        Some(value) if !value.is_undefined() => display_string(value, ctx),
        _ => String::new(),
    };

    let fields = match args.get(1) {
        Some(value) if value.is_object() => js_value_to_json(value, ctx)
            .ok()
            .filter(JsonValue::is_object)
            .unwrap_or_else(|| JsonValue::Object(Default::default())),
        _ => JsonValue::Object(Default::default()),
    };

    emit_log(captures.level, &captures.scope, &message, &fields);
    Ok(JsValue::undefined())
}

fn emit_log(level: LogLevel, scope: &ExecutionScope, message: &str, fields: &JsonValue) {
    let slot = scope.slot();
    let request_id = scope.request_id();
    match level {
        LogLevel::Debug => {
            tracing::debug!(target: SCRIPT_LOG_TARGET, slot, request_id = %request_id, fields = %fields, "{}", message)
        }
        LogLevel::Info => {
            tracing::info!(target: SCRIPT_LOG_TARGET, slot, request_id = %request_id, fields = %fields, "{}", message)
        }
        LogLevel::Warn => {
            tracing::warn!(target: SCRIPT_LOG_TARGET, slot, request_id = %request_id, fields = %fields, "{}", message)
        }
        LogLevel::Error => {
            tracing::error!(target: SCRIPT_LOG_TARGET, slot, request_id = %request_id, fields = %fields, "{}", message)
        }
    }
}

/// String form of a value for log messages. Falls back to the debug display
/// if the value's own `toString` throws.
fn display_string(value: &JsValue, ctx: &mut Context) -> String {
    if let Some(s) = value.as_string() {
        return s.to_std_string_escaped();
    }
    match value.to_string(ctx) {
        Ok(s) => s.to_std_string_escaped(),
        Err(_) => value.display().to_string(),
    }
}

fn metric_native(
    _this: &JsValue,
    args: &[JsValue],
    captures: &MetricCaptures,
    ctx: &mut Context,
) -> JsResult<JsValue> {
    if let Err(reason) = apply_metric(args, captures, ctx) {
        tracing::warn!(
            target: SCRIPT_LOG_TARGET,
            slot = captures.scope.slot(),
            request_id = %captures.scope.request_id(),
            "metrics.{:?} call ignored: {}",
            captures.op,
            reason
        );
    }
    Ok(JsValue::undefined())
}

fn apply_metric(
    args: &[JsValue],
    captures: &MetricCaptures,
    ctx: &mut Context,
) -> std::result::Result<(), String> {
    let name = args
        .first()
        .and_then(|value| value.as_string())
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| "metric name must be a string".to_string())?;

    let (value, label_arg) = match captures.op {
        MetricOp::Increment => (1.0, args.get(1)),
        MetricOp::Add | MetricOp::Set | MetricOp::Observe => {
            let raw = args
                .get(1)
                .filter(|value| !value.is_undefined())
                .ok_or_else(|| "metric value is required".to_string())?;
            let number = raw.to_number(ctx).map_err(|e| e.to_string())?;
            (number, args.get(2))
        }
    };

    let labels = match label_arg {
        Some(raw) if raw.is_object() => {
            let json = js_value_to_json(raw, ctx).map_err(|e| e.to_string())?;
            labels_from_json(&json)
        }
        _ => LabelSet::new(),
    };

    let registry = &captures.registry;
    let outcome = match captures.op {
        MetricOp::Increment => registry.increment(&name, &labels),
        MetricOp::Add => registry.add(&name, value, &labels),
        MetricOp::Set => registry.set(&name, value, &labels),
        MetricOp::Observe => registry.observe(&name, value, &labels),
    };
    outcome.map_err(|e| e.to_string())
}
