pub mod context;
pub mod interpreter;
pub mod pool;

mod bindings;
mod conversions;
mod job_executor;


pub use bindings::SCRIPT_LOG_TARGET;
pub use context::{InterpreterSettings, ScriptContext};
pub use conversions::{MAX_EXPORT_DEPTH, MAX_EXPORT_ITEMS};
pub use interpreter::{Interpreter, InterpreterFactory, ScriptOutcome, ScriptReport};
pub use pool::InterpreterPool;
