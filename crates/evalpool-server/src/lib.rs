//! evalpool server
//!
//! Runs untrusted JavaScript snippets on a fixed pool of Boa interpreters,
//! each execution bounded by a wall-clock deadline.
//!
//! - [`Engine`]: configuration, startup and graceful shutdown
//! - [`ExecuteHandler`]: the execution call
//! - [`http_server::HttpServer`]: JSON-RPC over HTTP on top of the handler

pub mod config;
pub mod engine;
pub mod executor;
pub mod http_router;
pub mod http_server;
pub mod rpc;
pub mod runtime;

pub use config::{ConfigSource, EngineConfig, JsonConfigSource};
pub use engine::Engine;
pub use executor::{ExecutionOutcome, Executor};
pub use rpc::ExecuteHandler;
