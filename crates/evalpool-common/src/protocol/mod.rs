pub mod error;
pub mod execute;
pub mod jsonrpc;

#[cfg(test)]
mod tests;

pub use error::{AcquireError, EvalError, Result};
pub use execute::{ExecuteRequest, ExecuteResponse};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
