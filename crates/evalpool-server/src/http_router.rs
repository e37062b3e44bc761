//! JSON-RPC router for the engine.
//!
//! | method | params | result |
//! |---|---|---|
//! | `execute` | [`ExecuteRequest`] | [`ExecuteResponse`](evalpool_common::ExecuteResponse) |
//! | `_metrics` | ignored | [`MetricsSnapshot`](evalpool_metrics::MetricsSnapshot) |
//! | `_info` | ignored | [`ServerInfo`](evalpool_metrics::ServerInfo) |
//!
//! Script failures are reported inside a successful `execute` result; only
//! envelope problems become JSON-RPC errors.

use evalpool_common::protocol::{ExecuteRequest, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use serde::Serialize;
use serde_json::Value;

use crate::rpc::ExecuteHandler;

pub const EXECUTE_METHOD: &str = "execute";
pub const METRICS_METHOD: &str = "_metrics";
pub const INFO_METHOD: &str = "_info";

pub struct EngineRouter {
    handler: ExecuteHandler,
}

impl EngineRouter {
    pub fn new(handler: ExecuteHandler) -> Self {
        Self { handler }
    }

    pub async fn handle_request(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        let id = req.id.clone();

        if !req.has_valid_version() {
            return JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request("jsonrpc must be \"2.0\""),
            );
        }

        match req.method.as_str() {
            EXECUTE_METHOD => {
                let request: ExecuteRequest = match serde_json::from_value(req.params) {
                    Ok(request) => request,
                    Err(e) => {
                        return JsonRpcResponse::error(
                            id,
                            JsonRpcError::invalid_params(&format!("invalid execute params: {}", e)),
                        )
                    }
                };
                let response = self.handler.execute(request).await;
                respond(id, &response)
            }
            METRICS_METHOD => respond(id, &self.handler.metrics()),
            INFO_METHOD => respond(id, &self.handler.info()),
            other => JsonRpcResponse::error(id, JsonRpcError::method_not_found(other)),
        }
    }
}

fn respond<T: Serialize>(id: Value, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(id, JsonRpcError::internal_error(&e.to_string())),
    }
}
