//! JSON-RPC 2.0 Envelope
//!
//! The HTTP surface speaks JSON-RPC 2.0. The envelope is deliberately thin:
//! script failures are *not* JSON-RPC errors, they travel inside a successful
//! `execute` result as an [`ExecuteResponse`](crate::ExecuteResponse) with a
//! non-empty `error` field. JSON-RPC errors are reserved for malformed
//! envelopes, unknown methods and undecodable params.
//!
//! # Error Codes
//!
//! - `-32700`: Parse error
//! - `-32600`: Invalid request
//! - `-32601`: Method not found
//! - `-32602`: Invalid params
//! - `-32603`: Internal error
//! - `-32001`: Request body too large
//!
//! # Example
//!
//! ```
//! use evalpool_common::protocol::jsonrpc::{JsonRpcRequest, JsonRpcResponse, JsonRpcError};
//! use serde_json::json;
//!
//! let request = JsonRpcRequest::new("execute", json!({"code": "1 + 1"}), json!(1));
//! assert!(request.has_valid_version());
//!
//! let response = JsonRpcResponse::success(request.id.clone(), json!({"result": 2}));
//! assert!(response.error.is_none());
//!
//! let failed = JsonRpcResponse::error(json!(1), JsonRpcError::method_not_found("nope"));
//! assert!(failed.result.is_none());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    /// Omitted params decode as `null`
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
            id,
        }
    }

    pub fn has_valid_version(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION
    }
}

/// JSON-RPC 2.0 response
///
/// Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Invalid JSON was received by the server
pub const PARSE_ERROR: i32 = -32700;
/// The JSON sent is not a valid Request object
pub const INVALID_REQUEST: i32 = -32600;
/// The method does not exist / is not available
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Invalid method parameter(s)
pub const INVALID_PARAMS: i32 = -32602;
/// Internal JSON-RPC error
pub const INTERNAL_ERROR: i32 = -32603;
/// Request entity too large
pub const REQUEST_TOO_LARGE: i32 = -32001;

impl JsonRpcError {
    fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::with_code(PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(msg: &str) -> Self {
        Self::with_code(INVALID_REQUEST, format!("Invalid Request: {}", msg))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::with_code(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(msg: &str) -> Self {
        Self::with_code(INVALID_PARAMS, msg)
    }

    pub fn internal_error(msg: &str) -> Self {
        Self::with_code(INTERNAL_ERROR, msg)
    }

    pub fn request_too_large(limit: usize) -> Self {
        Self::with_code(
            REQUEST_TOO_LARGE,
            format!("Request body too large (max {} bytes)", limit),
        )
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            result: None,
            error: Some(error),
            id,
        }
    }
}
