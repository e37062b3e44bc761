//! HTTP Transport Utilities
//!
//! Conversion between raw HTTP bodies and JSON-RPC envelopes.
//!
//! # Example
//!
//! ```
//! use evalpool_common::transport::http::HttpTransport;
//! use evalpool_common::protocol::JsonRpcResponse;
//! use hyper::body::Bytes;
//! use serde_json::json;
//!
//! let body = Bytes::from(r#"{"jsonrpc":"2.0","method":"execute","params":{"code":"1"},"id":1}"#);
//! let request = HttpTransport::parse_jsonrpc(&body).unwrap();
//! assert_eq!(request.method, "execute");
//!
//! let response = HttpTransport::to_http_response(JsonRpcResponse::success(json!(1), json!(1)));
//! assert_eq!(response.status(), 200);
//! ```

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};

use crate::protocol::error::EvalError;
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Type alias for Hyper incoming requests
pub type HyperRequest = Request<Incoming>;

/// Type alias for Hyper responses with full body
pub type HyperResponse = Response<Full<Bytes>>;

/// HTTP transport utility functions
pub struct HttpTransport;

impl HttpTransport {
    /// Parses a JSON-RPC request from an HTTP body.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::JsonSerialization` when the body is not a JSON-RPC request.
    pub fn parse_jsonrpc(body: &[u8]) -> Result<JsonRpcRequest, EvalError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Wraps a JSON-RPC response into a `200 OK` HTTP response.
    pub fn to_http_response(jsonrpc: JsonRpcResponse) -> HyperResponse {
        Self::to_http_response_with_status(jsonrpc, StatusCode::OK)
    }

    /// Builds a JSON-RPC error response for the given id.
    pub fn to_http_error(id: serde_json::Value, error: JsonRpcError) -> HyperResponse {
        Self::to_http_response(JsonRpcResponse::error(id, error))
    }

    pub fn to_http_response_with_status(
        jsonrpc: JsonRpcResponse,
        status: StatusCode,
    ) -> HyperResponse {
        let body = serde_json::to_vec(&jsonrpc).unwrap_or_default();

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}
