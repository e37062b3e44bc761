//! evalpool Common Types and Transport
//!
//! This crate provides the protocol definitions shared by the evalpool engine,
//! its HTTP surface and its command-line front end.
//!
//! # Overview
//!
//! evalpool runs untrusted JavaScript snippets on a fixed pool of Boa
//! interpreters, each execution bounded by a wall-clock deadline. This crate
//! contains the pieces every other crate agrees on:
//!
//! - **Protocol Layer**: the execution call (`ExecuteRequest` / `ExecuteResponse`),
//!   JSON-RPC 2.0 envelopes and the error taxonomy
//! - **Transport Layer**: helpers to move JSON-RPC messages over HTTP
//!
//! # Example
//!
//! ```
//! use evalpool_common::{ExecuteRequest, ExecuteResponse};
//! use serde_json::json;
//!
//! let request = ExecuteRequest::new("var result = 2 + 2; result;")
//!     .with_timeout_ms(500)
//!     .with_request_id("req-1");
//!
//! let response = ExecuteResponse::success(json!(4), 3, request.request_id.clone());
//! assert!(response.is_success());
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
