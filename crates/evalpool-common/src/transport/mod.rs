//! evalpool Transport Layer
//!
//! Helpers that move JSON-RPC envelopes in and out of HTTP messages.

pub mod http;

pub use http::{HttpTransport, HyperRequest, HyperResponse, MAX_BODY_BYTES};
