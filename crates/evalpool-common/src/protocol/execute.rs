//! Execution call wire types.
//!
//! The execution call is the only operation the engine exposes to callers.
//! Every outcome, including validation failures, is reported through
//! [`ExecuteResponse`]; the call itself never fails at the transport level.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::protocol::error::{EvalError, Result};

/// Request to run a script once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Script text to evaluate. Must not be empty.
    #[serde(default)]
    pub code: String,
    /// Deadline in milliseconds. Zero or negative selects the configured default.
    #[serde(default)]
    pub timeout_ms: i64,
    /// Correlation identifier echoed back in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout_ms: 0,
            request_id: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Checks the request before any pool interaction.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::EmptyCode` when `code` is empty.
    pub fn validate(&self) -> Result<()> {
        if self.code.is_empty() {
            return Err(EvalError::EmptyCode);
        }
        Ok(())
    }

    /// Explicit deadline requested by the caller, if any.
    pub fn timeout(&self) -> Option<Duration> {
        u64::try_from(self.timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Structured result of one execution call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// Exported script value; `null` on failure.
    pub result: Value,
    /// Wall-clock time spent handling the call.
    pub duration_ms: u64,
    /// Empty on success, otherwise a description of the failure.
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ExecuteResponse {
    pub fn success(result: Value, duration_ms: u64, request_id: Option<String>) -> Self {
        Self {
            result,
            duration_ms,
            error: String::new(),
            request_id,
        }
    }

    pub fn failure(error: &EvalError, duration_ms: u64, request_id: Option<String>) -> Self {
        Self {
            result: Value::Null,
            duration_ms,
            error: error.to_string(),
            request_id,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}
