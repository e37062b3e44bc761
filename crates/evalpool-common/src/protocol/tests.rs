//! Tests for the execution call wire types and the error taxonomy

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_request_decodes_with_defaults() {
        let req: ExecuteRequest = serde_json::from_str(r#"{"code": "1 + 1"}"#).unwrap();
        assert_eq!(req.code, "1 + 1");
        assert_eq!(req.timeout_ms, 0);
        assert!(req.request_id.is_none());
        assert!(req.timeout().is_none());
    }

    #[test]
    fn test_request_missing_code_is_empty() {
        let req: ExecuteRequest = serde_json::from_str(r#"{"timeout_ms": 50}"#).unwrap();
        assert!(matches!(req.validate(), Err(EvalError::EmptyCode)));
    }

    #[test]
    fn test_request_validate_accepts_code() {
        assert!(ExecuteRequest::new("1").validate().is_ok());
    }

    #[test]
    fn test_request_timeout_selection() {
        assert_eq!(
            ExecuteRequest::new("1").with_timeout_ms(250).timeout(),
            Some(Duration::from_millis(250))
        );
        assert!(ExecuteRequest::new("1").with_timeout_ms(0).timeout().is_none());
        assert!(ExecuteRequest::new("1").with_timeout_ms(-5).timeout().is_none());
    }

    #[test]
    fn test_request_serialization_skips_missing_id() {
        let text = serde_json::to_string(&ExecuteRequest::new("x")).unwrap();
        assert!(!text.contains("request_id"));

        let text = serde_json::to_string(&ExecuteRequest::new("x").with_request_id("r1")).unwrap();
        assert!(text.contains(r#""request_id":"r1""#));
    }

    #[test]
    fn test_response_success_shape() {
        let resp = ExecuteResponse::success(json!(4), 2, Some("abc".into()));
        assert!(resp.is_success());
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            value,
            json!({"result": 4, "duration_ms": 2, "error": "", "request_id": "abc"})
        );
    }

    #[test]
    fn test_response_failure_shape() {
        let resp = ExecuteResponse::failure(&EvalError::Timeout(100), 101, None);
        assert!(!resp.is_success());
        assert_eq!(resp.result, serde_json::Value::Null);
        assert!(resp.error.contains("timeout"));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["error"], json!("execution timeout after 100ms"));
        assert!(value.get("request_id").is_none());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(EvalError::EmptyCode.to_string(), "code is required");
        assert!(EvalError::Script("Error: boom".into()).to_string().contains("boom"));
        assert!(EvalError::Acquisition(AcquireError::ShuttingDown)
            .to_string()
            .contains("shutting down"));
        assert!(EvalError::Acquisition(AcquireError::Cancelled)
            .to_string()
            .contains("cancelled"));
    }

    #[test]
    fn test_error_classification() {
        assert!(EvalError::EmptyCode.is_validation());
        assert!(EvalError::Timeout(1).is_timeout());
        assert!(EvalError::from(AcquireError::Cancelled).is_acquisition());
        assert!(!EvalError::Script("x".into()).is_timeout());
    }
}
