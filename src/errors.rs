use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Errors the relay surfaces to its caller. Upstream failures are absent on
/// purpose: they are absorbed into the fallback reply and never escape.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Message cannot be empty.")]
    EmptyMessage,
    #[error("Message exceeds the {limit}-character limit.")]
    MessageTooLong { limit: usize },
    #[error("turn cancelled by the client")]
    Cancelled,
}

#[derive(Debug)]
pub struct UpstreamError {
    pub message: String,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub fn classify_upstream_error(detail: &str) -> String {
    let lowered = detail.to_lowercase();

    if lowered.contains("connection refused") || lowered.contains("error trying to connect") {
        return "Inference backend is unreachable. Check UPSTREAM_BASE_URL and that the model server is running.".to_string();
    }

    if lowered.contains("timed out") || lowered.contains("timeout") {
        return "Inference backend timed out before completing the response.".to_string();
    }

    if lowered.contains("invalid_api_key") || lowered.contains("unauthorized") {
        return "Upstream rejected the API key. Please verify UPSTREAM_API_KEY configuration."
            .to_string();
    }

    if lowered.contains("rate_limit") || lowered.contains("quota") {
        return "Upstream rate limit exceeded. Please retry later or upgrade your backend quota."
            .to_string();
    }

    if lowered.contains("model")
        && (lowered.contains("not found") || lowered.contains("does not exist"))
    {
        return "Model not found. Check MODEL against the models installed on the backend."
            .to_string();
    }

    detail.to_string()
}

pub fn extract_error_message_from_body(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        if let Some(message) = parsed
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
        {
            return message.to_string();
        }
        if let Some(message) = parsed.get("error").and_then(Value::as_str) {
            return message.to_string();
        }
        if let Some(message) = parsed.get("message").and_then(Value::as_str) {
            return message.to_string();
        }
    }

    if body.trim().is_empty() {
        "upstream API returned an empty error response".to_string()
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_upstream_error, extract_error_message_from_body, RelayError};

    #[test]
    fn classifies_connection_refused() {
        let message = classify_upstream_error(
            "error sending request: error trying to connect: tcp connect error: Connection refused (os error 111)",
        );
        assert!(message.contains("UPSTREAM_BASE_URL"));
    }

    #[test]
    fn classifies_timeout() {
        let message = classify_upstream_error("operation timed out");
        assert!(message.contains("timed out"));
    }

    #[test]
    fn classifies_missing_model() {
        let message = classify_upstream_error("model \"llama9\" not found, try pulling it first");
        assert!(message.contains("MODEL"));
    }

    #[test]
    fn passes_through_unrecognized_detail() {
        assert_eq!(classify_upstream_error("weird failure"), "weird failure");
    }

    #[test]
    fn extracts_nested_error_message() {
        let body = r#"{"error":{"message":"invalid_api_key","type":"auth"}}"#;
        assert_eq!(extract_error_message_from_body(body), "invalid_api_key");
    }

    #[test]
    fn extracts_flat_error_string() {
        // Ollama reports errors as {"error": "..."}
        let body = r#"{"error":"model \"x\" not found"}"#;
        assert_eq!(extract_error_message_from_body(body), "model \"x\" not found");
    }

    #[test]
    fn falls_back_to_raw_body() {
        assert_eq!(extract_error_message_from_body("plain text"), "plain text");
        assert!(extract_error_message_from_body("  ").contains("empty error response"));
    }

    #[test]
    fn relay_error_messages_are_user_facing() {
        assert_eq!(RelayError::EmptyMessage.to_string(), "Message cannot be empty.");
        assert_eq!(
            RelayError::MessageTooLong { limit: 2000 }.to_string(),
            "Message exceeds the 2000-character limit."
        );
    }
}
