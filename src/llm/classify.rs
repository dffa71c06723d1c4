//! Outcome classification for chat completion calls
//!
//! Every call ends as either a parsed [`ChatOutput`] or one of the
//! [`ClassifiedError`] variants. Nothing here retries.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::llm::types::ChatOutput;

/// Cooldown applied to a 429 whose message carries no "<N> seconds" hint
pub const DEFAULT_COOLDOWN_MS: u64 = 30_000;

/// Classified failure of a single completion call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifiedError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Rate limited ({cooldown_ms}ms cooldown): {message}")]
    RateLimited { message: String, cooldown_ms: u64 },

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Parse error: {message}")]
    Parse { message: String },
}

impl ClassifiedError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// How long the endpoint asked us to stay away, for rate-limit results
    pub fn cooldown(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { cooldown_ms, .. } => Some(Duration::from_millis(*cooldown_ms)),
            _ => None,
        }
    }
}

/// Result of one completion call, as settled to the caller
pub type TaskResult = Result<ChatOutput, ClassifiedError>;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<Value>,
    message: String,
}

/// Extract the cooldown from the first "<N> seconds" in an error message
///
/// Falls back to [`DEFAULT_COOLDOWN_MS`] when no such hint exists.
pub fn parse_cooldown_ms(message: &str) -> u64 {
    for (idx, _) in message.match_indices(" seconds") {
        let prefix = &message[..idx];
        let digits = &prefix[prefix.trim_end_matches(|c: char| c.is_ascii_digit()).len()..];
        if let Ok(secs) = digits.parse::<u64>() {
            return secs.saturating_mul(1000);
        }
    }
    DEFAULT_COOLDOWN_MS
}

/// Classify a non-2xx response
pub fn classify_error(status: u16, body: &str) -> ClassifiedError {
    let envelope: ErrorEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return ClassifiedError::Http {
                status,
                message: format!("Failed to parse error body: {}", e),
            };
        }
    };

    let message = envelope.error.message;
    if status == 429 {
        let cooldown_ms = parse_cooldown_ms(&message);
        return ClassifiedError::RateLimited { message, cooldown_ms };
    }

    let message = match envelope.error.code {
        Some(Value::String(code)) => format!("{}: {}", code, message),
        Some(Value::Number(code)) => format!("{}: {}", code, message),
        _ => message,
    };
    ClassifiedError::Http { status, message }
}

/// Parse a 2xx body; a `choices` array is mandatory
pub fn parse_success(body: &str) -> Result<ChatOutput, ClassifiedError> {
    let value: Value = serde_json::from_str(body).map_err(|e| ClassifiedError::Parse {
        message: format!("Invalid JSON in response: {}", e),
    })?;

    if !value.get("choices").is_some_and(Value::is_array) {
        return Err(ClassifiedError::Parse {
            message: "Response has no choices array".to_string(),
        });
    }

    serde_json::from_value(value).map_err(|e| ClassifiedError::Parse {
        message: format!("Malformed completion: {}", e),
    })
}

/// Classify a full HTTP outcome
pub fn classify_response(status: u16, body: &str) -> Result<ChatOutput, ClassifiedError> {
    if (200..300).contains(&status) {
        parse_success(body)
    } else {
        Err(classify_error(status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cooldown_with_hint() {
        assert_eq!(parse_cooldown_ms("Rate limited, retry after 12 seconds"), 12_000);
    }

    #[test]
    fn test_parse_cooldown_without_hint() {
        assert_eq!(parse_cooldown_ms("Rate limited, slow down"), DEFAULT_COOLDOWN_MS);
        assert_eq!(parse_cooldown_ms("wait a few seconds"), DEFAULT_COOLDOWN_MS);
    }

    #[test]
    fn test_parse_cooldown_first_numeric_hint_wins() {
        let message = "Please wait seconds. Retry after 7 seconds, or 60 seconds for full quota";
        assert_eq!(parse_cooldown_ms(message), 7_000);
    }

    #[test]
    fn test_parse_cooldown_at_start_of_message() {
        assert_eq!(parse_cooldown_ms("3 seconds until reset"), 3_000);
    }

    #[test]
    fn test_parse_cooldown_after_multibyte_char() {
        assert_eq!(parse_cooldown_ms("retry in\u{a0}12 seconds"), 12_000);
        assert_eq!(parse_cooldown_ms("a few… seconds"), DEFAULT_COOLDOWN_MS);
        assert_eq!(parse_cooldown_ms("请在 5 seconds 后重试"), 5_000);
    }

    #[test]
    fn test_classify_429_with_multibyte_message() {
        let body = r#"{"error":{"code":"429","message":"Please retry in a few… seconds"}}"#;
        assert_eq!(classify_error(429, body).cooldown(), Some(Duration::from_millis(DEFAULT_COOLDOWN_MS)));
    }

    #[test]
    fn test_classify_429_with_hint() {
        let body = r#"{"error":{"code":"429","message":"Rate limited, retry after 12 seconds"}}"#;
        let err = classify_error(429, body);
        assert_eq!(
            err,
            ClassifiedError::RateLimited {
                message: "Rate limited, retry after 12 seconds".to_string(),
                cooldown_ms: 12_000,
            }
        );
        assert_eq!(err.cooldown(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_classify_429_without_hint() {
        let body = r#"{"error":{"code":"429","message":"Too many requests"}}"#;
        let err = classify_error(429, body);
        assert!(err.is_rate_limit());
        assert_eq!(err.cooldown(), Some(Duration::from_millis(DEFAULT_COOLDOWN_MS)));
    }

    #[test]
    fn test_classify_other_status_is_http_error() {
        let body = r#"{"error":{"code":"content_filter","message":"Blocked"}}"#;
        let err = classify_error(400, body);
        assert_eq!(
            err,
            ClassifiedError::Http {
                status: 400,
                message: "content_filter: Blocked".to_string(),
            }
        );
    }

    #[test]
    fn test_classify_numeric_code() {
        let body = r#"{"error":{"code":500,"message":"Internal"}}"#;
        let err = classify_error(500, body);
        assert!(matches!(err, ClassifiedError::Http { status: 500, ref message } if message == "500: Internal"));
    }

    #[test]
    fn test_classify_unparseable_error_body() {
        let err = classify_error(502, "<html>Bad Gateway</html>");
        match err {
            ClassifiedError::Http { status, message } => {
                assert_eq!(status, 502);
                assert!(message.starts_with("Failed to parse error body"));
            }
            other => panic!("expected Http, got {:?}", other),
        }
    }

    #[test]
    fn test_unparseable_429_is_http_error() {
        let err = classify_error(429, "slow down");
        assert!(matches!(err, ClassifiedError::Http { status: 429, .. }));
    }

    #[test]
    fn test_parse_success_requires_choices() {
        let err = parse_success(r#"{"id":"x","usage":{}}"#).unwrap_err();
        assert!(matches!(err, ClassifiedError::Parse { .. }));

        let err = parse_success(r#"{"choices":"nope"}"#).unwrap_err();
        assert!(matches!(err, ClassifiedError::Parse { .. }));
    }

    #[test]
    fn test_parse_success_invalid_json() {
        let err = parse_success("{truncated").unwrap_err();
        assert!(matches!(err, ClassifiedError::Parse { ref message } if message.contains("Invalid JSON")));
    }

    #[test]
    fn test_parse_success_malformed_choice() {
        let err = parse_success(r#"{"choices":[{"index":0}]}"#).unwrap_err();
        assert!(matches!(err, ClassifiedError::Parse { ref message } if message.contains("Malformed")));
    }

    #[test]
    fn test_classify_response_success() {
        let body = r#"{"choices":[{"index":0,"finish_reason":"stop","message":{"role":"assistant","content":"ok"}}]}"#;
        let output = classify_response(200, body).unwrap();
        assert_eq!(output.content(), Some("ok"));
    }

    #[test]
    fn test_error_display() {
        let err = ClassifiedError::network("connection refused");
        assert_eq!(err.to_string(), "Network error: connection refused");
        assert!(err.cooldown().is_none());
    }
}
