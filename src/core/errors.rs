use serde::{Deserialize, Serialize};

/// Closed taxonomy for turn-level failures. Turn errors are terminal for
/// that turn only; they are persisted alongside whatever partial parts
/// exist and surfaced as one error chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnErrorKind {
    SessionExpired,
    ProcessCrash,
    ExecutableMissing,
    AuthenticationFailure,
    InvalidCredential,
    RateLimit,
    NetworkError,
    PolicyViolation,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnError {
    pub kind: TurnErrorKind,
    pub message: String,
}

impl TurnError {
    pub fn new(kind: TurnErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(TurnErrorKind::Unknown, message)
    }
}

impl std::fmt::Display for TurnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Maps raw provider error text to a taxonomy kind. Providers report
/// errors as free text or JSON bodies; the summary (if JSON) is folded
/// into the match.
pub fn classify_provider_error(raw: &str) -> TurnError {
    let summary = extract_error_summary(raw).unwrap_or_else(|| raw.trim().to_string());
    let lowered = summary.to_ascii_lowercase();

    let kind = if lowered.contains("resume token")
        || lowered.contains("session expired")
        || lowered.contains("conversation not found")
    {
        TurnErrorKind::SessionExpired
    } else if lowered.contains("no such file")
        || lowered.contains("enoent")
        || lowered.contains("executable not found")
        || lowered.contains("command not found")
    {
        TurnErrorKind::ExecutableMissing
    } else if lowered.contains("process exited")
        || lowered.contains("crashed")
        || lowered.contains("sigsegv")
    {
        TurnErrorKind::ProcessCrash
    } else if lowered.contains("invalid api key")
        || lowered.contains("invalid credential")
        || lowered.contains("invalid_api_key")
    {
        TurnErrorKind::InvalidCredential
    } else if lowered.contains("401")
        || lowered.contains("403")
        || lowered.contains("unauthorized")
        || lowered.contains("forbidden")
        || lowered.contains("authentication")
    {
        TurnErrorKind::AuthenticationFailure
    } else if lowered.contains("429")
        || lowered.contains("rate limit")
        || lowered.contains("rate_limit")
        || lowered.contains("overloaded")
    {
        TurnErrorKind::RateLimit
    } else if lowered.contains("connect")
        || lowered.contains("timed out")
        || lowered.contains("timeout")
        || lowered.contains("dns")
        || lowered.contains("network")
        || lowered.contains("connection refused")
    {
        TurnErrorKind::NetworkError
    } else if lowered.contains("policy") || lowered.contains("not permitted") {
        TurnErrorKind::PolicyViolation
    } else {
        TurnErrorKind::Unknown
    };

    TurnError::new(kind, summary)
}

/// Pulls a human-readable summary out of a JSON error body, collapsing
/// whitespace. Returns None for non-JSON input.
pub fn extract_error_summary(raw: &str) -> Option<String> {
    let value = serde_json::from_str::<serde_json::Value>(raw.trim()).ok()?;
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        })?;

    let collapsed = summary.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(collapsed.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_provider_errors() {
        assert_eq!(
            classify_provider_error("401 Unauthorized").kind,
            TurnErrorKind::AuthenticationFailure
        );
        assert_eq!(
            classify_provider_error("rate limit exceeded, retry later").kind,
            TurnErrorKind::RateLimit
        );
        assert_eq!(
            classify_provider_error("connection refused").kind,
            TurnErrorKind::NetworkError
        );
        assert_eq!(
            classify_provider_error("mystery failure").kind,
            TurnErrorKind::Unknown
        );
        assert_eq!(
            classify_provider_error("spawn failed: No such file or directory").kind,
            TurnErrorKind::ExecutableMissing
        );
        assert_eq!(
            classify_provider_error("resume token rejected by provider").kind,
            TurnErrorKind::SessionExpired
        );
    }

    #[test]
    fn summary_extraction_handles_nested_and_flat_shapes() {
        assert_eq!(
            extract_error_summary(r#"{"error":{"message":"model  overloaded"}}"#).as_deref(),
            Some("model overloaded")
        );
        assert_eq!(
            extract_error_summary(r#"{"error":"boom"}"#).as_deref(),
            Some("boom")
        );
        assert_eq!(
            extract_error_summary(r#"{"message":"flat"}"#).as_deref(),
            Some("flat")
        );
        assert_eq!(extract_error_summary("plain text"), None);
    }

    #[test]
    fn classification_uses_json_summary() {
        let error = classify_provider_error(r#"{"error":{"message":"Rate limit reached"}}"#);
        assert_eq!(error.kind, TurnErrorKind::RateLimit);
        assert_eq!(error.message, "Rate limit reached");
    }
}
