use thiserror::Error;

/// Error taxonomy for the agentic execution core (see design doc §7).
///
/// Variants map one-to-one onto the error kinds the runner loop must act
/// on differently — `.code()` gives adapters a stable string to match on
/// instead of parsing `Display` output.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("model rejected request: context window exceeded")]
    ContextOverflow,

    #[error("rate limited{}", retry_after_ms.map(|ms| format!(", retry after {ms}ms")).unwrap_or_default())]
    RateLimit { retry_after_ms: Option<u64> },

    #[error("provider auth failed: {0}")]
    AuthFailure(String),

    #[error("provider rejected message ordering: {0}")]
    RoleOrdering(String),

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("tool call {tool_call_id} had invalid input JSON: {reason}")]
    InvalidToolCallInput { tool_call_id: String, reason: String },

    #[error("quota exhausted")]
    QuotaExhausted,

    #[error("fence integrity check failed: {reason}")]
    FenceViolation { reason: String },

    #[error("model returned an empty reply")]
    EmptyReply,

    #[error("iteration budget exhausted after {iterations} iterations")]
    IterationsExhausted { iterations: u32 },

    #[error("no providers configured")]
    NoProvidersConfigured,

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short SCREAMING_SNAKE classification, stable across Display wording
    /// changes — this is what adapters and tests should match against.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::ContextOverflow => "CONTEXT_OVERFLOW",
            CoreError::RateLimit { .. } => "RATE_LIMIT",
            CoreError::AuthFailure(_) => "AUTH_FAILURE",
            CoreError::RoleOrdering(_) => "ROLE_ORDERING",
            CoreError::Transient(_) => "TRANSIENT",
            CoreError::Cancelled => "CANCELLED",
            CoreError::InvalidToolCallInput { .. } => "INVALID_TOOL_CALL_INPUT",
            CoreError::QuotaExhausted => "QUOTA_EXHAUSTED",
            CoreError::FenceViolation { .. } => "FENCE_VIOLATION",
            CoreError::EmptyReply => "EMPTY_REPLY",
            CoreError::IterationsExhausted { .. } => "ITERATIONS_EXHAUSTED",
            CoreError::NoProvidersConfigured => "NO_PROVIDERS_CONFIGURED",
            CoreError::Database(_) => "DATABASE_ERROR",
            CoreError::Serialization(_) => "SERIALIZATION_ERROR",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error kind is safe to show directly to the user without
    /// further formatting (everything else goes through
    /// `extract_provider_error_message` first).
    pub fn is_user_safe(&self) -> bool {
        matches!(
            self,
            CoreError::ContextOverflow
                | CoreError::QuotaExhausted
                | CoreError::FenceViolation { .. }
                | CoreError::EmptyReply
                | CoreError::IterationsExhausted { .. }
                | CoreError::Cancelled
        )
    }
}

/// Parse a raw provider error body into a short human sentence, keeping
/// internal details (stack traces, request ids, raw JSON) out of anything
/// shown to the user. Tries known shapes, falls back to a generic sentence.
pub fn extract_provider_error_message(raw: &serde_json::Value) -> String {
    if let Some(msg) = raw
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
    {
        return msg.to_string();
    }
    if let Some(msg) = raw.get("message").and_then(|m| m.as_str()) {
        return msg.to_string();
    }
    if let Some(msg) = raw.as_str() {
        return msg.to_string();
    }
    "The model provider returned an error.".to_string()
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_classification() {
        assert_eq!(CoreError::ContextOverflow.code(), "CONTEXT_OVERFLOW");
        assert_eq!(
            CoreError::RateLimit { retry_after_ms: Some(500) }.code(),
            "RATE_LIMIT"
        );
    }

    #[test]
    fn extracts_nested_error_message() {
        let raw = serde_json::json!({"error": {"type": "overloaded", "message": "Overloaded"}});
        assert_eq!(extract_provider_error_message(&raw), "Overloaded");
    }

    #[test]
    fn extracts_top_level_message() {
        let raw = serde_json::json!({"message": "bad request"});
        assert_eq!(extract_provider_error_message(&raw), "bad request");
    }

    #[test]
    fn falls_back_to_generic_sentence() {
        let raw = serde_json::json!({"unexpected": "shape"});
        assert_eq!(
            extract_provider_error_message(&raw),
            "The model provider returned an error."
        );
    }
}
