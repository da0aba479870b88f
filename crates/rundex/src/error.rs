//! Error types for the rundex engine.

use thiserror::Error;

/// Engine result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in engine operations.
///
/// Adapter-level failures are classified as [`EngineError::Transient`] or
/// [`EngineError::Permanent`] inside the fan-out and never reach tool
/// callers as raw errors; tool operations surface only the stable kinds
/// (`not_found`, `validation`, `timeout`, `circuit_open`, `internal`,
/// `configuration`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A specific entity is absent from the current corpus.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Caller-provided arguments failed validation.
    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    /// The caller's deadline elapsed before a complete response.
    #[error("Operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// A required single-source upstream is breaker-open.
    #[error("Circuit open for upstream {upstream}")]
    CircuitOpen { upstream: String },

    /// Unexpected failure in engine code. The correlation id keys the log
    /// record carrying the full context.
    #[error("Internal error (correlation id {correlation_id})")]
    Internal { correlation_id: String },

    /// Startup-time configuration error; prevents engine readiness.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transient upstream failure (network timeout, 5xx-equivalent).
    /// Eligible for retry.
    #[error("Transient upstream error: {0}")]
    Transient(String),

    /// Permanent upstream failure (auth, bad request). Not retried.
    #[error("Permanent upstream error: {0}")]
    Permanent(String),

    /// Cache tier failure. Remote-tier instances of this never propagate
    /// to tool callers.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error (checkpoints, config files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable machine-readable code for the wire layer.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::Validation { .. } => "validation",
            EngineError::Timeout { .. } => "timeout",
            EngineError::CircuitOpen { .. } => "circuit_open",
            EngineError::Internal { .. } => "internal",
            EngineError::Configuration(_) => "configuration",
            EngineError::Transient(_) => "transient",
            EngineError::Permanent(_) => "permanent",
            EngineError::Cache(_) => "cache",
            EngineError::Serialization(_) => "serialization",
            EngineError::Io(_) => "io",
        }
    }

    /// Whether the retry layer may re-attempt the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Transient(_) | EngineError::Timeout { .. } | EngineError::Cache(_)
        )
    }

    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_yml::Error> for EngineError {
    fn from(err: serde_yml::Error) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::not_found("procedure", "emergency_disk_cleanup");
        assert_eq!(
            err.to_string(),
            "procedure not found: emergency_disk_cleanup"
        );

        let err = EngineError::CircuitOpen {
            upstream: "confluence-ops".to_string(),
        };
        assert!(err.to_string().contains("confluence-ops"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            EngineError::validation("severity", "unknown value").code(),
            "validation"
        );
        assert_eq!(EngineError::Timeout { elapsed_ms: 100 }.code(), "timeout");
        assert_eq!(
            EngineError::Configuration("bad".into()).code(),
            "configuration"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Transient("connection reset".into()).is_transient());
        assert!(EngineError::Timeout { elapsed_ms: 10 }.is_transient());
        assert!(!EngineError::Permanent("401 unauthorized".into()).is_transient());
        assert!(!EngineError::not_found("document", "x").is_transient());
    }
}
