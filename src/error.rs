use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "input.features[0]")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "circuit_breaker", "cache", "model_loader")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the serving gateway.
///
/// Callers must be able to distinguish "try again later" conditions
/// (`RateLimited`, `CircuitOpen`) from bad input (`Validation`) from genuine
/// failures (`PredictionFailed`), so each gets its own variant rather than a
/// shared message string.
///
/// All variants are `Clone` so the deduplicator can hand every waiter the
/// owner's exact failure.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Sliding-window admission denied. Advisory backpressure: the caller
    /// should back off and retry later.
    #[error("rate limit exceeded for client '{client_id}': {current}/{max_requests} in window")]
    RateLimited {
        client_id: String,
        current: u32,
        max_requests: u32,
    },

    /// Circuit breaker is open for a dependency; the wrapped operation was
    /// never invoked.
    #[error("circuit breaker open for '{dependency}', retry after {retry_after_ms}ms")]
    CircuitOpen {
        dependency: String,
        retry_after_ms: u64,
    },

    /// A single call attempt exceeded the breaker's call timeout.
    #[error("call to '{dependency}' timed out after {elapsed_ms}ms")]
    Timeout { dependency: String, elapsed_ms: u64 },

    /// Transient failure (network, temporary unavailability). Retryable.
    #[error("transient error: {message}{}", format_context(.context))]
    Transient {
        message: String,
        context: ErrorContext,
    },

    /// All retry attempts consumed; wraps the last underlying error.
    #[error("retry exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<Error> },

    /// Model could not be loaded, surfaced after retry exhaustion.
    #[error("model unavailable: '{model}': {message}")]
    ModelUnavailable { model: String, message: String },

    /// The model itself failed during inference.
    #[error("prediction failed for model '{model}': {message}")]
    PredictionFailed { model: String, message: String },

    /// Bad input. Never retried, never counted against the breaker.
    #[error("validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    /// Internal runtime error (lock poisoning, metric registration, ...).
    #[error("runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new transient error with structured context
    pub fn transient_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Transient {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::transient_with_context(msg, ErrorContext::new())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::validation_with_context(msg, ErrorContext::new())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::runtime_with_context(msg, ErrorContext::new())
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Transient { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether the default retry predicate considers this error worth another
    /// attempt.
    ///
    /// - Transient failures and per-attempt timeouts: yes.
    /// - `CircuitOpen`: no — retrying would defeat the breaker's fast-fail.
    /// - `RateLimited`, `Validation`: no — the caller, not the retry loop,
    ///   decides what to do with these.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. } | Error::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }

    /// Whether this error counts toward a circuit breaker's failure
    /// threshold. Validation errors, rate-limit denials, and the breaker's
    /// own gating errors are excluded; everything else (including timeouts)
    /// counts.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(
            self,
            Error::Validation { .. } | Error::RateLimited { .. } | Error::CircuitOpen { .. }
        )
    }

    /// Short machine-readable kind label, used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::RateLimited { .. } => "rate_limited",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::Timeout { .. } => "timeout",
            Error::Transient { .. } => "transient",
            Error::RetryExhausted { .. } => "retry_exhausted",
            Error::ModelUnavailable { .. } => "model_unavailable",
            Error::PredictionFailed { .. } => "prediction_failed",
            Error::Validation { .. } => "validation",
            Error::Runtime { .. } => "runtime",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        // Kept as a string so Error stays Clone.
        Error::Runtime {
            message: format!("serialization error: {}", e),
            context: ErrorContext::new().with_source("serde_json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_formatting() {
        let err = Error::validation_with_context(
            "missing feature",
            ErrorContext::new()
                .with_field_path("input.features")
                .with_source("gateway"),
        );
        let msg = err.to_string();
        assert!(msg.contains("missing feature"));
        assert!(msg.contains("field: input.features"));
        assert!(msg.contains("source: gateway"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::transient("connection reset").is_retryable());
        assert!(Error::Timeout {
            dependency: "m".into(),
            elapsed_ms: 100
        }
        .is_retryable());
        assert!(!Error::CircuitOpen {
            dependency: "m".into(),
            retry_after_ms: 500
        }
        .is_retryable());
        assert!(!Error::validation("bad input").is_retryable());
        assert!(!Error::RateLimited {
            client_id: "c".into(),
            current: 3,
            max_requests: 3
        }
        .is_retryable());
    }

    #[test]
    fn test_breaker_counting_exclusions() {
        assert!(!Error::validation("bad").counts_against_breaker());
        assert!(!Error::CircuitOpen {
            dependency: "m".into(),
            retry_after_ms: 0
        }
        .counts_against_breaker());
        assert!(Error::transient("net").counts_against_breaker());
        assert!(Error::PredictionFailed {
            model: "m".into(),
            message: "boom".into()
        }
        .counts_against_breaker());
        assert!(Error::Timeout {
            dependency: "m".into(),
            elapsed_ms: 1
        }
        .counts_against_breaker());
    }

    #[test]
    fn test_errors_clone_for_dedup_waiters() {
        let err = Error::RetryExhausted {
            attempts: 3,
            last: Box::new(Error::transient("net down")),
        };
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
        assert_eq!(cloned.kind(), "retry_exhausted");
    }
}
