//! # Error Handling Module
//!
//! ## Purpose
//! Centralized error handling for the citation core, providing structured
//! error types for retrieval, generation, binding, audit, and the API surface.
//!
//! ## Input/Output Specification
//! - **Input**: Error conditions from system components and external calls
//! - **Output**: Structured error types with context and error chains
//! - **Error Categories**: Storage, Retrieval, Generation, Audit, API, Configuration
//!
//! ## Propagation policy
//! Retrieval errors abort the request with a structured error response. Model
//! errors are recovered via the retrieval-only fallback generator. Binding
//! failures never abort; they downgrade the affected citation. Audit errors
//! never affect the response.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used throughout the application
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error types for the citation core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation failed for field '{field}': {reason}")]
    ValidationFailed { field: String, reason: String },

    /// Corpus store read/write errors
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Record encoding/decoding errors
    #[error("Serialization failed: {message}")]
    SerializationFailed { message: String },

    /// Corpus Store read failure surfaced to the caller
    #[error("Retrieval failure: {details}")]
    RetrievalFailure { details: String },

    /// Model call exceeded its deadline
    #[error("Model call timed out after {seconds}s")]
    LlmTimeout { seconds: u64 },

    /// Model endpoint unreachable or not configured
    #[error("Model unavailable: {details}")]
    LlmUnavailable { details: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Audit write skipped because the circuit breaker is open
    #[error("Audit write suppressed (circuit breaker open)")]
    AuditWriteSuppressed,

    /// Requested query run does not exist
    #[error("Query run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Requested opinion does not exist
    #[error("Opinion not found: {opinion_id}")]
    OpinionNotFound { opinion_id: String },

    /// External rate limit exhausted
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// API key missing or wrong
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// Invalid inbound request
    #[error("Invalid request: {details}")]
    InvalidRequest { details: String },

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CoreError {
    /// Check if the error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::LlmTimeout { .. }
                | CoreError::LlmUnavailable { .. }
                | CoreError::Http(_)
                | CoreError::RateLimitExceeded
        )
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            CoreError::Config { .. } | CoreError::Toml(_) => "configuration",
            CoreError::Storage(_) | CoreError::SerializationFailed { .. } | CoreError::Io(_) => {
                "storage"
            }
            CoreError::RetrievalFailure { .. } | CoreError::OpinionNotFound { .. } => "retrieval",
            CoreError::LlmTimeout { .. } | CoreError::LlmUnavailable { .. } => "generation",
            CoreError::AuditWriteSuppressed | CoreError::RunNotFound { .. } => "audit",
            CoreError::Http(_) | CoreError::Json(_) => "transport",
            CoreError::RateLimitExceeded
            | CoreError::AuthenticationFailed { .. }
            | CoreError::InvalidRequest { .. } => "api",
            CoreError::ValidationFailed { .. } | CoreError::Internal { .. } => "generic",
        }
    }
}

impl From<bincode::Error> for CoreError {
    fn from(err: bincode::Error) -> Self {
        CoreError::SerializationFailed {
            message: format!("Binary serialization error: {}", err),
        }
    }
}

/// Failure reasons attached to UNVERIFIED citations.
///
/// Emitted only in debug/audit records and telemetry breakdowns, never in the
/// answer markdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    QuoteNotFound,
    WrongCaseId,
    WrongPage,
    TooShort,
    OcrArtifactMismatch,
    EllipsisFragment,
    NormalizationMismatch,
    NoCandidatePassages,
    Other,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::QuoteNotFound => "QUOTE_NOT_FOUND",
            FailureReason::WrongCaseId => "WRONG_CASE_ID",
            FailureReason::WrongPage => "WRONG_PAGE",
            FailureReason::TooShort => "TOO_SHORT",
            FailureReason::OcrArtifactMismatch => "OCR_ARTIFACT_MISMATCH",
            FailureReason::EllipsisFragment => "ELLIPSIS_FRAGMENT",
            FailureReason::NormalizationMismatch => "NORMALIZATION_MISMATCH",
            FailureReason::NoCandidatePassages => "NO_CANDIDATE_PASSAGES",
            FailureReason::Other => "OTHER",
        }
    }

    /// All reasons, in the order used for telemetry breakdowns.
    pub fn all() -> &'static [FailureReason] {
        &[
            FailureReason::QuoteNotFound,
            FailureReason::WrongCaseId,
            FailureReason::WrongPage,
            FailureReason::TooShort,
            FailureReason::OcrArtifactMismatch,
            FailureReason::EllipsisFragment,
            FailureReason::NormalizationMismatch,
            FailureReason::NoCandidatePassages,
            FailureReason::Other,
        ]
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
