//! Error types for the triage router

use std::time::Duration;

use thiserror::Error;

/// Result type alias for the triage router
pub type Result<T> = std::result::Result<T, TriageError>;

/// Main error type for the triage router.
///
/// Soft outcomes (refusals, fallbacks, exhausted turn budgets) are values and
/// never appear here. Everything in this enum aborts the current turn.
#[derive(Debug, Error)]
pub enum TriageError {
    /// The completion service failed to produce a result
    #[error("Completion error: {0}")]
    Completion(String),

    /// A structured result did not satisfy its schema
    #[error("Contract violation at {boundary}: {message}")]
    ContractViolation { boundary: String, message: String },

    /// The handler model asked for something it is not allowed to do
    #[error("Model behavior error: {message}")]
    ModelBehavior { message: String },

    /// Tool execution error
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// A handoff outside the registered graph with nothing else to show for the step
    #[error("Invalid transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    /// Registry construction error
    #[error("Registry error: {0}")]
    Registry(String),

    /// A handler requires a gate that was never registered
    #[error("Unknown safety gate: {0}")]
    UnknownGate(String),

    /// A deadline elapsed
    #[error("{operation} timed out after {limit:?}")]
    Timeout { operation: String, limit: Duration },

    /// Thread or memory store error
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error from the OpenAI API
    #[error("OpenAI API error: {0}")]
    OpenAI(#[from] async_openai::error::OpenAIError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl TriageError {
    pub fn contract(boundary: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ContractViolation {
            boundary: boundary.into(),
            message: message.into(),
        }
    }

    /// Recover a typed error from a Tower service error.
    pub fn from_boxed(err: tower::BoxError) -> Self {
        match err.downcast::<TriageError>() {
            Ok(typed) => *typed,
            Err(other) => match other.downcast::<tower::timeout::error::Elapsed>() {
                Ok(_) => Self::Timeout {
                    operation: "service call".to_string(),
                    limit: Duration::ZERO,
                },
                Err(other) => Self::Completion(other.to_string()),
            },
        }
    }

    /// Short machine-readable category, safe to show to observers.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Completion(_) | Self::OpenAI(_) => "completion",
            Self::ContractViolation { .. } | Self::Serialization(_) => "contract_violation",
            Self::ModelBehavior { .. } => "model_behavior",
            Self::ToolExecution { .. } => "tool_execution",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Registry(_) | Self::UnknownGate(_) | Self::Config(_) => "configuration",
            Self::Timeout { .. } => "timeout",
            Self::Store(_) | Self::Database(_) => "store",
        }
    }

    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Completion(_) | Self::OpenAI(_) | Self::Timeout { .. }
        )
    }
}
