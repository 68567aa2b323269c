//! Error taxonomy.
//!
//! Every failure that can land on a step is normalized into [`StepError`]
//! (`kind`, `message`, `retryable`). The typed errors raised by plugin and AI
//! capabilities convert into it with a fixed retryability table.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable error kind carried by [`StepError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Validation
    DuplicateStepId,
    MissingDependency,
    CycleDetected,
    // Reference
    UnresolvedReference,
    ForwardReference,
    InvalidPath,
    // Plugin
    AuthExpired,
    InvalidParams,
    ProviderError,
    RateLimited,
    // AI
    ModelError,
    AiTimeout,
    SchemaMismatch,
    // Execution
    StepTimeout,
    Timeout,
    Stopped,
    RolledBack,
    Cancelled,
    // Step logic
    DataOperation,
    Condition,
    Internal,
}

/// Coarse grouping of [`ErrorKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Reference,
    Plugin,
    Ai,
    Execution,
    Step,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicateStepId => "duplicate_step_id",
            Self::MissingDependency => "missing_dependency",
            Self::CycleDetected => "cycle_detected",
            Self::UnresolvedReference => "unresolved_reference",
            Self::ForwardReference => "forward_reference",
            Self::InvalidPath => "invalid_path",
            Self::AuthExpired => "auth_expired",
            Self::InvalidParams => "invalid_params",
            Self::ProviderError => "provider_error",
            Self::RateLimited => "rate_limited",
            Self::ModelError => "model_error",
            Self::AiTimeout => "ai_timeout",
            Self::SchemaMismatch => "schema_mismatch",
            Self::StepTimeout => "step_timeout",
            Self::Timeout => "timeout",
            Self::Stopped => "stopped",
            Self::RolledBack => "rolled_back",
            Self::Cancelled => "cancelled",
            Self::DataOperation => "data_operation",
            Self::Condition => "condition",
            Self::Internal => "internal",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DuplicateStepId | Self::MissingDependency | Self::CycleDetected => {
                ErrorCategory::Validation
            }
            Self::UnresolvedReference | Self::ForwardReference | Self::InvalidPath => {
                ErrorCategory::Reference
            }
            Self::AuthExpired | Self::InvalidParams | Self::ProviderError | Self::RateLimited => {
                ErrorCategory::Plugin
            }
            Self::ModelError | Self::AiTimeout | Self::SchemaMismatch => ErrorCategory::Ai,
            Self::StepTimeout | Self::Timeout | Self::Stopped | Self::RolledBack | Self::Cancelled => {
                ErrorCategory::Execution
            }
            Self::DataOperation | Self::Condition | Self::Internal => ErrorCategory::Step,
        }
    }

    /// Whether errors of this kind are candidates for retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ProviderError | Self::ModelError | Self::AiTimeout | Self::StepTimeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Structured error stored in `StepResult.error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl StepError {
    /// Build an error whose retryability follows its kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }
}

// ---------------------------------------------------------------------------
// Capability errors
// ---------------------------------------------------------------------------

/// Errors returned by a plugin executor.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthExpired(_) => ErrorKind::AuthExpired,
            Self::InvalidParams(_) => ErrorKind::InvalidParams,
            Self::ProviderError(_) => ErrorKind::ProviderError,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
        }
    }
}

impl From<PluginError> for StepError {
    fn from(err: PluginError) -> Self {
        StepError::new(err.kind(), err.to_string())
    }
}

/// Errors returned by the AI capability.
#[derive(Debug, Clone, Error)]
pub enum AiError {
    #[error("model error: {0}")]
    ModelError(String),

    #[error("AI call timed out: {0}")]
    Timeout(String),

    #[error("output does not match schema: {0}")]
    SchemaMismatch(String),
}

impl AiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModelError(_) => ErrorKind::ModelError,
            Self::Timeout(_) => ErrorKind::AiTimeout,
            Self::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
        }
    }
}

impl From<AiError> for StepError {
    fn from(err: AiError) -> Self {
        StepError::new(err.kind(), err.to_string())
    }
}
