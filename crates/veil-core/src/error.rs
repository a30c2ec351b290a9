use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error types for Veil.
#[derive(Error, Debug)]
pub enum AppError {
    /// No parser configuration stored for the (workspace, source) pair.
    #[error("No parser configuration for source '{source_name}' in workspace '{workspace}'")]
    ConfigNotFound {
        workspace: String,
        source_name: String,
    },

    /// The configuration names a parser that was never registered.
    #[error("Parser '{0}' is not registered")]
    ParserNotFound(String),

    /// A second parser tried to register under an existing name.
    #[error("Parser '{0}' is already registered")]
    DuplicateName(String),

    /// Every proxy of the workspace is in use or cooling down.
    #[error("No available proxy for workspace '{0}'")]
    PoolExhausted(String),

    /// Page rendering did not finish in time.
    #[error("Rendering timed out after {0} seconds")]
    RenderTimeout(u64),

    /// `render_page` was called for a source without `use_render`.
    #[error("Rendering is disabled for this source")]
    RenderingDisabled,

    /// Network/connection error (proxy refused, reset, DNS...).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Malformed parser options or registration input.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Missing or unusable runtime configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The whole job exceeded its time budget.
    #[error("Job timed out after {0} seconds")]
    Timeout(u64),

    /// The job was cancelled by its caller.
    #[error("Job cancelled")]
    Cancelled,

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Parser-specific failure that fits no other kind.
    #[error("Parser error: {0}")]
    ParserError(String),
}

/// Normalized error taxonomy reported in failed job outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigNotFound,
    ParserNotFound,
    DuplicateName,
    PoolExhausted,
    RenderTimeout,
    RenderingDisabled,
    Network,
    Validation,
    Configuration,
    Timeout,
    Cancelled,
    Storage,
    Parser,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigNotFound => "config_not_found",
            ErrorKind::ParserNotFound => "parser_not_found",
            ErrorKind::DuplicateName => "duplicate_name",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::RenderTimeout => "render_timeout",
            ErrorKind::RenderingDisabled => "rendering_disabled",
            ErrorKind::Network => "network",
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
            ErrorKind::Parser => "parser",
        }
    }

    /// Returns true if re-running the job later, unchanged, may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::PoolExhausted
                | ErrorKind::Network
                | ErrorKind::RenderTimeout
                | ErrorKind::Timeout
                | ErrorKind::Storage
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::ConfigNotFound { .. } => ErrorKind::ConfigNotFound,
            AppError::ParserNotFound(_) => ErrorKind::ParserNotFound,
            AppError::DuplicateName(_) => ErrorKind::DuplicateName,
            AppError::PoolExhausted(_) => ErrorKind::PoolExhausted,
            AppError::RenderTimeout(_) => ErrorKind::RenderTimeout,
            AppError::RenderingDisabled => ErrorKind::RenderingDisabled,
            AppError::NetworkError(_) => ErrorKind::Network,
            AppError::ValidationError(_) | AppError::SerializationError(_) => {
                ErrorKind::Validation
            }
            AppError::ConfigError(_) => ErrorKind::Configuration,
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::Cancelled => ErrorKind::Cancelled,
            AppError::DatabaseError(_) => ErrorKind::Storage,
            AppError::ParserError(_) => ErrorKind::Parser,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Returns true if the held proxy should be put on cooldown.
    pub fn is_proxy_attributable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_) | AppError::RenderTimeout(_) | AppError::Timeout(_)
        )
    }
}
