//! Error types for the engine.
//!
//! `EngineError` is what the public operations return. Provider calls fail
//! with the narrower `ProviderError` (see `data::provider`), which converts
//! into the matching engine variant.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad configuration or holdings data
    #[error("Validation error: {0}")]
    Validation(String),

    /// Provider unreachable
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Limiter saturated; back off rather than treat as missing data
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Provider answered without usable data
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    /// A batch session is already active
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Completeness gate unmet
    #[error("Not ready for scoring: {reason} (completeness {aggregate:.1}%, threshold {threshold:.1}%)")]
    NotReady {
        reason: String,
        aggregate: f64,
        threshold: f64,
    },

    /// Session completed but some fetches failed
    #[error("Session {session_id} finished with {failed} fetch error(s)")]
    PartialBatchFailure { session_id: String, failed: usize },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Scoring inputs missing under a policy that refuses to guess
    #[error("Incomplete inputs: {0}")]
    Incomplete(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Structured kind used in session error entries.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::RateLimitExceeded(_) => ErrorKind::RateLimitExceeded,
            Self::DataUnavailable(_) => ErrorKind::DataUnavailable,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Conflict(_)
            | Self::NotReady { .. }
            | Self::PartialBatchFailure { .. }
            | Self::SessionNotFound(_)
            | Self::Incomplete(_) => ErrorKind::Internal,
        }
    }
}

/// Kind tag recorded alongside each per-symbol failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Connection,
    Timeout,
    RateLimitExceeded,
    DataUnavailable,
    Storage,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::DataUnavailable => "data_unavailable",
            Self::Storage => "storage",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}
