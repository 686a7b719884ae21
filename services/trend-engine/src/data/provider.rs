//! Market data provider abstraction.
//!
//! Defines the `MarketDataProvider` capability trait. Concrete broker
//! clients live outside this crate; the router only sees the trait.

use async_trait::async_trait;
use thiserror::Error;

use trend_common::ProviderId;

use super::{OpenInterestSnapshot, OptionChain, Quote};
use crate::error::{EngineError, ErrorKind};

// ============================================================================
// Provider Error
// ============================================================================

/// Errors a provider call can fail with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Connection failed or provider not reachable
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Provider-side or local limiter throttle
    #[error("Rate limited{}", .retry_after_secs.map(|s| format!(", retry after {} seconds", s)).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    /// Provider answered but had nothing usable for the symbol
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),
}

impl ProviderError {
    /// Whether the router may try the fallback provider after this error.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::RateLimited { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimitExceeded,
            Self::DataUnavailable(_) => ErrorKind::DataUnavailable,
        }
    }
}

impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Connection(msg) => EngineError::Connection(msg),
            ProviderError::Timeout(msg) => EngineError::Timeout(msg),
            e @ ProviderError::RateLimited { .. } => EngineError::RateLimitExceeded(e.to_string()),
            ProviderError::DataUnavailable(msg) => EngineError::DataUnavailable(msg),
        }
    }
}

// ============================================================================
// Provider Trait
// ============================================================================

/// A live market data source.
///
/// Implementations must be cheap to share across tasks; the router holds
/// them as `Arc<dyn MarketDataProvider>`.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Which configured provider this is
    fn id(&self) -> ProviderId;

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, ProviderError>;

    async fn fetch_option_chain(&self, symbol: &str) -> Result<OptionChain, ProviderError>;

    async fn fetch_open_interest(&self, symbol: &str) -> Result<OpenInterestSnapshot, ProviderError>;

    /// Lightweight connectivity probe
    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
