//! Data source router with one-hop fallback.
//!
//! Each data category has a configured primary provider and an optional
//! fallback. A request goes to the primary; on a connection, timeout or
//! rate-limit failure (and with auto fallback on) it is sent to the fallback
//! exactly once. Every provider call first passes that provider's limiter.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use trend_common::config::{DataSourcesConfig, ProvidersConfig};
use trend_common::{ProviderId, SourceRoute};

use super::provider::{MarketDataProvider, ProviderError};
use super::rate_limiter::{RateLimiter, RateStats, SharedRateLimiter};
use super::{DataCategory, ProviderPayload};

// ============================================================================
// Router Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct RouterConfig {
    market_data: SourceRoute,
    options_data: SourceRoute,
    open_interest: SourceRoute,
    /// Wait for a limiter slot; when false a full window fails the attempt
    /// with `RateLimited`, which is fallback-eligible.
    pub wait_for_rate_limit: bool,
}

impl RouterConfig {
    pub fn from_sources(sources: &DataSourcesConfig) -> Self {
        Self {
            market_data: sources.market_data.clone(),
            options_data: sources.options_data.clone(),
            open_interest: sources.open_interest.clone(),
            wait_for_rate_limit: sources.wait_for_rate_limit,
        }
    }

    pub fn route(&self, category: DataCategory) -> &SourceRoute {
        match category {
            DataCategory::Quote => &self.market_data,
            DataCategory::OptionChain => &self.options_data,
            DataCategory::OpenInterest => &self.open_interest,
        }
    }

    pub fn set_route(&mut self, category: DataCategory, route: SourceRoute) {
        match category {
            DataCategory::Quote => self.market_data = route,
            DataCategory::OptionChain => self.options_data = route,
            DataCategory::OpenInterest => self.open_interest = route,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from_sources(&DataSourcesConfig::default())
    }
}

// ============================================================================
// Results
// ============================================================================

/// A payload together with how it was obtained.
#[derive(Debug, Clone)]
pub struct RoutedPayload {
    pub payload: ProviderPayload,
    pub served_by: ProviderId,
    pub used_fallback: bool,
    /// What the primary failed with when the fallback served
    pub primary_error: Option<ProviderError>,
}

/// Every attempt made for a request that no provider could serve.
#[derive(Debug, Clone, Error)]
#[error("{category} fetch for {symbol} failed: {}", describe_attempts(.attempts))]
pub struct RouteError {
    pub symbol: String,
    pub category: DataCategory,
    /// In call order; one entry, or two when the fallback was tried
    pub attempts: Vec<(ProviderId, ProviderError)>,
}

impl RouteError {
    /// The error that ended the request.
    pub fn last_error(&self) -> Option<&ProviderError> {
        self.attempts.last().map(|(_, e)| e)
    }
}

fn describe_attempts(attempts: &[(ProviderId, ProviderError)]) -> String {
    attempts
        .iter()
        .map(|(id, e)| format!("{}: {}", id, e))
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Data Source Router
// ============================================================================

struct ProviderEntry {
    provider: Arc<dyn MarketDataProvider>,
    enabled: bool,
}

pub struct DataSourceRouter {
    providers: RwLock<HashMap<ProviderId, ProviderEntry>>,
    limiters: HashMap<ProviderId, SharedRateLimiter>,
    config: RouterConfig,
}

impl DataSourceRouter {
    /// Create a router with one limiter per known provider.
    pub fn new(config: RouterConfig, limits: &ProvidersConfig) -> Self {
        let limiters = ProviderId::ALL
            .iter()
            .map(|id| {
                let rpm = limits.get(*id).max_requests_per_minute;
                (*id, Arc::new(RateLimiter::new(id.as_str(), rpm)))
            })
            .collect();

        Self {
            providers: RwLock::new(HashMap::new()),
            limiters,
            config,
        }
    }

    /// Replace a provider's limiter (e.g. one driven by a manual clock).
    pub fn with_limiter(mut self, id: ProviderId, limiter: SharedRateLimiter) -> Self {
        self.limiters.insert(id, limiter);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Register a provider under its own id, replacing any previous one.
    pub async fn register(&self, provider: Arc<dyn MarketDataProvider>) {
        let id = provider.id();
        let mut providers = self.providers.write().await;
        providers.insert(
            id,
            ProviderEntry {
                provider,
                enabled: true,
            },
        );
        info!(provider = %id, "Registered market data provider");
    }

    /// Enable or disable a provider. Disabled providers fail as unreachable.
    pub async fn set_enabled(&self, id: ProviderId, enabled: bool) -> bool {
        let mut providers = self.providers.write().await;
        match providers.get_mut(&id) {
            Some(entry) => {
                entry.enabled = enabled;
                info!(provider = %id, enabled, "Provider enabled state changed");
                true
            }
            None => false,
        }
    }

    pub fn limiter(&self, id: ProviderId) -> Option<&SharedRateLimiter> {
        self.limiters.get(&id)
    }

    pub fn rate_stats(&self) -> BTreeMap<ProviderId, RateStats> {
        self.limiters
            .iter()
            .map(|(id, limiter)| (*id, limiter.stats()))
            .collect()
    }

    /// Probe every enabled provider.
    pub async fn health_check(&self) -> BTreeMap<ProviderId, Result<(), ProviderError>> {
        let providers: Vec<_> = {
            let guard = self.providers.read().await;
            guard
                .iter()
                .filter(|(_, e)| e.enabled)
                .map(|(id, e)| (*id, Arc::clone(&e.provider)))
                .collect()
        };

        let mut results = BTreeMap::new();
        for (id, provider) in providers {
            let result = provider.health_check().await;
            if let Err(e) = &result {
                warn!(provider = %id, error = %e, "Provider health check failed");
            }
            results.insert(id, result);
        }
        results
    }

    /// Fetch one category of data for a symbol.
    pub async fn fetch(&self, symbol: &str, category: DataCategory) -> Result<RoutedPayload, RouteError> {
        let route = self.config.route(category).clone();

        let primary_error = match self.call_provider(route.primary, symbol, category).await {
            Ok(payload) => {
                debug!(provider = %route.primary, symbol, category = %category, "Fetched from primary");
                return Ok(RoutedPayload {
                    payload,
                    served_by: route.primary,
                    used_fallback: false,
                    primary_error: None,
                });
            }
            Err(e) => e,
        };

        let fallback = match route.fallback {
            Some(fallback)
                if route.auto_fallback
                    && fallback != route.primary
                    && primary_error.is_fallback_eligible() =>
            {
                fallback
            }
            _ => {
                warn!(
                    provider = %route.primary,
                    symbol,
                    category = %category,
                    error = %primary_error,
                    "Primary provider failed, no fallback attempted"
                );
                return Err(RouteError {
                    symbol: symbol.to_string(),
                    category,
                    attempts: vec![(route.primary, primary_error)],
                });
            }
        };

        warn!(
            provider = %route.primary,
            fallback = %fallback,
            symbol,
            category = %category,
            error = %primary_error,
            "Provider error, failing over to fallback provider"
        );

        match self.call_provider(fallback, symbol, category).await {
            Ok(payload) => Ok(RoutedPayload {
                payload,
                served_by: fallback,
                used_fallback: true,
                primary_error: Some(primary_error),
            }),
            Err(fallback_error) => {
                warn!(
                    provider = %fallback,
                    symbol,
                    category = %category,
                    error = %fallback_error,
                    "Fallback provider also failed"
                );
                Err(RouteError {
                    symbol: symbol.to_string(),
                    category,
                    attempts: vec![(route.primary, primary_error), (fallback, fallback_error)],
                })
            }
        }
    }

    async fn call_provider(
        &self,
        id: ProviderId,
        symbol: &str,
        category: DataCategory,
    ) -> Result<ProviderPayload, ProviderError> {
        let provider = {
            let providers = self.providers.read().await;
            match providers.get(&id) {
                Some(entry) if entry.enabled => Arc::clone(&entry.provider),
                Some(_) => return Err(ProviderError::Connection(format!("provider {} disabled", id))),
                None => {
                    return Err(ProviderError::Connection(format!(
                        "provider {} not registered",
                        id
                    )))
                }
            }
        };

        if let Some(limiter) = self.limiters.get(&id) {
            if self.config.wait_for_rate_limit {
                limiter.acquire().await;
            } else if let Err(wait) = limiter.try_acquire() {
                return Err(ProviderError::RateLimited {
                    retry_after_secs: Some(wait.as_secs().max(1)),
                });
            }
        }

        match category {
            DataCategory::Quote => provider.fetch_quote(symbol).await.map(ProviderPayload::Quote),
            DataCategory::OptionChain => provider
                .fetch_option_chain(symbol)
                .await
                .map(ProviderPayload::OptionChain),
            DataCategory::OpenInterest => provider
                .fetch_open_interest(symbol)
                .await
                .map(ProviderPayload::OpenInterest),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
