//! Configuration management for the trend engine.
//!
//! The engine reads a single JSON file at `~/.trend-engine/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (TREND_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `TREND_LOG_LEVEL` → observability.log_level
//! - `TREND_LOG_FORMAT` → observability.log_format
//! - `TREND_DB_PATH` → storage.db_path
//! - `TREND_COMPUTE_THRESHOLD` → completeness.ready_threshold
//! - `TREND_WAIT_FOR_RATE_LIMIT` → data_sources.wait_for_rate_limit

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::source::ProviderId;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".trend-engine"),
        |dirs| dirs.home_dir().join(".trend-engine"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Observability
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Extra module targets forced down to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. Defaults to `<config_dir>/trend.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| config_dir().join("trend.db"))
    }
}

// ============================================================================
// Data Sources
// ============================================================================

/// Primary/fallback selection for one data category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRoute {
    pub primary: ProviderId,
    #[serde(default)]
    pub fallback: Option<ProviderId>,
    #[serde(default = "default_true")]
    pub auto_fallback: bool,
}

impl SourceRoute {
    pub fn new(primary: ProviderId, fallback: Option<ProviderId>) -> Self {
        Self {
            primary,
            fallback,
            auto_fallback: true,
        }
    }
}

/// Routing table for the three fetch categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourcesConfig {
    /// Quotes, moving averages, relative strength
    #[serde(default = "default_market_route")]
    pub market_data: SourceRoute,

    /// Option chains (IV term structure, IVR)
    #[serde(default = "default_options_route")]
    pub options_data: SourceRoute,

    /// Open interest by expiry bucket
    #[serde(default = "default_options_route")]
    pub open_interest: SourceRoute,

    /// Wait for a limiter slot instead of failing the attempt over.
    #[serde(default = "default_true")]
    pub wait_for_rate_limit: bool,
}

impl Default for DataSourcesConfig {
    fn default() -> Self {
        Self {
            market_data: default_market_route(),
            options_data: default_options_route(),
            open_interest: default_options_route(),
            wait_for_rate_limit: true,
        }
    }
}

fn default_market_route() -> SourceRoute {
    SourceRoute::new(ProviderId::PrimaryBroker, Some(ProviderId::SecondaryBroker))
}

fn default_options_route() -> SourceRoute {
    SourceRoute::new(ProviderId::SecondaryBroker, Some(ProviderId::PrimaryBroker))
}

// ============================================================================
// Providers
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub max_requests_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_primary_limits")]
    pub primary_broker: ProviderLimitConfig,
    #[serde(default = "default_secondary_limits")]
    pub secondary_broker: ProviderLimitConfig,
}

impl ProvidersConfig {
    pub fn get(&self, id: ProviderId) -> &ProviderLimitConfig {
        match id {
            ProviderId::PrimaryBroker => &self.primary_broker,
            ProviderId::SecondaryBroker => &self.secondary_broker,
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            primary_broker: default_primary_limits(),
            secondary_broker: default_secondary_limits(),
        }
    }
}

fn default_primary_limits() -> ProviderLimitConfig {
    ProviderLimitConfig {
        enabled: true,
        max_requests_per_minute: 45,
    }
}

fn default_secondary_limits() -> ProviderLimitConfig {
    ProviderLimitConfig {
        enabled: true,
        max_requests_per_minute: 55,
    }
}

// ============================================================================
// Completeness
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletenessConfig {
    /// Benchmark symbols that must be fully covered before scoring
    #[serde(default = "default_anchors")]
    pub anchors: Vec<String>,

    /// Overall completeness (%) required for scoring; also the `ready` cutoff
    #[serde(default = "default_ready_threshold")]
    pub ready_threshold: f64,

    /// Below this a source is reported as `error`
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
}

impl Default for CompletenessConfig {
    fn default() -> Self {
        Self {
            anchors: default_anchors(),
            ready_threshold: default_ready_threshold(),
            warning_threshold: default_warning_threshold(),
        }
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// How composites treat a sub-score whose inputs were not available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingScorePolicy {
    /// Drop the sub-score and rescale the remaining weights to sum to 1.
    #[default]
    Renormalize,
    /// Substitute the midpoint (50).
    Neutral,
    /// Refuse to score the entity.
    Refuse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub missing_policy: MissingScorePolicy,

    /// Trading-day offsets reported as deltas alongside each score
    #[serde(default = "default_delta_offsets")]
    pub delta_offsets: Vec<u32>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            missing_policy: MissingScorePolicy::default(),
            delta_offsets: default_delta_offsets(),
        }
    }
}

// ============================================================================
// Batch Update
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Data older than this is fetched again
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u64,

    /// Ignore freshness and fetch every category
    #[serde(default)]
    pub force_refresh: bool,

    #[serde(default = "default_top_n_sector")]
    pub default_top_n_sector: usize,

    #[serde(default = "default_top_n_industry")]
    pub default_top_n_industry: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            stale_after_hours: default_stale_after_hours(),
            force_refresh: false,
            default_top_n_sector: default_top_n_sector(),
            default_top_n_industry: default_top_n_industry(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub data_sources: DataSourcesConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub completeness: CompletenessConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub update: UpdateConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults
    /// when no file exists.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TREND_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("TREND_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Ok(path) = std::env::var("TREND_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(path));
        }
        if let Ok(threshold) = std::env::var("TREND_COMPUTE_THRESHOLD") {
            if let Ok(t) = threshold.parse() {
                self.completeness.ready_threshold = t;
            }
        }
        if let Ok(wait) = std::env::var("TREND_WAIT_FOR_RATE_LIMIT") {
            if let Ok(w) = wait.parse() {
                self.data_sources.wait_for_rate_limit = w;
            }
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
fn default_true() -> bool {
    true
}
fn default_anchors() -> Vec<String> {
    vec!["SPY".into()]
}
fn default_ready_threshold() -> f64 {
    90.0
}
fn default_warning_threshold() -> f64 {
    50.0
}
fn default_delta_offsets() -> Vec<u32> {
    vec![3, 5]
}
fn default_stale_after_hours() -> u64 {
    24
}
fn default_top_n_sector() -> usize {
    20
}
fn default_top_n_industry() -> usize {
    15
}
