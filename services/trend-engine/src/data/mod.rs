//! Market data acquisition.
//!
//! Provider payloads, the per-symbol indicator record they fold into, and
//! the routing/limiting machinery used to fetch them.
//!
//! # Categories
//! - **Quote**: price, moving averages, relative strength, volume metrics
//! - **OptionChain**: per-expiry implied volatility, IVR, options volume
//! - **OpenInterest**: call/put open interest change by expiry bucket

mod provider;
mod rate_limiter;
mod router;

pub use provider::{MarketDataProvider, ProviderError};
pub use rate_limiter::{
    shared_limiter, Clock, ManualClock, RateLimiter, RateStats, SharedRateLimiter, SystemClock,
};
pub use router::{DataSourceRouter, RouteError, RoutedPayload, RouterConfig};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::etf::Holding;
use crate::scoring::options::{positioning_score, term_structure};

// ============================================================================
// Data Category
// ============================================================================

/// A kind of data request the router knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    Quote,
    OptionChain,
    OpenInterest,
}

impl DataCategory {
    pub const ALL: [DataCategory; 3] = [
        DataCategory::Quote,
        DataCategory::OptionChain,
        DataCategory::OpenInterest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::OptionChain => "option_chain",
            Self::OpenInterest => "open_interest",
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Provider Payloads
// ============================================================================

/// Quote and derived price metrics for one symbol.
///
/// Relative-strength fields are ratios against the benchmark (1.05 means
/// five percent ahead). Percent fields are plain percentages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub sma20: Option<f64>,
    pub sma50: Option<f64>,
    pub sma200: Option<f64>,
    pub rsi: Option<f64>,
    /// Normalized slope of the 20-day average
    pub ma20_slope: Option<f64>,
    pub rs_5d: Option<f64>,
    pub rs_20d: Option<f64>,
    pub rs_63d: Option<f64>,
    pub return_20d: Option<f64>,
    pub return_63d: Option<f64>,
    pub high_52w: Option<f64>,
    pub max_drawdown_20d: Option<f64>,
    pub atr_percent: Option<f64>,
    /// Today's volume over its 20-day average
    pub volume_spike: Option<f64>,
    pub up_down_volume_ratio: Option<f64>,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionRight {
    Call,
    Put,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    pub expiry: NaiveDate,
    pub days_to_expiry: u32,
    pub right: OptionRight,
    pub strike: f64,
    /// Either a fraction (0.25) or vol points (25.0); normalized on use
    pub implied_vol: Option<f64>,
    pub delta: Option<f64>,
    pub open_interest: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionChain {
    pub symbol: String,
    pub underlying_price: f64,
    pub contracts: Vec<OptionContract>,
    /// Implied-volatility rank, 0..100
    pub iv_rank: Option<f64>,
    /// Options volume relative to its 90-day average
    pub relative_volume: Option<f64>,
    pub as_of: DateTime<Utc>,
}

/// Days-to-expiry bucket for open interest aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DteBucket {
    /// 0-7 days
    Near,
    /// 8-30 days
    Mid,
    /// 31-90 days
    Far,
}

impl DteBucket {
    pub fn for_days(days: u32) -> Option<Self> {
        match days {
            0..=7 => Some(Self::Near),
            8..=30 => Some(Self::Mid),
            31..=90 => Some(Self::Far),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OiBucket {
    pub bucket: DteBucket,
    pub call_oi: u64,
    pub put_oi: u64,
    /// Change in call OI over the lookback window
    pub call_change: i64,
    pub put_change: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenInterestSnapshot {
    pub symbol: String,
    pub buckets: Vec<OiBucket>,
    pub lookback_days: u32,
    pub as_of: DateTime<Utc>,
}

impl OpenInterestSnapshot {
    pub fn total_oi(&self) -> u64 {
        self.buckets.iter().map(|b| b.call_oi + b.put_oi).sum()
    }

    pub fn total_change(&self) -> i64 {
        self.buckets.iter().map(|b| b.call_change + b.put_change).sum()
    }
}

/// A successful provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProviderPayload {
    Quote(Quote),
    OptionChain(OptionChain),
    OpenInterest(OpenInterestSnapshot),
}

impl ProviderPayload {
    pub fn category(&self) -> DataCategory {
        match self {
            Self::Quote(_) => DataCategory::Quote,
            Self::OptionChain(_) => DataCategory::OptionChain,
            Self::OpenInterest(_) => DataCategory::OpenInterest,
        }
    }
}

// ============================================================================
// Indicator Fields
// ============================================================================

/// Latest indicator values stored per symbol.
///
/// Every provider payload is folded in here; scoring reads only this record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorFields {
    pub price: Option<f64>,
    pub sma20: Option<f64>,
    pub sma50: Option<f64>,
    pub sma200: Option<f64>,
    pub rsi: Option<f64>,
    pub ma20_slope: Option<f64>,
    pub rs_5d: Option<f64>,
    pub rs_20d: Option<f64>,
    pub rs_63d: Option<f64>,
    pub return_20d: Option<f64>,
    pub return_63d: Option<f64>,
    pub high_52w: Option<f64>,
    pub max_drawdown_20d: Option<f64>,
    pub atr_percent: Option<f64>,
    pub volume_spike: Option<f64>,
    pub up_down_volume_ratio: Option<f64>,
    pub iv30: Option<f64>,
    pub iv60: Option<f64>,
    pub iv90: Option<f64>,
    pub iv_slope: Option<f64>,
    pub iv_rank: Option<f64>,
    pub options_rel_vol: Option<f64>,
    pub total_oi: Option<u64>,
    pub delta_oi_1d: Option<i64>,
    pub positioning_score: Option<f64>,
    pub term_score: Option<f64>,
    /// Last successful fetch per category
    #[serde(default)]
    pub fetched_at: BTreeMap<DataCategory, DateTime<Utc>>,
}

impl IndicatorFields {
    /// Seed from the extended fields carried on an imported holding.
    pub fn from_holding(holding: &Holding) -> Self {
        Self {
            sma50: holding.sma50,
            sma200: holding.sma200,
            rsi: holding.rsi,
            positioning_score: holding.positioning_score,
            term_score: holding.term_score,
            ..Default::default()
        }
    }

    /// Whether `category` was fetched within `stale_after` of `now`.
    pub fn is_fresh(&self, category: DataCategory, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.fetched_at
            .get(&category)
            .is_some_and(|at| now - *at < stale_after)
    }

    /// Fold a provider payload into the record, deriving options scores.
    pub fn apply(&mut self, payload: &ProviderPayload, at: DateTime<Utc>) {
        match payload {
            ProviderPayload::Quote(q) => {
                self.price = Some(q.price);
                self.sma20 = q.sma20.or(self.sma20);
                self.sma50 = q.sma50.or(self.sma50);
                self.sma200 = q.sma200.or(self.sma200);
                self.rsi = q.rsi.or(self.rsi);
                self.ma20_slope = q.ma20_slope;
                self.rs_5d = q.rs_5d;
                self.rs_20d = q.rs_20d;
                self.rs_63d = q.rs_63d;
                self.return_20d = q.return_20d;
                self.return_63d = q.return_63d;
                self.high_52w = q.high_52w;
                self.max_drawdown_20d = q.max_drawdown_20d;
                self.atr_percent = q.atr_percent;
                self.volume_spike = q.volume_spike;
                self.up_down_volume_ratio = q.up_down_volume_ratio;
            }
            ProviderPayload::OptionChain(chain) => {
                if let Some(term) = term_structure(chain) {
                    self.iv30 = term.iv30;
                    self.iv60 = term.iv60;
                    self.iv90 = term.iv90;
                    self.iv_slope = term.slope;
                    self.term_score = term.slope;
                }
                self.iv_rank = chain.iv_rank.or(self.iv_rank);
                self.options_rel_vol = chain.relative_volume.or(self.options_rel_vol);
            }
            ProviderPayload::OpenInterest(oi) => {
                self.total_oi = Some(oi.total_oi());
                self.delta_oi_1d = Some(oi.total_change());
                if let Some(score) = positioning_score(&oi.buckets) {
                    self.positioning_score = Some(score);
                }
            }
        }
        self.fetched_at.insert(payload.category(), at);
    }
}
