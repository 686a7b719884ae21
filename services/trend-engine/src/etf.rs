//! ETF configuration and holdings.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, Result};

/// Tolerance on summed holding weights, in percent.
const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtfLevel {
    Sector,
    Industry,
}

impl EtfLevel {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Sector => "sector",
            Self::Industry => "industry",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "sector" => Some(Self::Sector),
            "industry" => Some(Self::Industry),
            _ => None,
        }
    }
}

/// How a representative subset of an ETF's holdings is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum CoverageRule {
    /// The N highest-weight holdings
    TopN(usize),
    /// Highest weights until the cumulative weight (%) reaches the threshold
    WeightThreshold(f64),
}

impl CoverageRule {
    pub fn to_db_parts(&self) -> (&'static str, f64) {
        match self {
            Self::TopN(n) => ("top_n", *n as f64),
            Self::WeightThreshold(t) => ("weight_threshold", *t),
        }
    }

    pub fn from_db_parts(kind: &str, value: f64) -> Option<Self> {
        match kind {
            "top_n" => Some(Self::TopN(value.max(0.0) as usize)),
            "weight_threshold" => Some(Self::WeightThreshold(value)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    #[default]
    Daily,
    Weekly,
    Manual,
}

impl UpdateFrequency {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Manual => "manual",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtfStatus {
    Ready,
    #[default]
    Pending,
    Error,
    Warning,
    Updating,
}

impl EtfStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Pending => "pending",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Updating => "updating",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(Self::Ready),
            "pending" => Some(Self::Pending),
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "updating" => Some(Self::Updating),
            _ => None,
        }
    }
}

impl fmt::Display for EtfStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

// ============================================================================
// ETF Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtfConfig {
    pub symbol: String,
    pub name: String,
    pub level: EtfLevel,
    /// Required for industry ETFs, absent for sectors
    pub parent_sector: Option<String>,
    pub coverage: CoverageRule,
    pub frequency: UpdateFrequency,
    /// Holdings count of the full fund, used as the completeness weight
    pub total_holdings: usize,
    pub status: EtfStatus,
}

impl EtfConfig {
    /// A sector ETF covering the top `top_n` holdings.
    pub fn sector(symbol: &str, top_n: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            name: known_etf_name(symbol).unwrap_or(symbol).to_string(),
            level: EtfLevel::Sector,
            parent_sector: None,
            coverage: CoverageRule::TopN(top_n),
            frequency: UpdateFrequency::Daily,
            total_holdings: 0,
            status: EtfStatus::Pending,
        }
    }

    /// An industry ETF under `parent` covering the top `top_n` holdings.
    pub fn industry(symbol: &str, parent: &str, top_n: usize) -> Self {
        Self {
            level: EtfLevel::Industry,
            parent_sector: Some(parent.to_string()),
            ..Self::sector(symbol, top_n)
        }
    }

    pub fn with_total_holdings(mut self, total: usize) -> Self {
        self.total_holdings = total;
        self
    }

    pub fn with_coverage(mut self, coverage: CoverageRule) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::Validation("ETF symbol is empty".into()));
        }
        match (self.level, &self.parent_sector) {
            (EtfLevel::Industry, None) => {
                return Err(EngineError::Validation(format!(
                    "industry ETF {} has no parent sector",
                    self.symbol
                )))
            }
            (EtfLevel::Sector, Some(parent)) => {
                return Err(EngineError::Validation(format!(
                    "sector ETF {} declares parent {}",
                    self.symbol, parent
                )))
            }
            _ => {}
        }
        match self.coverage {
            CoverageRule::TopN(0) => Err(EngineError::Validation(format!(
                "ETF {} has top-N coverage of zero",
                self.symbol
            ))),
            CoverageRule::WeightThreshold(t) if !(t > 0.0 && t <= 100.0) => {
                Err(EngineError::Validation(format!(
                    "ETF {} weight threshold {} outside (0, 100]",
                    self.symbol, t
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Display names for the standard SPDR sectors and common industry funds.
pub fn known_etf_name(symbol: &str) -> Option<&'static str> {
    let name = match symbol {
        "XLK" => "Technology",
        "XLC" => "Communication Services",
        "XLY" => "Consumer Discretionary",
        "XLP" => "Consumer Staples",
        "XLV" => "Health Care",
        "XLF" => "Financials",
        "XLI" => "Industrials",
        "XLE" => "Energy",
        "XLU" => "Utilities",
        "XLRE" => "Real Estate",
        "XLB" => "Materials",
        "SOXX" => "Semiconductors",
        "SMH" => "Semiconductors",
        "IGV" => "Software",
        "XOP" => "Oil & Gas Exploration",
        "XRT" => "Retail",
        "KBE" => "Banks",
        "IBB" => "Biotechnology",
        "XHB" => "Homebuilders",
        "XME" => "Metals & Mining",
        "JETS" => "Airlines",
        _ => return None,
    };
    Some(name)
}

// ============================================================================
// Holding
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub etf_symbol: String,
    pub ticker: String,
    /// Percent of fund assets
    pub weight: f64,
    pub sma50: Option<f64>,
    pub sma200: Option<f64>,
    pub rsi: Option<f64>,
    pub positioning_score: Option<f64>,
    pub term_score: Option<f64>,
}

impl Holding {
    pub fn new(etf_symbol: &str, ticker: &str, weight: f64) -> Self {
        Self {
            etf_symbol: etf_symbol.to_string(),
            ticker: ticker.to_string(),
            weight,
            sma50: None,
            sma200: None,
            rsi: None,
            positioning_score: None,
            term_score: None,
        }
    }
}

/// Reject negative, non-finite, or over-allocated weights.
pub fn validate_holdings(etf: &str, holdings: &[Holding]) -> Result<()> {
    if holdings.is_empty() {
        return Err(EngineError::Validation(format!(
            "ETF {} has no holdings recorded",
            etf
        )));
    }

    let mut total = 0.0;
    for h in holdings {
        if !h.weight.is_finite() || h.weight < 0.0 {
            return Err(EngineError::Validation(format!(
                "holding {} in {} has invalid weight {}",
                h.ticker, etf, h.weight
            )));
        }
        total += h.weight;
    }

    if total > 100.0 + WEIGHT_SUM_TOLERANCE {
        return Err(EngineError::Validation(format!(
            "holdings of {} sum to {:.2}%",
            etf, total
        )));
    }
    Ok(())
}
