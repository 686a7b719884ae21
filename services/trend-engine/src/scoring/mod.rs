//! Scoring engine.
//!
//! Pure, deterministic scoring over stored indicator fields. No I/O happens
//! here apart from delta lookups; the completeness gate is enforced by the
//! caller before anything in this module runs.
//!
//! # Composites
//! - **ETF**: `0.55·PriceRS + 0.20·Breadth + 0.25·OptionsConfirm`, where
//!   `PriceRS = 0.65·RelMom + 0.35·TrendQuality`
//! - **Stock**: `(0.65·avg(PriceMomentum, TrendStructure) + 0.15·VolumePrice
//!   + 0.20·OptionsOverlay) × (1 − QualityPenalty)`
//!
//! Missing sub-scores are handled per [`MissingScorePolicy`].

pub mod composite;
pub mod delta;
pub mod options;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::data::IndicatorFields;
use crate::error::{EngineError, Result};
use trend_common::MissingScorePolicy;

use composite::{
    breadth_score, options_confirm_score, options_overlay_score, price_momentum_score,
    quality_filter, relmom_score, trend_quality_score, trend_structure_score, volume_price_score,
};

/// Substitute for a missing sub-score under [`MissingScorePolicy::Neutral`].
pub const NEUTRAL_SCORE: f64 = 50.0;

// Sub-score keys, as stored in snapshots.
pub const RELMOM: &str = "relmom";
pub const TREND_QUALITY: &str = "trend_quality";
pub const PRICE_RS: &str = "price_rs";
pub const BREADTH: &str = "breadth";
pub const OPTIONS_CONFIRM: &str = "options_confirm";
pub const PRICE_MOMENTUM: &str = "price_momentum";
pub const TREND_STRUCTURE: &str = "trend_structure";
pub const TREND: &str = "trend";
pub const VOLUME_PRICE: &str = "volume_price";
pub const OPTIONS_OVERLAY: &str = "options_overlay";
pub const QUALITY: &str = "quality";
pub const QUALITY_PENALTY: &str = "quality_penalty";
pub const POSITIONING: &str = "positioning";
pub const TERM: &str = "term";

// ============================================================================
// Snapshot
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Etf,
    Stock,
}

impl EntityKind {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Etf => "etf",
            Self::Stock => "stock",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "etf" => Some(Self::Etf),
            "stock" => Some(Self::Stock),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// A scored entity on one date. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub symbol: String,
    pub kind: EntityKind,
    pub date: NaiveDate,
    pub composite: f64,
    pub sub_scores: BTreeMap<String, f64>,
    /// Effective weight of each leaf sub-score in the composite
    pub weights: BTreeMap<String, f64>,
}

// ============================================================================
// Weighted Combination
// ============================================================================

/// One weighted input to a composite. `weights` carries the leaf weights
/// when the input is itself a composite.
#[derive(Debug, Clone)]
pub struct Component {
    pub name: &'static str,
    pub weight: f64,
    pub value: Option<f64>,
    pub weights: BTreeMap<String, f64>,
}

impl Component {
    pub fn leaf(name: &'static str, weight: f64, value: Option<f64>) -> Self {
        Self {
            name,
            weight,
            value,
            weights: BTreeMap::from([(name.to_string(), 1.0)]),
        }
    }

    fn nested(name: &'static str, weight: f64, inner: Option<Combined>) -> Self {
        match inner {
            Some(c) => Self {
                name,
                weight,
                value: Some(c.score),
                weights: c.weights,
            },
            None => Self::leaf(name, weight, None),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Combined {
    pub score: f64,
    pub weights: BTreeMap<String, f64>,
}

/// Weighted sum of `components` under `policy`.
///
/// Returns `Ok(None)` when every component is missing, whatever the policy.
pub fn combine(
    entity: &str,
    components: Vec<Component>,
    policy: MissingScorePolicy,
) -> Result<Option<Combined>> {
    if components.iter().all(|c| c.value.is_none()) {
        return Ok(None);
    }

    let mut used: Vec<(f64, f64, BTreeMap<String, f64>)> = Vec::with_capacity(components.len());
    let mut dropped = false;
    for c in components {
        match (c.value, policy) {
            (Some(v), _) => used.push((c.weight, v, c.weights)),
            (None, MissingScorePolicy::Renormalize) => dropped = true,
            (None, MissingScorePolicy::Neutral) => used.push((c.weight, NEUTRAL_SCORE, c.weights)),
            (None, MissingScorePolicy::Refuse) => {
                return Err(EngineError::Incomplete(format!(
                    "{} is missing sub-score {}",
                    entity, c.name
                )))
            }
        }
    }

    let total_weight: f64 = used.iter().map(|(w, _, _)| w).sum();
    if total_weight <= 0.0 {
        return Ok(None);
    }
    let scale = if dropped { 1.0 / total_weight } else { 1.0 };

    let mut score = 0.0;
    let mut weights = BTreeMap::new();
    for (w, v, leaves) in used {
        let effective = w * scale;
        score += effective * v;
        for (leaf, lw) in leaves {
            *weights.entry(leaf).or_insert(0.0) += effective * lw;
        }
    }

    Ok(Some(Combined { score, weights }))
}

// ============================================================================
// Scoring Engine
// ============================================================================

/// Applies the composite formulas under a fixed missing-value policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringEngine {
    policy: MissingScorePolicy,
}

impl ScoringEngine {
    pub fn new(policy: MissingScorePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MissingScorePolicy {
        self.policy
    }

    /// Score an ETF from its own fields and its selected holdings' fields.
    pub fn score_etf(
        &self,
        symbol: &str,
        etf: &IndicatorFields,
        holdings: &[IndicatorFields],
        date: NaiveDate,
    ) -> Result<ScoreSnapshot> {
        let relmom = relmom_score(etf);
        let trend_quality = trend_quality_score(etf);
        let breadth = breadth_score(holdings);
        let options_confirm = options_confirm_score(holdings);

        let price_rs = combine(
            symbol,
            vec![
                Component::leaf(RELMOM, 0.65, relmom),
                Component::leaf(TREND_QUALITY, 0.35, trend_quality),
            ],
            self.policy,
        )?;
        let price_rs_value = price_rs.as_ref().map(|c| c.score);

        let composite = combine(
            symbol,
            vec![
                Component::nested(PRICE_RS, 0.55, price_rs),
                Component::leaf(BREADTH, 0.20, breadth),
                Component::leaf(OPTIONS_CONFIRM, 0.25, options_confirm),
            ],
            self.policy,
        )?
        .ok_or_else(|| EngineError::Incomplete(format!("{} has no scorable inputs", symbol)))?;

        let mut sub_scores = BTreeMap::new();
        insert_present(&mut sub_scores, RELMOM, relmom);
        insert_present(&mut sub_scores, TREND_QUALITY, trend_quality);
        insert_present(&mut sub_scores, PRICE_RS, price_rs_value);
        insert_present(&mut sub_scores, BREADTH, breadth);
        insert_present(&mut sub_scores, OPTIONS_CONFIRM, options_confirm);
        insert_present(&mut sub_scores, POSITIONING, etf.positioning_score);
        insert_present(&mut sub_scores, TERM, etf.term_score);

        debug!(symbol = %symbol, composite = composite.score, "Scored ETF");

        Ok(ScoreSnapshot {
            symbol: symbol.to_string(),
            kind: EntityKind::Etf,
            date,
            composite: composite.score,
            sub_scores,
            weights: composite.weights,
        })
    }

    /// Score a single stock from its own fields.
    pub fn score_stock(&self, symbol: &str, fields: &IndicatorFields, date: NaiveDate) -> Result<ScoreSnapshot> {
        let price_momentum = price_momentum_score(fields);
        let trend_structure = trend_structure_score(fields);
        let volume_price = volume_price_score(fields);
        let options_overlay = options_overlay_score(fields);

        let trend = combine(
            symbol,
            vec![
                Component::leaf(PRICE_MOMENTUM, 0.5, price_momentum),
                Component::leaf(TREND_STRUCTURE, 0.5, trend_structure),
            ],
            self.policy,
        )?;
        let trend_value = trend.as_ref().map(|c| c.score);

        let raw = combine(
            symbol,
            vec![
                Component::nested(TREND, 0.65, trend),
                Component::leaf(VOLUME_PRICE, 0.15, volume_price),
                Component::leaf(OPTIONS_OVERLAY, 0.20, options_overlay),
            ],
            self.policy,
        )?
        .ok_or_else(|| EngineError::Incomplete(format!("{} has no scorable inputs", symbol)))?;

        let quality = quality_filter(fields);
        let penalty = match (quality, self.policy) {
            (Some(q), _) => q.penalty(),
            (None, MissingScorePolicy::Renormalize) => 0.0,
            (None, MissingScorePolicy::Neutral) => composite::quality_penalty(NEUTRAL_SCORE),
            (None, MissingScorePolicy::Refuse) => {
                return Err(EngineError::Incomplete(format!(
                    "{} is missing sub-score {}",
                    symbol, QUALITY
                )))
            }
        };
        let final_score = (raw.score * (1.0 - penalty)).clamp(0.0, 100.0);

        let mut sub_scores = BTreeMap::new();
        insert_present(&mut sub_scores, PRICE_MOMENTUM, price_momentum);
        insert_present(&mut sub_scores, TREND_STRUCTURE, trend_structure);
        insert_present(&mut sub_scores, TREND, trend_value);
        insert_present(&mut sub_scores, VOLUME_PRICE, volume_price);
        insert_present(&mut sub_scores, OPTIONS_OVERLAY, options_overlay);
        insert_present(&mut sub_scores, QUALITY, quality.map(|q| q.score));
        sub_scores.insert(QUALITY_PENALTY.to_string(), penalty);
        insert_present(&mut sub_scores, POSITIONING, fields.positioning_score);
        insert_present(&mut sub_scores, TERM, fields.term_score);

        debug!(symbol = %symbol, composite = final_score, penalty, "Scored stock");

        Ok(ScoreSnapshot {
            symbol: symbol.to_string(),
            kind: EntityKind::Stock,
            date,
            composite: final_score,
            sub_scores,
            weights: raw.weights,
        })
    }
}

fn insert_present(map: &mut BTreeMap<String, f64>, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        map.insert(key.to_string(), v);
    }
}

// ============================================================================
// Market Regime
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketRegime {
    /// Risk-on
    A,
    /// Neutral
    B,
    /// Risk-off
    C,
}

impl MarketRegime {
    /// Suggested gross exposure as a fraction.
    pub fn exposure(&self) -> f64 {
        match self {
            Self::A => 1.0,
            Self::B => 0.6,
            Self::C => 0.3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        }
    }
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Percent of priced symbols trading above their 50-day average.
pub fn pool_breadth(fields: &[IndicatorFields]) -> Option<f64> {
    let mut priced = 0usize;
    let mut above = 0usize;
    for f in fields {
        if let (Some(price), Some(sma50)) = (f.price, f.sma50) {
            priced += 1;
            if price > sma50 {
                above += 1;
            }
        }
    }
    (priced > 0).then(|| above as f64 / priced as f64 * 100.0)
}

/// Classify the market from the benchmark's trend and pool breadth.
///
/// `None` when the benchmark has no price or 50-day average.
pub fn classify_regime(anchor: &IndicatorFields, breadth: f64) -> Option<MarketRegime> {
    let price = anchor.price?;
    let sma50 = anchor.sma50?;
    let slope = anchor.ma20_slope.unwrap_or(0.0);

    let regime = if price > sma50 && slope > 0.0 && breadth > 50.0 {
        MarketRegime::A
    } else if price < sma50 && slope < 0.0 {
        MarketRegime::C
    } else {
        MarketRegime::B
    };
    Some(regime)
}
