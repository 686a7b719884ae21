//! Sub-score calculators.
//!
//! Each calculator reads an [`IndicatorFields`] record (or a set of them for
//! holdings-level aggregates) and returns a 0..100 score, or `None` when its
//! required inputs are absent.

use serde::{Deserialize, Serialize};

use crate::data::IndicatorFields;

fn clamp_score(x: f64) -> f64 {
    x.clamp(0.0, 100.0)
}

/// Relative-strength ratio to a percent outperformance.
fn rs_percent(ratio: f64) -> f64 {
    (ratio - 1.0) * 100.0
}

// ============================================================================
// ETF Sub-scores
// ============================================================================

/// Raw relative momentum: `0.45·RS20 + 0.35·RS63 + 0.20·RS5`, in percent.
pub fn relmom_raw(fields: &IndicatorFields) -> Option<f64> {
    let rs5 = rs_percent(fields.rs_5d?);
    let rs20 = rs_percent(fields.rs_20d?);
    let rs63 = rs_percent(fields.rs_63d?);
    Some(0.45 * rs20 + 0.35 * rs63 + 0.20 * rs5)
}

/// RelMom mapped onto 0..100 around a neutral 50.
pub fn relmom_score(fields: &IndicatorFields) -> Option<f64> {
    relmom_raw(fields).map(|raw| clamp_score(50.0 + 2.5 * raw))
}

pub fn trend_quality_score(fields: &IndicatorFields) -> Option<f64> {
    let price = fields.price?;
    let sma50 = fields.sma50?;

    let mut score: f64 = 50.0;
    if price > sma50 {
        score += 20.0;
    }
    if fields.sma20.is_some_and(|sma20| sma20 > sma50) {
        score += 15.0;
    }
    match fields.ma20_slope {
        Some(slope) if slope > 0.0 => score += 10.0,
        Some(slope) if slope > -0.01 => score += 5.0,
        _ => {}
    }
    if let Some(dd) = fields.max_drawdown_20d.map(f64::abs) {
        if dd < 5.0 {
            score += 5.0;
        } else if dd > 15.0 {
            score -= 10.0;
        }
    }
    Some(clamp_score(score))
}

/// Share of holdings above their 50- and 200-day averages.
///
/// Holdings without a price are ignored; a holding without a given average
/// counts as not above it.
pub fn breadth_score(holdings: &[IndicatorFields]) -> Option<f64> {
    let priced: Vec<(f64, &IndicatorFields)> = holdings
        .iter()
        .filter_map(|h| h.price.map(|p| (p, h)))
        .collect();
    if priced.is_empty() {
        return None;
    }

    let total = priced.len() as f64;
    let above = |pick: fn(&IndicatorFields) -> Option<f64>| {
        priced
            .iter()
            .filter(|(p, h)| pick(*h).is_some_and(|ma| *p > ma))
            .count() as f64
            / total
            * 100.0
    };
    let pct_50 = above(|h| h.sma50);
    let pct_200 = above(|h| h.sma200);
    Some(0.6 * pct_50 + 0.4 * pct_200)
}

fn heat_from_rel_vol(rel_vol: f64) -> f64 {
    if rel_vol > 2.0 {
        90.0
    } else if rel_vol > 1.5 {
        75.0
    } else if rel_vol > 1.0 {
        50.0
    } else {
        30.0
    }
}

/// Options activity across holdings: `0.6·heat + 0.4·avgIVR`.
pub fn options_confirm_score(holdings: &[IndicatorFields]) -> Option<f64> {
    let with_options: Vec<&IndicatorFields> = holdings
        .iter()
        .filter(|h| h.options_rel_vol.is_some() || h.iv_rank.is_some())
        .collect();
    if with_options.is_empty() {
        return None;
    }

    let n = with_options.len() as f64;
    let avg_rel_vol = with_options
        .iter()
        .map(|h| h.options_rel_vol.unwrap_or(1.0))
        .sum::<f64>()
        / n;
    let avg_ivr = with_options.iter().map(|h| h.iv_rank.unwrap_or(50.0)).sum::<f64>() / n;

    Some(clamp_score(0.6 * heat_from_rel_vol(avg_rel_vol) + 0.4 * avg_ivr))
}

// ============================================================================
// Stock Sub-scores
// ============================================================================

pub fn price_momentum_score(fields: &IndicatorFields) -> Option<f64> {
    if fields.return_20d.is_none() && fields.return_63d.is_none() {
        return None;
    }

    let mut score = 50.0;
    if let Some(r20) = fields.return_20d {
        score += r20.clamp(-20.0, 20.0);
    }
    if let Some(r63) = fields.return_63d {
        score += (r63 * 0.3).clamp(-15.0, 15.0);
    }
    if let (Some(price), Some(high)) = (fields.price, fields.high_52w) {
        if high > 0.0 {
            let near_high = price / high * 100.0;
            if near_high > 95.0 {
                score += 10.0;
            } else if near_high > 90.0 {
                score += 5.0;
            }
        }
    }
    Some(clamp_score(score))
}

pub fn trend_structure_score(fields: &IndicatorFields) -> Option<f64> {
    let price = fields.price?;
    let sma20 = fields.sma20?;

    let mut score = 50.0;
    match fields.sma50 {
        Some(sma50) if price > sma20 && sma20 > sma50 => score += 25.0,
        _ if price > sma20 => score += 10.0,
        _ => {}
    }
    match fields.ma20_slope {
        Some(slope) if slope > 0.05 => score += 15.0,
        Some(slope) if slope > 0.0 => score += 10.0,
        _ => {}
    }
    Some(clamp_score(score))
}

pub fn volume_price_score(fields: &IndicatorFields) -> Option<f64> {
    if fields.volume_spike.is_none() && fields.up_down_volume_ratio.is_none() {
        return None;
    }

    let mut score = 50.0;
    match fields.volume_spike {
        Some(s) if s > 2.0 => score += 25.0,
        Some(s) if s > 1.5 => score += 15.0,
        _ => {}
    }
    match fields.up_down_volume_ratio {
        Some(r) if r > 1.5 => score += 25.0,
        Some(r) if r > 1.0 => score += 15.0,
        _ => {}
    }
    Some(clamp_score(score))
}

pub fn options_overlay_score(fields: &IndicatorFields) -> Option<f64> {
    if fields.options_rel_vol.is_none() && fields.iv_rank.is_none() {
        return None;
    }

    let mut score = match fields.options_rel_vol {
        Some(v) if v > 2.0 => 85.0,
        Some(v) if v > 1.5 => 70.0,
        Some(v) if v > 1.0 => 50.0,
        _ => 30.0,
    };
    match fields.iv_rank {
        Some(ivr) if ivr > 80.0 => score += 10.0,
        Some(ivr) if ivr < 30.0 => score -= 10.0,
        _ => {}
    }
    Some(clamp_score(score))
}

// ============================================================================
// Quality Filter
// ============================================================================

/// How far price has run above its 20-day average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatLevel {
    Moderate,
    SlightlyHot,
    Hot,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    /// 0..100, 100 is clean
    pub score: f64,
    pub heat: HeatLevel,
}

impl QualityAssessment {
    pub fn penalty(&self) -> f64 {
        quality_penalty(self.score)
    }
}

/// Score penalty multiplier: up to 15% at a quality of zero.
pub fn quality_penalty(quality: f64) -> f64 {
    ((100.0 - quality) / 100.0 * 0.15).max(0.0)
}

/// Deduct for drawdown, volatility, and extension above the 20-day average.
///
/// `None` when none of those inputs are available.
pub fn quality_filter(fields: &IndicatorFields) -> Option<QualityAssessment> {
    let distance = match (fields.price, fields.sma20) {
        (Some(p), Some(ma)) if ma > 0.0 => Some((p / ma - 1.0) * 100.0),
        _ => None,
    };
    if fields.max_drawdown_20d.is_none() && fields.atr_percent.is_none() && distance.is_none() {
        return None;
    }

    let mut score = 100.0;
    match fields.max_drawdown_20d.map(f64::abs) {
        Some(dd) if dd > 15.0 => score -= 30.0,
        Some(dd) if dd > 10.0 => score -= 15.0,
        Some(dd) if dd > 5.0 => score -= 5.0,
        _ => {}
    }
    match fields.atr_percent {
        Some(atr) if atr > 6.0 => score -= 20.0,
        Some(atr) if atr > 4.0 => score -= 10.0,
        _ => {}
    }
    let heat = match distance {
        Some(d) if d > 15.0 => {
            score -= 20.0;
            HeatLevel::Hot
        }
        Some(d) if d > 10.0 => {
            score -= 10.0;
            HeatLevel::SlightlyHot
        }
        _ => HeatLevel::Moderate,
    };

    Some(QualityAssessment {
        score: f64::max(score, 0.0),
        heat,
    })
}
