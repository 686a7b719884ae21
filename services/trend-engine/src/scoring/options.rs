//! Options-derived indicators: IV term structure and OI positioning.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::data::{DteBucket, OiBucket, OptionChain, OptionContract, OptionRight};

/// Strikes within this fraction of spot count as at-the-money when no
/// contract carries a delta.
const ATM_STRIKE_BAND: f64 = 0.05;

// ============================================================================
// IV Term Structure
// ============================================================================

/// Normalize an IV quote to vol points. Values at or below 1.5 are read as
/// fractions.
pub fn normalize_iv(iv: f64) -> f64 {
    if iv <= 1.5 {
        iv * 100.0
    } else {
        iv
    }
}

/// Interpolate IV at `target_day` between two (dte, iv) points in variance
/// space.
fn variance_interpolation(lower: (u32, f64), upper: (u32, f64), target_day: u32) -> f64 {
    let (d1, iv1) = lower;
    let (d2, iv2) = upper;
    if d1 == d2 {
        return iv1;
    }
    let var1 = (iv1 / 100.0).powi(2);
    let var2 = (iv2 / 100.0).powi(2);
    let weight = (target_day as f64 - d1 as f64) / (d2 as f64 - d1 as f64);
    (var1 + (var2 - var1) * weight).sqrt() * 100.0
}

/// IV at `target_day` from points sorted by DTE.
///
/// Outside the sampled range the nearest point is used as-is.
pub fn interpolate_iv(points: &[(u32, f64)], target_day: u32) -> Option<f64> {
    match points {
        [] => None,
        [(_, iv)] => Some(*iv),
        _ => {
            let mut lower = None;
            let mut upper = None;
            for &(dte, iv) in points {
                if dte == target_day {
                    return Some(iv);
                }
                if dte < target_day {
                    lower = Some((dte, iv));
                } else {
                    upper = Some((dte, iv));
                    break;
                }
            }
            match (lower, upper) {
                (Some(l), Some(u)) => Some(variance_interpolation(l, u, target_day)),
                (Some((_, iv)), None) | (None, Some((_, iv))) => Some(iv),
                (None, None) => None,
            }
        }
    }
}

/// ATM IV for one expiry: the call whose delta is nearest 0.5, else a call
/// struck within 5% of spot.
fn atm_iv(contracts: &[&OptionContract], underlying_price: f64) -> Option<f64> {
    let calls = || {
        contracts
            .iter()
            .filter(|c| c.right == OptionRight::Call)
            .filter_map(|c| c.implied_vol.map(|iv| (*c, iv)))
    };

    let by_delta = calls()
        .filter_map(|(c, iv)| c.delta.map(|d| ((d - 0.5).abs(), iv)))
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, iv)| normalize_iv(iv));
    if by_delta.is_some() {
        return by_delta;
    }

    if underlying_price <= 0.0 {
        return None;
    }
    calls()
        .find(|(c, _)| (c.strike - underlying_price).abs() / underlying_price < ATM_STRIKE_BAND)
        .map(|(_, iv)| normalize_iv(iv))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TermStructure {
    pub iv30: Option<f64>,
    pub iv60: Option<f64>,
    pub iv90: Option<f64>,
    /// iv30 - iv90 in vol points; positive means an inverted curve
    pub slope: Option<f64>,
}

/// Build the 30/60/90-day IV curve from a chain's ATM IVs.
///
/// Returns `None` when no expiry yields an ATM IV.
pub fn term_structure(chain: &OptionChain) -> Option<TermStructure> {
    let mut by_dte: BTreeMap<u32, Vec<&OptionContract>> = BTreeMap::new();
    for contract in &chain.contracts {
        by_dte.entry(contract.days_to_expiry).or_default().push(contract);
    }

    let points: Vec<(u32, f64)> = by_dte
        .iter()
        .filter_map(|(dte, contracts)| atm_iv(contracts, chain.underlying_price).map(|iv| (*dte, iv)))
        .collect();
    if points.is_empty() {
        return None;
    }

    let iv30 = interpolate_iv(&points, 30);
    let iv60 = interpolate_iv(&points, 60);
    let iv90 = interpolate_iv(&points, 90);
    let slope = match (iv30, iv90) {
        (Some(a), Some(b)) => Some(a - b),
        _ => None,
    };

    Some(TermStructure {
        iv30,
        iv60,
        iv90,
        slope,
    })
}

// ============================================================================
// Positioning
// ============================================================================

fn bucket_weight(bucket: DteBucket) -> f64 {
    match bucket {
        DteBucket::Near => 0.25,
        DteBucket::Mid => 0.45,
        DteBucket::Far => 0.30,
    }
}

/// Positioning score in [0, 100] from OI changes over the lookback window.
///
/// 50 is neutral; call OI building faster than put OI pushes it up. `None`
/// when there are no buckets at all.
pub fn positioning_score(buckets: &[OiBucket]) -> Option<f64> {
    if buckets.is_empty() {
        return None;
    }

    let mut net = 0.0;
    let mut gross = 0.0;
    for b in buckets {
        let w = bucket_weight(b.bucket);
        net += w * (b.call_change - b.put_change) as f64;
        gross += w * (b.call_change.unsigned_abs() + b.put_change.unsigned_abs()) as f64;
    }

    if gross == 0.0 {
        return Some(50.0);
    }
    Some((50.0 + 50.0 * net / gross).clamp(0.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn call(dte: u32, strike: f64, iv: f64, delta: Option<f64>) -> OptionContract {
        OptionContract {
            expiry: Utc::now().date_naive() + Duration::days(dte as i64),
            days_to_expiry: dte,
            right: OptionRight::Call,
            strike,
            implied_vol: Some(iv),
            delta,
            open_interest: None,
        }
    }

    #[test]
    fn test_normalize_iv() {
        assert_eq!(normalize_iv(0.25), 25.0);
        assert_eq!(normalize_iv(1.5), 150.0);
        assert_eq!(normalize_iv(32.0), 32.0);
    }

    #[test]
    fn test_interpolate_iv_variance_space() {
        let points = [(20, 20.0), (40, 40.0)];
        let iv = interpolate_iv(&points, 30).unwrap();
        // sqrt((0.04 + 0.16) / 2) * 100
        assert!((iv - 31.6227766).abs() < 1e-6);
    }

    #[test]
    fn test_interpolate_iv_edges() {
        assert_eq!(interpolate_iv(&[], 30), None);
        assert_eq!(interpolate_iv(&[(45, 22.0)], 30), Some(22.0));
        assert_eq!(interpolate_iv(&[(10, 30.0), (20, 28.0)], 90), Some(28.0));
        assert_eq!(interpolate_iv(&[(45, 25.0), (120, 21.0)], 30), Some(25.0));
        assert_eq!(interpolate_iv(&[(30, 26.0), (60, 24.0)], 30), Some(26.0));
    }

    #[test]
    fn test_term_structure_prefers_delta() {
        let chain = OptionChain {
            symbol: "XLK".into(),
            underlying_price: 200.0,
            contracts: vec![
                call(30, 200.0, 0.30, Some(0.52)),
                call(30, 220.0, 0.45, Some(0.20)),
                call(90, 200.0, 0.25, Some(0.49)),
            ],
            ..Default::default()
        };
        let term = term_structure(&chain).unwrap();
        assert_eq!(term.iv30, Some(30.0));
        assert_eq!(term.iv90, Some(25.0));
        assert!((term.slope.unwrap() - 5.0).abs() < 1e-9);
        assert!(term.iv60.unwrap() > 25.0 && term.iv60.unwrap() < 30.0);
    }

    #[test]
    fn test_term_structure_strike_fallback() {
        let chain = OptionChain {
            symbol: "XLE".into(),
            underlying_price: 100.0,
            contracts: vec![call(30, 102.0, 28.0, None), call(30, 130.0, 60.0, None)],
            ..Default::default()
        };
        let term = term_structure(&chain).unwrap();
        assert_eq!(term.iv30, Some(28.0));
    }

    #[test]
    fn test_term_structure_empty_chain() {
        assert!(term_structure(&OptionChain::default()).is_none());
    }

    fn bucket(bucket: DteBucket, call_change: i64, put_change: i64) -> OiBucket {
        OiBucket {
            bucket,
            call_oi: 10_000,
            put_oi: 10_000,
            call_change,
            put_change,
        }
    }

    #[test]
    fn test_positioning_score_direction() {
        assert_eq!(positioning_score(&[]), None);
        assert_eq!(positioning_score(&[bucket(DteBucket::Mid, 0, 0)]), Some(50.0));
        assert_eq!(positioning_score(&[bucket(DteBucket::Near, 500, 0)]), Some(100.0));
        assert_eq!(positioning_score(&[bucket(DteBucket::Far, 0, 500)]), Some(0.0));

        let mixed = positioning_score(&[
            bucket(DteBucket::Near, 100, 300),
            bucket(DteBucket::Mid, 400, 100),
        ])
        .unwrap();
        // net = 0.25*-200 + 0.45*300 = 85; gross = 0.25*400 + 0.45*500 = 325
        assert!((mixed - (50.0 + 50.0 * 85.0 / 325.0)).abs() < 1e-9);
    }
}
