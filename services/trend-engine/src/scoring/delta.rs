//! Period-over-period score deltas.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use std::collections::BTreeMap;

use super::ScoreSnapshot;
use crate::storage::Storage;

fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// The date `n` trading days before `date`, skipping weekends.
///
/// Exchange holidays are not modelled.
pub fn trading_days_before(date: NaiveDate, n: u32) -> NaiveDate {
    let mut current = date;
    let mut remaining = n;
    while remaining > 0 {
        current -= Duration::days(1);
        if is_trading_day(current) {
            remaining -= 1;
        }
    }
    current
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// `current - prior`, or `None` when there is no prior score.
///
/// A present result of `0.0` means "unchanged", never "unknown".
pub fn delta(current: f64, prior: Option<f64>) -> Option<f64> {
    prior.map(|p| round2(current - p))
}

/// Deltas of `snapshot` against its own history at each offset.
pub async fn lookup_deltas(
    storage: &dyn Storage,
    snapshot: &ScoreSnapshot,
    offsets: &[u32],
) -> anyhow::Result<BTreeMap<u32, Option<f64>>> {
    let mut deltas = BTreeMap::new();
    for &n in offsets {
        let prior_date = trading_days_before(snapshot.date, n);
        let prior = storage
            .load_snapshot(&snapshot.symbol, prior_date)
            .await?
            .map(|s| s.composite);
        deltas.insert(n, delta(snapshot.composite, prior));
    }
    Ok(deltas)
}
