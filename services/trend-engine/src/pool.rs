//! Symbol pool builder.
//!
//! Merges the representative holdings of every tracked ETF into one
//! deduplicated ticker set. A ticker held by several ETFs appears once,
//! carrying every owning ETF and the largest weight seen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::completeness::SourceFlags;
use crate::error::{EngineError, Result};
use crate::etf::{validate_holdings, CoverageRule, EtfConfig, EtfLevel, Holding};
use crate::storage::Storage;

/// Rough per-symbol fetch cost used for update estimates.
pub const SECONDS_PER_SYMBOL: u64 = 2;

// ============================================================================
// Snapshot Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtfMembership {
    pub etf: String,
    pub weight: f64,
}

/// One deduplicated ticker in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub ticker: String,
    pub memberships: Vec<EtfMembership>,
    /// Largest weight across owning ETFs
    pub max_weight: f64,
    /// Best (lowest, 1-based) weight rank across owning ETFs
    pub best_rank: Option<usize>,
    /// Benchmark symbol added regardless of holdings
    pub is_anchor: bool,
    /// Sources that already had valid data at sync time
    pub sources: SourceFlags,
}

impl PoolEntry {
    fn new(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            memberships: Vec::new(),
            max_weight: 0.0,
            best_rank: None,
            is_anchor: false,
            sources: SourceFlags::default(),
        }
    }

    pub fn etfs(&self) -> impl Iterator<Item = &str> {
        self.memberships.iter().map(|m| m.etf.as_str())
    }
}

/// Selection result for one ETF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtfSelection {
    pub etf: String,
    pub level: EtfLevel,
    pub total_holdings: usize,
    /// Selected tickers in descending weight order
    pub selected: Vec<String>,
    pub selected_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub entries: BTreeMap<String, PoolEntry>,
    pub etfs: Vec<EtfSelection>,
    pub built_at: DateTime<Utc>,
}

impl PoolSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tickers in a stable (alphabetical) order.
    pub fn tickers(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn entry(&self, ticker: &str) -> Option<&PoolEntry> {
        self.entries.get(ticker)
    }

    pub fn selection(&self, etf: &str) -> Option<&EtfSelection> {
        self.etfs.iter().find(|s| s.etf == etf)
    }

    pub fn anchors(&self) -> impl Iterator<Item = &PoolEntry> {
        self.entries.values().filter(|e| e.is_anchor)
    }

    pub fn estimated_update_seconds(&self) -> u64 {
        self.entries.len() as u64 * SECONDS_PER_SYMBOL
    }
}

/// The most recently synced pool, shared between the engine and sessions.
pub type SharedPool = Arc<RwLock<Option<Arc<PoolSnapshot>>>>;

// ============================================================================
// Selection
// ============================================================================

/// Holdings sorted by descending weight, ties broken by ticker.
fn sorted_by_weight(holdings: &[Holding]) -> Vec<&Holding> {
    let mut sorted: Vec<&Holding> = holdings.iter().collect();
    sorted.sort_by(|a, b| {
        b.weight
            .total_cmp(&a.weight)
            .then_with(|| a.ticker.cmp(&b.ticker))
    });
    sorted
}

/// Apply a coverage rule to one ETF's holdings.
///
/// Weight-threshold selection includes the holding that crosses the
/// threshold.
pub fn select_holdings(holdings: &[Holding], rule: CoverageRule) -> Vec<&Holding> {
    let sorted = sorted_by_weight(holdings);
    match rule {
        CoverageRule::TopN(n) => sorted.into_iter().take(n).collect(),
        CoverageRule::WeightThreshold(threshold) => {
            let mut selected = Vec::new();
            let mut cumulative = 0.0;
            for h in sorted {
                selected.push(h);
                cumulative += h.weight;
                if cumulative >= threshold {
                    break;
                }
            }
            selected
        }
    }
}

/// Cumulative weight (%) of the top `n` holdings.
pub fn weight_coverage(holdings: &[Holding], n: usize) -> f64 {
    sorted_by_weight(holdings)
        .into_iter()
        .take(n)
        .map(|h| h.weight)
        .sum::<f64>()
        .min(100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopNAnalysis {
    pub holdings_count: usize,
    pub total_weight: f64,
    /// (N, cumulative weight %) pairs in the requested order
    pub coverage: Vec<(usize, f64)>,
}

/// Weight coverage for several candidate N values.
pub fn analyze_top_n(holdings: &[Holding], ns: &[usize]) -> TopNAnalysis {
    TopNAnalysis {
        holdings_count: holdings.len(),
        total_weight: holdings.iter().map(|h| h.weight).sum(),
        coverage: ns.iter().map(|n| (*n, weight_coverage(holdings, *n))).collect(),
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct SymbolPoolBuilder {
    storage: Arc<dyn Storage>,
    anchors: Vec<String>,
}

impl SymbolPoolBuilder {
    pub fn new(storage: Arc<dyn Storage>, anchors: Vec<String>) -> Self {
        Self { storage, anchors }
    }

    /// Build a pool snapshot from the given ETF configs.
    ///
    /// Reads holdings and existing source flags from storage; persists
    /// nothing.
    pub async fn sync(&self, configs: &[EtfConfig]) -> Result<PoolSnapshot> {
        if configs.is_empty() {
            return Err(EngineError::Validation("no ETF configs to build a pool from".into()));
        }

        let mut seen = HashSet::new();
        let mut entries: BTreeMap<String, PoolEntry> = BTreeMap::new();
        let mut etfs = Vec::with_capacity(configs.len());

        for config in configs {
            config.validate()?;
            if !seen.insert(config.symbol.as_str()) {
                return Err(EngineError::Validation(format!(
                    "ETF {} configured twice",
                    config.symbol
                )));
            }

            let holdings = self.storage.load_holdings(&config.symbol).await?;
            validate_holdings(&config.symbol, &holdings)?;

            let selected = select_holdings(&holdings, config.coverage);
            let selected_weight = selected.iter().map(|h| h.weight).sum();

            for (idx, holding) in selected.iter().enumerate() {
                let rank = idx + 1;
                let entry = entries
                    .entry(holding.ticker.clone())
                    .or_insert_with(|| PoolEntry::new(&holding.ticker));
                entry.memberships.push(EtfMembership {
                    etf: config.symbol.clone(),
                    weight: holding.weight,
                });
                entry.max_weight = entry.max_weight.max(holding.weight);
                entry.best_rank = Some(entry.best_rank.map_or(rank, |r| r.min(rank)));
            }

            debug!(
                etf = %config.symbol,
                holdings = holdings.len(),
                selected = selected.len(),
                selected_weight,
                "Selected ETF holdings"
            );

            etfs.push(EtfSelection {
                etf: config.symbol.clone(),
                level: config.level,
                total_holdings: config.total_holdings.max(holdings.len()),
                selected: selected.iter().map(|h| h.ticker.clone()).collect(),
                selected_weight,
            });
        }

        for anchor in &self.anchors {
            entries
                .entry(anchor.clone())
                .or_insert_with(|| PoolEntry::new(anchor))
                .is_anchor = true;
        }

        for entry in entries.values_mut() {
            entry.sources = self.storage.load_source_flags(&entry.ticker).await?;
        }

        let snapshot = PoolSnapshot {
            entries,
            etfs,
            built_at: Utc::now(),
        };

        info!(
            etfs = snapshot.etfs.len(),
            symbols = snapshot.len(),
            estimated_seconds = snapshot.estimated_update_seconds(),
            "Symbol pool synced"
        );

        Ok(snapshot)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use proptest::prelude::*;
    use trend_common::SourceId;

    fn holdings(etf: &str, weights: &[(&str, f64)]) -> Vec<Holding> {
        weights.iter().map(|(t, w)| Holding::new(etf, t, *w)).collect()
    }

    #[test]
    fn test_top_n_selection_order() {
        let h = holdings("XLK", &[("MSFT", 20.0), ("AAPL", 22.0), ("NVDA", 20.0), ("AVGO", 5.0)]);
        let picked: Vec<_> = select_holdings(&h, CoverageRule::TopN(3))
            .iter()
            .map(|h| h.ticker.as_str())
            .collect();
        assert_eq!(picked, vec!["AAPL", "MSFT", "NVDA"]);
    }

    #[test]
    fn test_weight_threshold_includes_crossing_holding() {
        let h = holdings("XLF", &[("JPM", 10.0), ("BRK.B", 12.0), ("V", 8.0), ("MA", 7.0)]);
        let picked: Vec<_> = select_holdings(&h, CoverageRule::WeightThreshold(25.0))
            .iter()
            .map(|h| h.ticker.as_str())
            .collect();
        assert_eq!(picked, vec!["BRK.B", "JPM", "V"]);
    }

    #[test]
    fn test_weight_threshold_exact_hit_stops() {
        let h = holdings("XLE", &[("XOM", 20.0), ("CVX", 15.0), ("COP", 5.0)]);
        let picked = select_holdings(&h, CoverageRule::WeightThreshold(35.0));
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_analyze_top_n() {
        let h = holdings("XLV", &[("LLY", 12.0), ("UNH", 8.0), ("JNJ", 6.0)]);
        let analysis = analyze_top_n(&h, &[1, 2, 10]);
        assert_eq!(analysis.holdings_count, 3);
        assert_eq!(analysis.coverage, vec![(1, 12.0), (2, 20.0), (10, 26.0)]);
    }

    fn weights_strategy() -> impl Strategy<Value = Vec<f64>> {
        proptest::collection::vec(0.0f64..50.0, 1..60).prop_map(|raw| {
            let total: f64 = raw.iter().sum();
            if total > 100.0 {
                raw.iter().map(|w| w * 100.0 / total).collect()
            } else {
                raw
            }
        })
    }

    proptest! {
        #[test]
        fn prop_top_n_coverage_monotonic_and_bounded(weights in weights_strategy()) {
            let h: Vec<Holding> = weights
                .iter()
                .enumerate()
                .map(|(i, w)| Holding::new("ETF", &format!("T{i}"), *w))
                .collect();

            let mut previous = 0.0;
            for n in 0..=h.len() + 1 {
                let coverage = weight_coverage(&h, n);
                prop_assert!(coverage >= previous);
                prop_assert!(coverage <= 100.0);
                previous = coverage;
            }
        }
    }

    async fn seeded_storage() -> Arc<SqliteStorage> {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        storage
            .upsert_holdings(
                "XLK",
                &holdings("XLK", &[("AAPL", 22.0), ("MSFT", 20.0), ("NVDA", 18.0), ("CRM", 3.0)]),
            )
            .await
            .unwrap();
        storage
            .upsert_holdings(
                "SOXX",
                &holdings("SOXX", &[("NVDA", 9.0), ("AVGO", 8.5), ("AMD", 7.0)]),
            )
            .await
            .unwrap();
        storage
            .record_source_import("AAPL", SourceId::Finviz, Utc::now())
            .await
            .unwrap();
        storage
    }

    #[tokio::test]
    async fn test_sync_deduplicates_and_keeps_max_weight() {
        let storage = seeded_storage().await;
        let builder = SymbolPoolBuilder::new(storage, vec!["SPY".into()]);
        let configs = vec![
            EtfConfig::sector("XLK", 3).with_total_holdings(65),
            EtfConfig::industry("SOXX", "XLK", 2).with_total_holdings(30),
        ];

        let pool = builder.sync(&configs).await.unwrap();

        assert_eq!(pool.tickers(), vec!["AAPL", "AVGO", "MSFT", "NVDA", "SPY"]);
        let nvda = pool.entry("NVDA").unwrap();
        assert_eq!(nvda.etfs().collect::<Vec<_>>(), vec!["XLK", "SOXX"]);
        assert_eq!(nvda.max_weight, 18.0);
        assert_eq!(nvda.best_rank, Some(1));

        assert!(pool.entry("SPY").unwrap().is_anchor);
        assert!(pool.entry("AAPL").unwrap().sources.is_valid(SourceId::Finviz));
        assert_eq!(pool.selection("XLK").unwrap().total_holdings, 65);
        assert_eq!(pool.estimated_update_seconds(), 10);
    }

    #[tokio::test]
    async fn test_sync_rejects_etf_without_holdings() {
        let storage = seeded_storage().await;
        let builder = SymbolPoolBuilder::new(storage, vec![]);
        let err = builder
            .sync(&[EtfConfig::sector("XLU", 10)])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref m) if m.contains("XLU")));
    }

    #[tokio::test]
    async fn test_sync_rejects_duplicate_and_empty_configs() {
        let storage = seeded_storage().await;
        let builder = SymbolPoolBuilder::new(storage, vec![]);
        assert!(builder.sync(&[]).await.is_err());

        let dup = vec![EtfConfig::sector("XLK", 2), EtfConfig::sector("XLK", 3)];
        assert!(matches!(builder.sync(&dup).await, Err(EngineError::Validation(_))));
    }
}
