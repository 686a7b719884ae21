//! Completeness tracking and the compute-readiness gate.
//!
//! Every symbol carries one flag per data source. A symbol's coverage is the
//! share of its four sources holding valid data; ETF and overall figures
//! are averages of that. Scoring is allowed only once the market anchors are
//! fully covered and overall completeness reaches the configured threshold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::debug;

use trend_common::config::CompletenessConfig;
use trend_common::SourceId;

use crate::error::{EngineError, Result};
use crate::pool::PoolSnapshot;

// ============================================================================
// Source Flags
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceMark {
    pub ok: bool,
    pub at: DateTime<Utc>,
}

/// Per-source validity flags for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceFlags {
    marks: [Option<SourceMark>; SourceId::COUNT],
}

impl SourceFlags {
    pub fn set(&mut self, source: SourceId, ok: bool, at: DateTime<Utc>) {
        self.marks[source.index()] = Some(SourceMark { ok, at });
    }

    pub fn get(&self, source: SourceId) -> Option<SourceMark> {
        self.marks[source.index()]
    }

    pub fn is_valid(&self, source: SourceId) -> bool {
        self.get(source).is_some_and(|m| m.ok)
    }

    pub fn valid_count(&self) -> usize {
        self.marks.iter().flatten().filter(|m| m.ok).count()
    }

    /// Percent of sources with valid data, in [0, 100].
    pub fn coverage(&self) -> f64 {
        self.valid_count() as f64 / SourceId::COUNT as f64 * 100.0
    }
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    Ready,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceStatus {
    pub source: SourceId,
    /// Percent of in-scope symbols with valid data from this source
    pub coverage: f64,
    pub last_update: Option<DateTime<Utc>>,
    pub health: SourceHealth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletenessReport {
    pub per_source: Vec<DataSourceStatus>,
    pub aggregate: f64,
    pub can_compute: bool,
}

// ============================================================================
// Tracker
// ============================================================================

#[derive(Debug, Default)]
struct EtfScope {
    total_holdings: usize,
    required: Vec<String>,
}

#[derive(Debug, Default)]
struct TrackerState {
    symbols: HashMap<String, SourceFlags>,
    etfs: BTreeMap<String, EtfScope>,
}

pub struct CompletenessTracker {
    state: RwLock<TrackerState>,
    config: CompletenessConfig,
}

impl CompletenessTracker {
    pub fn new(config: CompletenessConfig) -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            config,
        }
    }

    pub fn config(&self) -> &CompletenessConfig {
        &self.config
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace tracked symbols and ETF scopes with those of a pool.
    pub fn load_pool(&self, pool: &PoolSnapshot) {
        let mut state = self.write();
        state.symbols = pool
            .entries
            .values()
            .map(|e| (e.ticker.clone(), e.sources.clone()))
            .collect();
        state.etfs = pool
            .etfs
            .iter()
            .map(|s| {
                (
                    s.etf.clone(),
                    EtfScope {
                        total_holdings: s.total_holdings,
                        required: s.selected.clone(),
                    },
                )
            })
            .collect();
        debug!(symbols = state.symbols.len(), etfs = state.etfs.len(), "Completeness tracker loaded pool");
    }

    pub fn mark_source(&self, symbol: &str, source: SourceId, ok: bool) {
        self.mark_source_at(symbol, source, ok, Utc::now());
    }

    pub fn mark_source_at(&self, symbol: &str, source: SourceId, ok: bool, at: DateTime<Utc>) {
        let mut state = self.write();
        state
            .symbols
            .entry(symbol.to_string())
            .or_default()
            .set(source, ok, at);
    }

    pub fn flags(&self, symbol: &str) -> Option<SourceFlags> {
        self.read().symbols.get(symbol).cloned()
    }

    /// Coverage percent of one symbol; untracked symbols are 0.
    pub fn coverage(&self, symbol: &str) -> f64 {
        self.read()
            .symbols
            .get(symbol)
            .map_or(0.0, SourceFlags::coverage)
    }

    pub fn etf_coverage(&self, etf: &str) -> f64 {
        let state = self.read();
        Self::etf_coverage_locked(&state, etf)
    }

    fn etf_coverage_locked(state: &TrackerState, etf: &str) -> f64 {
        match state.etfs.get(etf) {
            Some(scope) if !scope.required.is_empty() => {
                let total: f64 = scope
                    .required
                    .iter()
                    .map(|t| state.symbols.get(t).map_or(0.0, SourceFlags::coverage))
                    .sum();
                total / scope.required.len() as f64
            }
            _ => 0.0,
        }
    }

    /// ETF coverages averaged with each ETF's total-holdings count as weight.
    pub fn overall_completeness(&self) -> f64 {
        let state = self.read();
        let mut weighted = 0.0;
        let mut weights = 0usize;
        for (etf, scope) in &state.etfs {
            weighted += Self::etf_coverage_locked(&state, etf) * scope.total_holdings as f64;
            weights += scope.total_holdings;
        }
        if weights == 0 {
            0.0
        } else {
            weighted / weights as f64
        }
    }

    /// Anchors that are not yet at 100%.
    pub fn incomplete_anchors(&self) -> Vec<String> {
        let state = self.read();
        self.config
            .anchors
            .iter()
            .filter(|a| {
                state
                    .symbols
                    .get(a.as_str())
                    .map_or(true, |f| f.valid_count() < SourceId::COUNT)
            })
            .cloned()
            .collect()
    }

    pub fn can_compute(&self) -> bool {
        self.gate(None).is_ok()
    }

    pub fn can_compute_etf(&self, etf: &str) -> bool {
        self.gate(Some(etf)).is_ok()
    }

    /// Check the scoring gate for an ETF, or for everything when `None`.
    pub fn gate(&self, etf: Option<&str>) -> Result<()> {
        let threshold = self.config.ready_threshold;
        let aggregate = match etf {
            Some(etf) => self.etf_coverage(etf),
            None => self.overall_completeness(),
        };

        let missing = self.incomplete_anchors();
        if !missing.is_empty() {
            return Err(EngineError::NotReady {
                reason: format!("anchor(s) {} not fully covered", missing.join(", ")),
                aggregate,
                threshold,
            });
        }
        if aggregate < threshold {
            let scope = etf.map_or_else(|| "overall".to_string(), |e| format!("ETF {}", e));
            return Err(EngineError::NotReady {
                reason: format!("{} completeness below threshold", scope),
                aggregate,
                threshold,
            });
        }
        Ok(())
    }

    fn health(&self, coverage: f64) -> SourceHealth {
        if coverage >= self.config.ready_threshold {
            SourceHealth::Ready
        } else if coverage >= self.config.warning_threshold {
            SourceHealth::Warning
        } else {
            SourceHealth::Error
        }
    }

    /// Per-source coverage plus the aggregate and gate for a scope.
    pub fn report(&self, etf: Option<&str>) -> CompletenessReport {
        let per_source = {
            let state = self.read();
            let symbols: Vec<&SourceFlags> = match etf {
                Some(etf) => state
                    .etfs
                    .get(etf)
                    .map(|scope| {
                        scope
                            .required
                            .iter()
                            .filter_map(|t| state.symbols.get(t))
                            .collect()
                    })
                    .unwrap_or_default(),
                None => state.symbols.values().collect(),
            };
            let denominator = match etf {
                Some(etf) => state.etfs.get(etf).map_or(0, |s| s.required.len()),
                None => symbols.len(),
            };

            SourceId::ALL
                .iter()
                .map(|source| {
                    let valid = symbols.iter().filter(|f| f.is_valid(*source)).count();
                    let coverage = if denominator == 0 {
                        0.0
                    } else {
                        valid as f64 / denominator as f64 * 100.0
                    };
                    let last_update = symbols
                        .iter()
                        .filter_map(|f| f.get(*source))
                        .filter(|m| m.ok)
                        .map(|m| m.at)
                        .max();
                    DataSourceStatus {
                        source: *source,
                        coverage,
                        last_update,
                        health: self.health(coverage),
                    }
                })
                .collect()
        };

        let aggregate = match etf {
            Some(etf) => self.etf_coverage(etf),
            None => self.overall_completeness(),
        };

        CompletenessReport {
            per_source,
            aggregate,
            can_compute: self.gate(etf).is_ok(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
