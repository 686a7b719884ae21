//! Engine facade.
//!
//! `MarketDataEngine` wires the pool builder, router, completeness tracker,
//! batch orchestrator and scoring engine around one storage backend.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use crate::completeness::{CompletenessReport, CompletenessTracker};
use crate::data::{DataSourceRouter, IndicatorFields, MarketDataProvider, RouterConfig};
use crate::error::{EngineError, Result};
use crate::etf::{EtfConfig, Holding};
use crate::pool::{PoolSnapshot, SharedPool, SymbolPoolBuilder};
use crate::scoring::delta::lookup_deltas;
use crate::scoring::{classify_regime, pool_breadth, MarketRegime, ScoreSnapshot, ScoringEngine};
use crate::session::{BatchOrchestrator, SessionStatus, UpdateScope, UpdateSession};
use crate::storage::Storage;
use trend_common::{Config, MissingScorePolicy};

/// What `compute_scores` covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "symbol")]
pub enum ScoreScope {
    /// Every synced ETF and its selected holdings
    All,
    /// One ETF and its selected holdings
    Etf(String),
}

impl ScoreScope {
    pub fn etf(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Etf(symbol) => Some(symbol),
        }
    }
}

/// A persisted snapshot with its deltas against prior trading days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntity {
    pub snapshot: ScoreSnapshot,
    /// Keyed by trading-day offset; `None` when no prior snapshot exists
    pub deltas: BTreeMap<u32, Option<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeAssessment {
    pub regime: MarketRegime,
    pub exposure: f64,
    /// Percent of pool symbols above their 50-day average
    pub breadth: f64,
}

pub struct MarketDataEngine {
    config: Config,
    storage: Arc<dyn Storage>,
    router: Arc<DataSourceRouter>,
    tracker: Arc<CompletenessTracker>,
    pool: SharedPool,
    pool_builder: SymbolPoolBuilder,
    orchestrator: BatchOrchestrator,
    scoring: ScoringEngine,
}

impl MarketDataEngine {
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Self {
        let router = DataSourceRouter::new(
            RouterConfig::from_sources(&config.data_sources),
            &config.providers,
        );
        Self::with_router(config, storage, router)
    }

    /// Build around a pre-configured router (custom limiters or routes).
    pub fn with_router(config: Config, storage: Arc<dyn Storage>, router: DataSourceRouter) -> Self {
        let router = Arc::new(router);
        let tracker = Arc::new(CompletenessTracker::new(config.completeness.clone()));
        let pool = SharedPool::default();
        let pool_builder = SymbolPoolBuilder::new(storage.clone(), config.completeness.anchors.clone());
        let orchestrator = BatchOrchestrator::new(
            router.clone(),
            tracker.clone(),
            storage.clone(),
            pool.clone(),
            config.update.clone(),
        );
        let scoring = ScoringEngine::new(config.scoring.missing_policy);

        Self {
            config,
            storage,
            router,
            tracker,
            pool,
            pool_builder,
            orchestrator,
            scoring,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Arc<DataSourceRouter> {
        &self.router
    }

    pub fn tracker(&self) -> &Arc<CompletenessTracker> {
        &self.tracker
    }

    pub async fn register_provider(&self, provider: Arc<dyn MarketDataProvider>) {
        self.router.register(provider).await;
    }

    /// The last synced pool, if any.
    pub fn pool(&self) -> Option<Arc<PoolSnapshot>> {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ========================================================================
    // Pool
    // ========================================================================

    /// Rebuild the symbol pool, persist it, and seed completeness tracking.
    pub async fn sync_pool(&self, configs: &[EtfConfig]) -> Result<Arc<PoolSnapshot>> {
        let snapshot = Arc::new(self.pool_builder.sync(configs).await?);
        self.storage.replace_pool(&snapshot).await?;
        self.tracker.load_pool(&snapshot);
        *self.pool.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// `sync_pool` over every ETF config in storage.
    pub async fn sync_configured_pool(&self) -> Result<Arc<PoolSnapshot>> {
        let configs = self.storage.list_etf_configs().await?;
        self.sync_pool(&configs).await
    }

    // ========================================================================
    // Batch Updates
    // ========================================================================

    pub async fn start_batch_update(&self, scope: UpdateScope) -> Result<String> {
        self.orchestrator.start(scope).await
    }

    pub fn get_session_status(&self, session_id: &str) -> Result<UpdateSession> {
        self.orchestrator.status(session_id)
    }

    pub fn cancel_session(&self, session_id: &str) -> Result<SessionStatus> {
        self.orchestrator.cancel(session_id)
    }

    pub async fn wait_for_session(&self, session_id: &str) -> Result<UpdateSession> {
        self.orchestrator.wait(session_id).await
    }

    pub fn get_completeness(&self, etf: Option<&str>) -> CompletenessReport {
        self.tracker.report(etf)
    }

    // ========================================================================
    // Scoring
    // ========================================================================

    /// Score the scope for today.
    pub async fn compute_scores(&self, scope: ScoreScope) -> Result<Vec<ScoredEntity>> {
        self.compute_scores_as_of(scope, Utc::now().date_naive()).await
    }

    /// Score the scope for `date`, persist the snapshots, and attach deltas.
    ///
    /// Refuses with `NotReady` when the completeness gate is unmet and with
    /// `Conflict` when any entity already has a snapshot for `date`. Nothing
    /// is written in either case.
    pub async fn compute_scores_as_of(&self, scope: ScoreScope, date: NaiveDate) -> Result<Vec<ScoredEntity>> {
        self.tracker.gate(scope.etf())?;

        let pool = self
            .pool()
            .ok_or_else(|| EngineError::Validation("symbol pool has not been synced".into()))?;
        let selections: Vec<_> = match scope.etf() {
            Some(etf) => vec![pool
                .selection(etf)
                .ok_or_else(|| EngineError::Validation(format!("ETF {} is not in the pool", etf)))?],
            None => pool.etfs.iter().collect(),
        };

        let mut snapshots = Vec::new();
        let mut stocks: BTreeSet<String> = BTreeSet::new();
        let mut cache: HashMap<String, IndicatorFields> = HashMap::new();

        for selection in &selections {
            let holdings: HashMap<String, Holding> = self
                .storage
                .load_holdings(&selection.etf)
                .await?
                .into_iter()
                .map(|h| (h.ticker.clone(), h))
                .collect();

            let etf_fields = self.fields_for(&selection.etf, None, &mut cache).await?;
            let mut holding_fields = Vec::with_capacity(selection.selected.len());
            for ticker in &selection.selected {
                holding_fields.push(self.fields_for(ticker, holdings.get(ticker), &mut cache).await?);
                stocks.insert(ticker.clone());
            }

            snapshots.push(self.scoring.score_etf(&selection.etf, &etf_fields, &holding_fields, date)?);
        }

        let mut skipped = 0usize;
        for ticker in &stocks {
            let fields = self.fields_for(ticker, None, &mut cache).await?;
            match self.scoring.score_stock(ticker, &fields, date) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(EngineError::Incomplete(reason))
                    if self.scoring.policy() != MissingScorePolicy::Refuse =>
                {
                    warn!(symbol = %ticker, reason = %reason, "Stock has no scorable inputs, skipped");
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        for snapshot in &snapshots {
            if self.storage.load_snapshot(&snapshot.symbol, date).await?.is_some() {
                return Err(EngineError::Conflict(format!(
                    "score snapshot for {} on {} already exists",
                    snapshot.symbol, date
                )));
            }
        }

        // Deltas only read earlier dates, so they are resolved before the write
        let mut deltas = Vec::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            deltas.push(lookup_deltas(self.storage.as_ref(), snapshot, &self.config.scoring.delta_offsets).await?);
        }

        if !self.storage.save_snapshots(&snapshots).await? {
            return Err(EngineError::Conflict(format!(
                "score snapshots for {} were written concurrently",
                date
            )));
        }

        let scored: Vec<ScoredEntity> = snapshots
            .into_iter()
            .zip(deltas)
            .map(|(snapshot, deltas)| ScoredEntity { snapshot, deltas })
            .collect();

        info!(
            scope = ?scope,
            date = %date,
            etfs = selections.len(),
            scored = scored.len(),
            skipped,
            "Scores computed"
        );

        Ok(scored)
    }

    /// Stored fields for `symbol`, seeded from the holding when none exist.
    async fn fields_for(
        &self,
        symbol: &str,
        holding: Option<&Holding>,
        cache: &mut HashMap<String, IndicatorFields>,
    ) -> Result<IndicatorFields> {
        if let Some(fields) = cache.get(symbol) {
            return Ok(fields.clone());
        }
        let fields = match self.storage.load_indicator_fields(symbol).await? {
            Some(fields) => fields,
            None => holding.map(IndicatorFields::from_holding).unwrap_or_default(),
        };
        cache.insert(symbol.to_string(), fields.clone());
        Ok(fields)
    }

    /// Classify the market from the first anchor and pool breadth.
    ///
    /// `None` when the pool is unsynced or the anchor lacks price data.
    pub async fn market_regime(&self) -> Result<Option<RegimeAssessment>> {
        let Some(anchor) = self.config.completeness.anchors.first() else {
            return Ok(None);
        };
        let Some(pool) = self.pool() else {
            return Ok(None);
        };
        let Some(anchor_fields) = self.storage.load_indicator_fields(anchor).await? else {
            return Ok(None);
        };

        let mut fields = Vec::new();
        for entry in pool.entries.values().filter(|e| !e.is_anchor) {
            if let Some(f) = self.storage.load_indicator_fields(&entry.ticker).await? {
                fields.push(f);
            }
        }
        let breadth = pool_breadth(&fields).unwrap_or(0.0);

        Ok(classify_regime(&anchor_fields, breadth).map(|regime| RegimeAssessment {
            regime,
            exposure: regime.exposure(),
            breadth,
        }))
    }
}
