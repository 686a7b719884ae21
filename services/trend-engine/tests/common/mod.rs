//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::Notify;

use trend_common::{Config, ProviderId, SourceId};
use trend_engine::completeness::SourceFlags;
use trend_engine::data::{
    DteBucket, IndicatorFields, MarketDataProvider, OiBucket, OpenInterestSnapshot, OptionChain, OptionContract,
    OptionRight, ProviderError, Quote,
};
use trend_engine::{EtfConfig, Holding, MarketDataEngine, PoolSnapshot, ScoreSnapshot, SqliteStorage, Storage};

// ============================================================================
// Mock Provider
// ============================================================================

/// Blocks the first quote request for one symbol until released.
pub struct Gate {
    pub symbol: String,
    pub entered: Notify,
    pub release: Notify,
    armed: Mutex<bool>,
}

impl Gate {
    pub fn new(symbol: &str) -> Arc<Self> {
        Arc::new(Self {
            symbol: symbol.to_string(),
            entered: Notify::new(),
            release: Notify::new(),
            armed: Mutex::new(true),
        })
    }

    fn take(&self, symbol: &str) -> bool {
        let mut armed = self.armed.lock().unwrap();
        if *armed && symbol == self.symbol {
            *armed = false;
            true
        } else {
            false
        }
    }
}

pub struct MockProvider {
    id: ProviderId,
    fail_all: bool,
    panic_all: bool,
    fail_symbols: HashSet<String>,
    gate: Option<Arc<Gate>>,
    quote_calls: AtomicU32,
    chain_calls: AtomicU32,
    oi_calls: AtomicU32,
    seen: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn healthy(id: ProviderId) -> Self {
        Self {
            id,
            fail_all: false,
            panic_all: false,
            fail_symbols: HashSet::new(),
            gate: None,
            quote_calls: AtomicU32::new(0),
            chain_calls: AtomicU32::new(0),
            oi_calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(id: ProviderId) -> Self {
        Self {
            fail_all: true,
            ..Self::healthy(id)
        }
    }

    /// Panics on every quote request.
    pub fn panicking(id: ProviderId) -> Self {
        Self {
            panic_all: true,
            ..Self::healthy(id)
        }
    }

    pub fn failing_for(id: ProviderId, symbols: &[&str]) -> Self {
        Self {
            fail_symbols: symbols.iter().map(|s| s.to_string()).collect(),
            ..Self::healthy(id)
        }
    }

    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn quote_calls(&self) -> u32 {
        self.quote_calls.load(Ordering::Relaxed)
    }

    pub fn total_calls(&self) -> u32 {
        self.quote_calls() + self.chain_calls.load(Ordering::Relaxed) + self.oi_calls.load(Ordering::Relaxed)
    }

    pub fn saw(&self, symbol: &str) -> bool {
        self.seen.lock().unwrap().iter().any(|s| s == symbol)
    }

    fn check(&self, symbol: &str) -> Result<(), ProviderError> {
        self.seen.lock().unwrap().push(symbol.to_string());
        if self.fail_all || self.fail_symbols.contains(symbol) {
            return Err(ProviderError::Connection(format!("{} unreachable", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl MarketDataProvider for MockProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, ProviderError> {
        self.quote_calls.fetch_add(1, Ordering::Relaxed);
        if self.panic_all {
            panic!("{} crashed fetching {}", self.id, symbol);
        }
        if let Some(gate) = &self.gate {
            if gate.take(symbol) {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
        }
        self.check(symbol)?;
        Ok(sample_quote(symbol))
    }

    async fn fetch_option_chain(&self, symbol: &str) -> Result<OptionChain, ProviderError> {
        self.chain_calls.fetch_add(1, Ordering::Relaxed);
        self.check(symbol)?;
        Ok(sample_chain(symbol))
    }

    async fn fetch_open_interest(&self, symbol: &str) -> Result<OpenInterestSnapshot, ProviderError> {
        self.oi_calls.fetch_add(1, Ordering::Relaxed);
        self.check(symbol)?;
        Ok(sample_open_interest(symbol))
    }
}

// ============================================================================
// Sample Payloads
// ============================================================================

pub fn sample_quote(symbol: &str) -> Quote {
    Quote {
        symbol: symbol.to_string(),
        price: 110.0,
        sma20: Some(105.0),
        sma50: Some(100.0),
        sma200: Some(90.0),
        rsi: Some(60.0),
        ma20_slope: Some(0.02),
        rs_5d: Some(1.02),
        rs_20d: Some(1.04),
        rs_63d: Some(1.06),
        return_20d: Some(5.0),
        return_63d: Some(12.0),
        high_52w: Some(112.0),
        max_drawdown_20d: Some(3.0),
        atr_percent: Some(2.5),
        volume_spike: Some(1.3),
        up_down_volume_ratio: Some(1.2),
        as_of: Utc::now(),
    }
}

fn call(dte: u32, iv: f64) -> OptionContract {
    OptionContract {
        expiry: Utc::now().date_naive() + Duration::days(dte as i64),
        days_to_expiry: dte,
        right: OptionRight::Call,
        strike: 110.0,
        implied_vol: Some(iv),
        delta: Some(0.5),
        open_interest: Some(1_000),
    }
}

pub fn sample_chain(symbol: &str) -> OptionChain {
    OptionChain {
        symbol: symbol.to_string(),
        underlying_price: 110.0,
        contracts: vec![call(30, 0.28), call(90, 0.24)],
        iv_rank: Some(60.0),
        relative_volume: Some(1.6),
        as_of: Utc::now(),
    }
}

pub fn sample_open_interest(symbol: &str) -> OpenInterestSnapshot {
    OpenInterestSnapshot {
        symbol: symbol.to_string(),
        buckets: vec![
            OiBucket {
                bucket: DteBucket::Near,
                call_oi: 5_000,
                put_oi: 4_000,
                call_change: 300,
                put_change: 100,
            },
            OiBucket {
                bucket: DteBucket::Mid,
                call_oi: 8_000,
                put_oi: 6_000,
                call_change: 500,
                put_change: 200,
            },
        ],
        lookback_days: 7,
        as_of: Utc::now(),
    }
}

// ============================================================================
// Engine Fixture
// ============================================================================

pub const POOL_STOCKS: [&str; 4] = ["AAPL", "AVGO", "MSFT", "NVDA"];

pub fn etf_configs() -> Vec<EtfConfig> {
    vec![
        EtfConfig::sector("XLK", 3).with_total_holdings(60),
        EtfConfig::industry("SOXX", "XLK", 2).with_total_holdings(30),
    ]
}

/// In-memory storage with XLK and SOXX configured and every pool symbol
/// already imported from the two non-broker sources.
pub async fn seeded_storage() -> Arc<SqliteStorage> {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    for config in etf_configs() {
        storage.upsert_etf_config(&config).await.unwrap();
    }
    storage
        .upsert_holdings(
            "XLK",
            &[
                Holding::new("XLK", "AAPL", 22.0),
                Holding::new("XLK", "MSFT", 20.0),
                Holding::new("XLK", "NVDA", 18.0),
                Holding::new("XLK", "AVGO", 5.0),
            ],
        )
        .await
        .unwrap();
    storage
        .upsert_holdings(
            "SOXX",
            &[
                Holding::new("SOXX", "NVDA", 9.0),
                Holding::new("SOXX", "AVGO", 8.0),
                Holding::new("SOXX", "AMD", 7.0),
            ],
        )
        .await
        .unwrap();

    let now = Utc::now();
    for symbol in POOL_STOCKS.iter().chain(["SPY"].iter()) {
        for source in [SourceId::Finviz, SourceId::MarketOptions] {
            storage.record_source_import(symbol, source, now).await.unwrap();
        }
    }
    storage
}

pub struct Fixture {
    pub engine: MarketDataEngine,
    pub storage: Arc<SqliteStorage>,
    pub primary: Arc<MockProvider>,
    pub secondary: Arc<MockProvider>,
}

/// Engine over seeded storage with the pool synced and both providers
/// registered.
pub async fn fixture(primary: MockProvider, secondary: MockProvider) -> Fixture {
    fixture_with_config(Config::default(), primary, secondary).await
}

pub async fn fixture_with_config(config: Config, primary: MockProvider, secondary: MockProvider) -> Fixture {
    let storage = seeded_storage().await;
    let engine = MarketDataEngine::new(config, storage.clone() as Arc<dyn Storage>);
    let primary = Arc::new(primary);
    let secondary = Arc::new(secondary);
    engine.register_provider(primary.clone()).await;
    engine.register_provider(secondary.clone()).await;
    engine.sync_configured_pool().await.unwrap();
    Fixture {
        engine,
        storage,
        primary,
        secondary,
    }
}

// ============================================================================
// Failing Storage
// ============================================================================

/// Delegates to SQLite, failing selected operations on demand.
pub struct FlakyStorage {
    pub inner: Arc<SqliteStorage>,
    pub fail_snapshot_saves: AtomicBool,
    fail_field_loads: Mutex<HashSet<String>>,
}

impl FlakyStorage {
    pub fn new(inner: Arc<SqliteStorage>) -> Self {
        Self {
            inner,
            fail_snapshot_saves: AtomicBool::new(false),
            fail_field_loads: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_field_loads_for(&self, symbol: &str) {
        self.fail_field_loads.lock().unwrap().insert(symbol.to_string());
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn load_holdings(&self, etf_symbol: &str) -> anyhow::Result<Vec<Holding>> {
        self.inner.load_holdings(etf_symbol).await
    }

    async fn load_etf_config(&self, etf_symbol: &str) -> anyhow::Result<Option<EtfConfig>> {
        self.inner.load_etf_config(etf_symbol).await
    }

    async fn list_etf_configs(&self) -> anyhow::Result<Vec<EtfConfig>> {
        self.inner.list_etf_configs().await
    }

    async fn load_indicator_fields(&self, symbol: &str) -> anyhow::Result<Option<IndicatorFields>> {
        if self.fail_field_loads.lock().unwrap().contains(symbol) {
            anyhow::bail!("fields for {} are unreadable", symbol);
        }
        self.inner.load_indicator_fields(symbol).await
    }

    async fn save_indicator_fields(&self, symbol: &str, fields: &IndicatorFields) -> anyhow::Result<()> {
        self.inner.save_indicator_fields(symbol, fields).await
    }

    async fn load_source_flags(&self, symbol: &str) -> anyhow::Result<SourceFlags> {
        self.inner.load_source_flags(symbol).await
    }

    async fn save_source_flag(&self, symbol: &str, source: SourceId, ok: bool, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.inner.save_source_flag(symbol, source, ok, at).await
    }

    async fn replace_pool(&self, pool: &PoolSnapshot) -> anyhow::Result<()> {
        self.inner.replace_pool(pool).await
    }

    async fn load_snapshot(&self, symbol: &str, date: NaiveDate) -> anyhow::Result<Option<ScoreSnapshot>> {
        self.inner.load_snapshot(symbol, date).await
    }

    async fn save_snapshot(&self, snapshot: &ScoreSnapshot) -> anyhow::Result<bool> {
        if self.fail_snapshot_saves.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.save_snapshot(snapshot).await
    }

    async fn save_snapshots(&self, snapshots: &[ScoreSnapshot]) -> anyhow::Result<bool> {
        if self.fail_snapshot_saves.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.save_snapshots(snapshots).await
    }
}

pub struct FlakyFixture {
    pub engine: MarketDataEngine,
    pub storage: Arc<FlakyStorage>,
    pub primary: Arc<MockProvider>,
}

/// Like `fixture`, with the engine reading through a `FlakyStorage`.
pub async fn flaky_fixture() -> FlakyFixture {
    let storage = Arc::new(FlakyStorage::new(seeded_storage().await));
    let engine = MarketDataEngine::new(Config::default(), storage.clone() as Arc<dyn Storage>);
    let primary = Arc::new(MockProvider::healthy(ProviderId::PrimaryBroker));
    engine.register_provider(primary.clone()).await;
    engine
        .register_provider(Arc::new(MockProvider::healthy(ProviderId::SecondaryBroker)))
        .await;
    engine.sync_configured_pool().await.unwrap();
    FlakyFixture {
        engine,
        storage,
        primary,
    }
}
