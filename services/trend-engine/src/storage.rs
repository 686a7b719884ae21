//! Storage collaborator.
//!
//! `Storage` is the contract the engine reads holdings and configs from and
//! writes indicator fields and score snapshots to. `SqliteStorage` is the
//! bundled implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use trend_common::SourceId;

use crate::completeness::SourceFlags;
use crate::data::IndicatorFields;
use crate::etf::{CoverageRule, EtfConfig, EtfLevel, EtfStatus, Holding, UpdateFrequency};
use crate::pool::PoolSnapshot;
use crate::scoring::{EntityKind, ScoreSnapshot};

// ============================================================================
// Storage Trait
// ============================================================================

#[async_trait]
pub trait Storage: Send + Sync {
    async fn load_holdings(&self, etf_symbol: &str) -> Result<Vec<Holding>>;

    async fn load_etf_config(&self, etf_symbol: &str) -> Result<Option<EtfConfig>>;

    async fn list_etf_configs(&self) -> Result<Vec<EtfConfig>>;

    async fn load_indicator_fields(&self, symbol: &str) -> Result<Option<IndicatorFields>>;

    async fn save_indicator_fields(&self, symbol: &str, fields: &IndicatorFields) -> Result<()>;

    async fn load_source_flags(&self, symbol: &str) -> Result<SourceFlags>;

    async fn save_source_flag(&self, symbol: &str, source: SourceId, ok: bool, at: DateTime<Utc>) -> Result<()>;

    /// Replace the persisted pool membership with `pool`.
    async fn replace_pool(&self, pool: &PoolSnapshot) -> Result<()>;

    async fn load_snapshot(&self, symbol: &str, date: NaiveDate) -> Result<Option<ScoreSnapshot>>;

    /// Persist a new snapshot. Returns `false` if one already exists for
    /// the same symbol and date; existing snapshots are never overwritten.
    async fn save_snapshot(&self, snapshot: &ScoreSnapshot) -> Result<bool>;

    /// Persist a batch of snapshots all-or-nothing. Returns `false`, with
    /// nothing written, if any of them already exists.
    async fn save_snapshots(&self, snapshots: &[ScoreSnapshot]) -> Result<bool>;
}

// ============================================================================
// SQLite Schema
// ============================================================================

const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS etf_configs (
    symbol TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    level TEXT NOT NULL,
    parent_sector TEXT,
    coverage_kind TEXT NOT NULL,
    coverage_value REAL NOT NULL,
    frequency TEXT NOT NULL,
    total_holdings INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS etf_holdings (
    etf_symbol TEXT NOT NULL,
    ticker TEXT NOT NULL,
    weight REAL NOT NULL,
    sma50 REAL,
    sma200 REAL,
    rsi REAL,
    positioning_score REAL,
    term_score REAL,
    PRIMARY KEY (etf_symbol, ticker)
);

CREATE TABLE IF NOT EXISTS symbol_pool (
    ticker TEXT PRIMARY KEY,
    max_weight REAL NOT NULL,
    best_rank INTEGER,
    is_anchor INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS symbol_etf_mapping (
    ticker TEXT NOT NULL,
    etf_symbol TEXT NOT NULL,
    weight REAL NOT NULL,
    PRIMARY KEY (ticker, etf_symbol)
);

CREATE TABLE IF NOT EXISTS source_status (
    ticker TEXT NOT NULL,
    source TEXT NOT NULL,
    ok INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (ticker, source)
);

CREATE TABLE IF NOT EXISTS indicator_fields (
    ticker TEXT PRIMARY KEY,
    fields_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS score_snapshots (
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    kind TEXT NOT NULL,
    composite REAL NOT NULL,
    sub_scores_json TEXT NOT NULL,
    weights_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (symbol, date)
);
"#;

// ============================================================================
// SQLite Storage
// ============================================================================

/// SQLite-backed storage.
pub struct SqliteStorage {
    /// rusqlite::Connection is Send but not Sync, so it sits behind a Mutex
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open trend database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to set database pragmas")?;

        let storage = Self::init(conn, Some(path.to_path_buf()))?;
        info!(db_path = %path.display(), "Initialized trend storage");
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES_SQL)
            .context("Failed to create database tables")?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ------------------------------------------------------------------
    // Import helpers
    // ------------------------------------------------------------------

    pub async fn upsert_etf_config(&self, config: &EtfConfig) -> Result<()> {
        let (coverage_kind, coverage_value) = config.coverage.to_db_parts();
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT OR REPLACE INTO etf_configs
            (symbol, name, level, parent_sector, coverage_kind, coverage_value, frequency, total_holdings, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                config.symbol,
                config.name,
                config.level.to_db_string(),
                config.parent_sector,
                coverage_kind,
                coverage_value,
                config.frequency.to_db_string(),
                config.total_holdings as i64,
                config.status.to_db_string(),
            ],
        )
        .with_context(|| format!("Failed to save ETF config {}", config.symbol))?;
        Ok(())
    }

    /// Replace the holdings recorded for an ETF.
    pub async fn upsert_holdings(&self, etf_symbol: &str, holdings: &[Holding]) -> Result<usize> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM etf_holdings WHERE etf_symbol = ?1", params![etf_symbol])?;
        for h in holdings {
            tx.execute(
                r#"
                INSERT INTO etf_holdings
                (etf_symbol, ticker, weight, sma50, sma200, rsi, positioning_score, term_score)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    etf_symbol,
                    h.ticker,
                    h.weight,
                    h.sma50,
                    h.sma200,
                    h.rsi,
                    h.positioning_score,
                    h.term_score,
                ],
            )?;
        }
        tx.commit()?;
        debug!(etf = etf_symbol, count = holdings.len(), "Saved holdings");
        Ok(holdings.len())
    }

    /// Record that an offline import delivered valid data for a symbol.
    pub async fn record_source_import(&self, symbol: &str, source: SourceId, at: DateTime<Utc>) -> Result<()> {
        self.save_source_flag(symbol, source, true, at).await
    }

    pub async fn pool_tickers(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT ticker FROM symbol_pool ORDER BY ticker")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    fn row_to_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<(EtfConfig, String, f64)> {
        let level: String = row.get(2)?;
        let frequency: String = row.get(6)?;
        let status: String = row.get(8)?;
        let total: i64 = row.get(7)?;
        let config = EtfConfig {
            symbol: row.get(0)?,
            name: row.get(1)?,
            level: EtfLevel::from_db_string(&level).unwrap_or(EtfLevel::Sector),
            parent_sector: row.get(3)?,
            coverage: CoverageRule::TopN(0),
            frequency: UpdateFrequency::from_db_string(&frequency).unwrap_or_default(),
            total_holdings: total.max(0) as usize,
            status: EtfStatus::from_db_string(&status).unwrap_or_default(),
        };
        Ok((config, row.get(4)?, row.get(5)?))
    }

    fn finish_config((mut config, kind, value): (EtfConfig, String, f64)) -> Result<EtfConfig> {
        config.coverage = CoverageRule::from_db_parts(&kind, value)
            .with_context(|| format!("Unknown coverage rule '{}' for {}", kind, config.symbol))?;
        Ok(config)
    }
}

const CONFIG_COLUMNS: &str =
    "symbol, name, level, parent_sector, coverage_kind, coverage_value, frequency, total_holdings, status";

#[async_trait]
impl Storage for SqliteStorage {
    async fn load_holdings(&self, etf_symbol: &str) -> Result<Vec<Holding>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT etf_symbol, ticker, weight, sma50, sma200, rsi, positioning_score, term_score
             FROM etf_holdings WHERE etf_symbol = ?1 ORDER BY weight DESC, ticker",
        )?;
        let rows = stmt.query_map(params![etf_symbol], |row| {
            Ok(Holding {
                etf_symbol: row.get(0)?,
                ticker: row.get(1)?,
                weight: row.get(2)?,
                sma50: row.get(3)?,
                sma200: row.get(4)?,
                rsi: row.get(5)?,
                positioning_score: row.get(6)?,
                term_score: row.get(7)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("Failed to load holdings for {}", etf_symbol))
    }

    async fn load_etf_config(&self, etf_symbol: &str) -> Result<Option<EtfConfig>> {
        let db = self.db.lock().await;
        let raw = db
            .query_row(
                &format!("SELECT {} FROM etf_configs WHERE symbol = ?1", CONFIG_COLUMNS),
                params![etf_symbol],
                Self::row_to_config,
            )
            .optional()?;
        raw.map(Self::finish_config).transpose()
    }

    async fn list_etf_configs(&self) -> Result<Vec<EtfConfig>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM etf_configs ORDER BY level DESC, symbol",
            CONFIG_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::row_to_config)?;
        let mut configs = Vec::new();
        for raw in rows {
            configs.push(Self::finish_config(raw?)?);
        }
        Ok(configs)
    }

    async fn load_indicator_fields(&self, symbol: &str) -> Result<Option<IndicatorFields>> {
        let db = self.db.lock().await;
        let json: Option<String> = db
            .query_row(
                "SELECT fields_json FROM indicator_fields WHERE ticker = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| {
            serde_json::from_str(&j)
                .with_context(|| format!("Corrupt indicator fields for {}", symbol))
        })
        .transpose()
    }

    async fn save_indicator_fields(&self, symbol: &str, fields: &IndicatorFields) -> Result<()> {
        let json = serde_json::to_string(fields)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO indicator_fields (ticker, fields_json, updated_at) VALUES (?1, ?2, ?3)",
            params![symbol, json, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("Failed to save indicator fields for {}", symbol))?;
        Ok(())
    }

    async fn load_source_flags(&self, symbol: &str) -> Result<SourceFlags> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT source, ok, updated_at FROM source_status WHERE ticker = ?1")?;
        let rows = stmt.query_map(params![symbol], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, bool>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut flags = SourceFlags::default();
        for row in rows {
            let (source, ok, updated_at) = row?;
            let Some(source) = SourceId::from_db_string(&source) else {
                continue;
            };
            let at = DateTime::parse_from_rfc3339(&updated_at)
                .with_context(|| format!("Bad timestamp for {} {}", symbol, source))?
                .with_timezone(&Utc);
            flags.set(source, ok, at);
        }
        Ok(flags)
    }

    async fn save_source_flag(&self, symbol: &str, source: SourceId, ok: bool, at: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO source_status (ticker, source, ok, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![symbol, source.as_str(), ok, at.to_rfc3339()],
        )?;
        Ok(())
    }

    async fn replace_pool(&self, pool: &PoolSnapshot) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM symbol_etf_mapping", [])?;
        tx.execute("DELETE FROM symbol_pool", [])?;

        let synced_at = pool.built_at.to_rfc3339();
        for entry in pool.entries.values() {
            tx.execute(
                "INSERT INTO symbol_pool (ticker, max_weight, best_rank, is_anchor, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.ticker,
                    entry.max_weight,
                    entry.best_rank.map(|r| r as i64),
                    entry.is_anchor,
                    synced_at,
                ],
            )?;
            for m in &entry.memberships {
                tx.execute(
                    "INSERT INTO symbol_etf_mapping (ticker, etf_symbol, weight) VALUES (?1, ?2, ?3)",
                    params![entry.ticker, m.etf, m.weight],
                )?;
            }
        }
        tx.commit().context("Failed to persist symbol pool")?;
        info!(symbols = pool.len(), "Persisted symbol pool");
        Ok(())
    }

    async fn load_snapshot(&self, symbol: &str, date: NaiveDate) -> Result<Option<ScoreSnapshot>> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                "SELECT kind, composite, sub_scores_json, weights_json
                 FROM score_snapshots WHERE symbol = ?1 AND date = ?2",
                params![symbol, date.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((kind, composite, sub_json, weights_json)) = row else {
            return Ok(None);
        };
        let sub_scores: BTreeMap<String, f64> = serde_json::from_str(&sub_json)
            .with_context(|| format!("Corrupt sub-scores for {} {}", symbol, date))?;
        let weights: BTreeMap<String, f64> = serde_json::from_str(&weights_json)
            .with_context(|| format!("Corrupt weights for {} {}", symbol, date))?;

        Ok(Some(ScoreSnapshot {
            symbol: symbol.to_string(),
            kind: EntityKind::from_db_string(&kind).unwrap_or(EntityKind::Etf),
            date,
            composite,
            sub_scores,
            weights,
        }))
    }

    async fn save_snapshot(&self, snapshot: &ScoreSnapshot) -> Result<bool> {
        let db = self.db.lock().await;
        insert_snapshot(&db, snapshot, &Utc::now().to_rfc3339())
    }

    async fn save_snapshots(&self, snapshots: &[ScoreSnapshot]) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let created_at = Utc::now().to_rfc3339();
        for snapshot in snapshots {
            if !insert_snapshot(&tx, snapshot, &created_at)? {
                // Dropping the transaction rolls back earlier inserts
                debug!(symbol = %snapshot.symbol, date = %snapshot.date, "Snapshot batch hit an existing row");
                return Ok(false);
            }
        }
        tx.commit().context("Failed to persist score snapshots")?;
        debug!(count = snapshots.len(), "Saved score snapshots");
        Ok(true)
    }
}

/// Insert one snapshot unless the (symbol, date) row exists.
fn insert_snapshot(conn: &Connection, snapshot: &ScoreSnapshot, created_at: &str) -> Result<bool> {
    let sub_json = serde_json::to_string(&snapshot.sub_scores)?;
    let weights_json = serde_json::to_string(&snapshot.weights)?;
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO score_snapshots
             (symbol, date, kind, composite, sub_scores_json, weights_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.symbol,
                snapshot.date.to_string(),
                snapshot.kind.to_db_string(),
                snapshot.composite,
                sub_json,
                weights_json,
                created_at,
            ],
        )
        .with_context(|| format!("Failed to save snapshot for {} {}", snapshot.symbol, snapshot.date))?;
    Ok(inserted == 1)
}

// ============================================================================
// Tests
// ============================================================================
