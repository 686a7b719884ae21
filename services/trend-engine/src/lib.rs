//! Trend Engine Library
//!
//! Market-data acquisition and scoring for a set of tracked sector and
//! industry ETFs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       MarketDataEngine                          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  SymbolPoolBuilder ──> BatchOrchestrator ──> DataSourceRouter    │
//! │          │                    │                  │ RateLimiter   │
//! │          v                    v                  v               │
//! │  CompletenessTracker <── source flags      MarketDataProvider    │
//! │          │                                                       │
//! │          └── gate ──> ScoringEngine ──> ScoreSnapshot + deltas   │
//! └──────────────────────────────────────────────────────────────────┘
//!                              │
//!                           Storage (SQLite)
//! ```
//!
//! # Key Concepts
//!
//! ## Symbol Pool
//! - Each ETF contributes its representative holdings (top-N or weight
//!   threshold)
//! - Overlapping tickers are fetched once
//!
//! ## Completeness Gate
//! - Every symbol carries four source flags
//! - Scores are refused until anchors are fully covered and overall
//!   coverage passes the configured threshold

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod completeness;
pub mod data;
pub mod engine;
pub mod error;
pub mod etf;
pub mod pool;
pub mod scoring;
pub mod session;
pub mod storage;

pub use completeness::{CompletenessReport, CompletenessTracker};
pub use data::{DataCategory, DataSourceRouter, MarketDataProvider, ProviderError, RateLimiter};
pub use engine::{MarketDataEngine, RegimeAssessment, ScoreScope, ScoredEntity};
pub use error::{EngineError, ErrorKind, Result};
pub use etf::{CoverageRule, EtfConfig, Holding};
pub use pool::{PoolSnapshot, SymbolPoolBuilder};
pub use scoring::{MarketRegime, ScoreSnapshot, ScoringEngine};
pub use session::{SessionStatus, UpdateScope, UpdateSession};
pub use storage::{SqliteStorage, Storage};
