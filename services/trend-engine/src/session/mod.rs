//! Batch update sessions.
//!
//! A session walks a symbol scope, fetching each stale data category
//! through the router and recording per-provider completeness as it goes.
//!
//! # Lifecycle
//!
//! ```text
//! pending ──> running ──> completed
//!    │           ├──────> cancelled
//!    └───────────┴──────> failed
//! ```
//!
//! Only one session may be active at a time; see [`SessionRegistry`].

mod orchestrator;
mod registry;

pub use orchestrator::BatchOrchestrator;
pub use registry::SessionRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::data::{DataCategory, RateStats};
use crate::error::{EngineError, ErrorKind};
use trend_common::ProviderId;

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

// ============================================================================
// Scope
// ============================================================================

/// What a batch update covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum UpdateScope {
    /// Every symbol in the synced pool
    FullPool,
    /// One ETF's highest-weight holdings; `None` uses the configured default
    Etf { symbol: String, top_n: Option<usize> },
}

impl UpdateScope {
    pub fn etf(symbol: &str) -> Self {
        Self::Etf {
            symbol: symbol.to_string(),
            top_n: None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::FullPool => "full_pool".to_string(),
            Self::Etf { symbol, top_n: Some(n) } => format!("etf:{}:top{}", symbol, n),
            Self::Etf { symbol, top_n: None } => format!("etf:{}", symbol),
        }
    }
}

// ============================================================================
// Session Snapshot
// ============================================================================

/// One failed fetch, or a scope-level failure when `symbol` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    pub symbol: String,
    pub provider: Option<ProviderId>,
    pub category: Option<DataCategory>,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Observable state of a batch update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSession {
    pub id: String,
    pub status: SessionStatus,
    pub scope: String,
    pub total: usize,
    pub completed: usize,
    pub current_symbol: Option<String>,
    pub current_provider: Option<ProviderId>,
    pub rate_stats: BTreeMap<ProviderId, RateStats>,
    pub elapsed_seconds: f64,
    pub avg_time_per_symbol: f64,
    pub eta_seconds: Option<f64>,
    pub errors: Vec<SessionError>,
    pub can_compute: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl UpdateSession {
    pub fn new(id: &str, scope: &UpdateScope) -> Self {
        Self {
            id: id.to_string(),
            status: SessionStatus::Pending,
            scope: scope.describe(),
            total: 0,
            completed: 0,
            current_symbol: None,
            current_provider: None,
            rate_stats: BTreeMap::new(),
            elapsed_seconds: 0.0,
            avg_time_per_symbol: 0.0,
            eta_seconds: None,
            errors: Vec::new(),
            can_compute: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    /// Record progress after a symbol and refresh the time estimates.
    pub fn record_progress(&mut self, elapsed_seconds: f64) {
        self.completed = (self.completed + 1).min(self.total);
        self.elapsed_seconds = elapsed_seconds;
        if self.completed > 0 {
            self.avg_time_per_symbol = elapsed_seconds / self.completed as f64;
            self.eta_seconds = Some(self.avg_time_per_symbol * (self.total - self.completed) as f64);
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }

    /// `Err(PartialBatchFailure)` for a completed session with fetch errors.
    pub fn outcome(&self) -> Result<(), EngineError> {
        if self.status == SessionStatus::Completed && !self.errors.is_empty() {
            return Err(EngineError::PartialBatchFailure {
                session_id: self.id.clone(),
                failed: self.errors.len(),
            });
        }
        Ok(())
    }
}
