//! Batch update orchestrator.
//!
//! Runs one session at a time as a background task. Symbols are processed
//! sequentially; cancellation is checked before each symbol, so an in-flight
//! provider call always completes first.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{SessionError, SessionRegistry, SessionStatus, UpdateScope, UpdateSession};
use crate::completeness::CompletenessTracker;
use crate::data::{DataCategory, DataSourceRouter};
use crate::error::{EngineError, ErrorKind, Result};
use crate::etf::{CoverageRule, EtfLevel};
use crate::pool::{select_holdings, SharedPool};
use crate::storage::Storage;
use trend_common::config::UpdateConfig;
use trend_common::ProviderId;

/// Terminal sessions kept for status queries; older ones are evicted.
pub const RETAINED_SESSIONS: usize = 16;

// ============================================================================
// Session Handle
// ============================================================================

struct SessionHandle {
    /// Start order, used for eviction
    seq: u64,
    state: RwLock<UpdateSession>,
    cancel: AtomicBool,
    status_tx: watch::Sender<SessionStatus>,
    registry: Arc<SessionRegistry>,
}

impl SessionHandle {
    fn new(seq: u64, session: UpdateSession, registry: Arc<SessionRegistry>) -> Self {
        let (status_tx, _) = watch::channel(session.status);
        Self {
            seq,
            state: RwLock::new(session),
            cancel: AtomicBool::new(false),
            status_tx,
            registry,
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut UpdateSession) -> R) -> R {
        let mut session = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut session)
    }

    fn snapshot(&self) -> UpdateSession {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Move to `next`. Entering a terminal state frees the single-flight
    /// slot under the same lock, so anyone who observes the terminal status
    /// can start a new session.
    fn transition(&self, next: SessionStatus) -> bool {
        let moved = self.update(|s| {
            let moved = s.transition(next);
            if moved && next.is_terminal() {
                self.registry.release(&s.id);
            }
            moved
        });
        if moved {
            self.status_tx.send_replace(next);
        }
        moved
    }

    fn push_error(&self, error: SessionError) {
        self.update(|s| s.errors.push(error));
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

#[derive(Clone)]
pub struct BatchOrchestrator {
    router: Arc<DataSourceRouter>,
    tracker: Arc<CompletenessTracker>,
    storage: Arc<dyn Storage>,
    pool: SharedPool,
    config: UpdateConfig,
    registry: Arc<SessionRegistry>,
    sessions: Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>,
    next_seq: Arc<AtomicU64>,
}

impl BatchOrchestrator {
    pub fn new(
        router: Arc<DataSourceRouter>,
        tracker: Arc<CompletenessTracker>,
        storage: Arc<dyn Storage>,
        pool: SharedPool,
        config: UpdateConfig,
    ) -> Self {
        Self {
            router,
            tracker,
            storage,
            pool,
            config,
            registry: Arc::new(SessionRegistry::new()),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Id of the session currently holding the single-flight slot.
    pub fn active_session(&self) -> Option<String> {
        self.registry.active()
    }

    fn handle(&self, id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))
    }

    /// Start a batch update and return its session id.
    ///
    /// Fails with `Conflict` while another session is active. A scope that
    /// cannot be resolved yields a session that is already `failed`.
    pub async fn start(&self, scope: UpdateScope) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.registry.try_acquire(&id)?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(SessionHandle::new(
            seq,
            UpdateSession::new(&id, &scope),
            self.registry.clone(),
        ));
        {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            evict_terminal(&mut sessions, RETAINED_SESSIONS);
            sessions.insert(id.clone(), handle.clone());
        }

        let symbols = match self.resolve_scope(&scope).await {
            Ok(symbols) => symbols,
            Err(e) => {
                warn!(session_id = %id, scope = %scope.describe(), error = %e, "Batch scope rejected");
                handle.push_error(SessionError {
                    symbol: String::new(),
                    provider: None,
                    category: None,
                    kind: e.kind(),
                    message: e.to_string(),
                    at: Utc::now(),
                });
                handle.transition(SessionStatus::Failed);
                return Ok(id);
            }
        };

        handle.update(|s| s.total = symbols.len());
        info!(
            session_id = %id,
            scope = %scope.describe(),
            symbols = symbols.len(),
            "Starting batch update"
        );

        let this = self.clone();
        let session_id = id.clone();
        let run_handle = handle.clone();
        let task = tokio::spawn(async move {
            this.run(&session_id, run_handle, symbols).await;
        });

        // Fails the session if the run task panics
        let this = self.clone();
        let session_id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                this.abort(&session_id, &handle, &e.to_string());
            }
        });

        Ok(id)
    }

    fn abort(&self, id: &str, handle: &SessionHandle, reason: &str) {
        let session = handle.snapshot();
        error!(
            session_id = %id,
            symbol = ?session.current_symbol,
            error = %reason,
            "Batch update task aborted"
        );
        if !session.status.is_terminal() {
            handle.push_error(SessionError {
                symbol: session.current_symbol.clone().unwrap_or_default(),
                provider: session.current_provider,
                category: None,
                kind: ErrorKind::Internal,
                message: format!("update task aborted: {}", reason),
                at: Utc::now(),
            });
            handle.transition(SessionStatus::Failed);
        }
        self.registry.release(id);
    }

    /// Snapshot of a session's state.
    pub fn status(&self, id: &str) -> Result<UpdateSession> {
        Ok(self.handle(id)?.snapshot())
    }

    /// Request cooperative cancellation. Returns the status at call time;
    /// terminal sessions are left untouched.
    pub fn cancel(&self, id: &str) -> Result<SessionStatus> {
        let handle = self.handle(id)?;
        let status = handle.snapshot().status;
        if !status.is_terminal() {
            handle.cancel.store(true, Ordering::SeqCst);
            info!(session_id = %id, "Batch cancellation requested");
        }
        Ok(status)
    }

    /// Wait until the session reaches a terminal state.
    pub async fn wait(&self, id: &str) -> Result<UpdateSession> {
        let handle = self.handle(id)?;
        let mut rx = handle.status_tx.subscribe();
        rx.wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| EngineError::SessionNotFound(id.to_string()))?;
        Ok(handle.snapshot())
    }

    // ========================================================================
    // Scope Resolution
    // ========================================================================

    async fn resolve_scope(&self, scope: &UpdateScope) -> Result<Vec<String>> {
        match scope {
            UpdateScope::FullPool => {
                let pool = self
                    .pool
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| EngineError::Validation("symbol pool is empty or not synced".into()))?;

                // ETF instruments are fetched alongside their holdings
                let mut symbols = pool.tickers();
                for selection in &pool.etfs {
                    if pool.entry(&selection.etf).is_none() {
                        symbols.push(selection.etf.clone());
                    }
                }
                Ok(symbols)
            }
            UpdateScope::Etf { symbol, top_n } => {
                let config = self
                    .storage
                    .load_etf_config(symbol)
                    .await?
                    .ok_or_else(|| EngineError::Validation(format!("ETF {} is not configured", symbol)))?;
                let holdings = self.storage.load_holdings(symbol).await?;
                if holdings.is_empty() {
                    return Err(EngineError::Validation(format!("ETF {} has no holdings", symbol)));
                }

                let n = top_n.unwrap_or(match config.level {
                    EtfLevel::Sector => self.config.default_top_n_sector,
                    EtfLevel::Industry => self.config.default_top_n_industry,
                });
                if n == 0 {
                    return Err(EngineError::Validation(format!("top_n for {} must be positive", symbol)));
                }

                let mut symbols = vec![symbol.clone()];
                for h in select_holdings(&holdings, CoverageRule::TopN(n)) {
                    if h.ticker != *symbol {
                        symbols.push(h.ticker.clone());
                    }
                }
                Ok(symbols)
            }
        }
    }

    // ========================================================================
    // Update Loop
    // ========================================================================

    async fn run(&self, id: &str, handle: Arc<SessionHandle>, symbols: Vec<String>) {
        let started = Instant::now();
        handle.transition(SessionStatus::Running);

        let mut cancelled = false;
        for symbol in &symbols {
            if handle.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }

            handle.update(|s| s.current_symbol = Some(symbol.clone()));
            self.update_symbol(&handle, symbol).await;

            let rate_stats = self.router.rate_stats();
            let elapsed = started.elapsed().as_secs_f64();
            handle.update(|s| {
                s.record_progress(elapsed);
                s.rate_stats = rate_stats;
            });
        }

        // Cancellation requested during the last symbol still counts
        if !cancelled && handle.cancel.load(Ordering::SeqCst) {
            cancelled = true;
        }

        if cancelled {
            handle.transition(SessionStatus::Cancelled);
        } else {
            let can_compute = self.tracker.can_compute();
            handle.update(|s| {
                s.can_compute = can_compute;
                s.current_symbol = None;
            });
            handle.transition(SessionStatus::Completed);
        }

        let session = handle.snapshot();
        info!(
            session_id = %id,
            status = %session.status,
            completed = session.completed,
            total = session.total,
            errors = session.errors.len(),
            elapsed_seconds = session.elapsed_seconds,
            can_compute = session.can_compute,
            "Batch update finished"
        );
    }

    /// Refresh every stale category for one symbol and record which
    /// providers served it.
    async fn update_symbol(&self, handle: &SessionHandle, symbol: &str) {
        let now = Utc::now();
        let stale_after = ChronoDuration::hours(self.config.stale_after_hours as i64);

        // Unreadable fields are never overwritten; skip the symbol
        let mut fields = match self.storage.load_indicator_fields(symbol).await {
            Ok(fields) => fields.unwrap_or_default(),
            Err(e) => {
                self.record_storage_error(handle, symbol, &e);
                return;
            }
        };

        let mut served: BTreeSet<ProviderId> = BTreeSet::new();
        let mut failed: BTreeSet<ProviderId> = BTreeSet::new();
        let mut changed = false;

        for category in DataCategory::ALL {
            if !self.config.force_refresh && fields.is_fresh(category, now, stale_after) {
                debug!(symbol = %symbol, category = %category, "Skipping fresh category");
                continue;
            }

            match self.router.fetch(symbol, category).await {
                Ok(routed) => {
                    if routed.primary_error.is_some() {
                        failed.insert(self.router.config().route(category).primary);
                    }
                    served.insert(routed.served_by);
                    handle.update(|s| s.current_provider = Some(routed.served_by));
                    fields.apply(&routed.payload, Utc::now());
                    changed = true;
                }
                Err(route_err) => {
                    for (provider, _) in &route_err.attempts {
                        failed.insert(*provider);
                    }
                    let (provider, kind) = route_err
                        .attempts
                        .last()
                        .map(|(p, e)| (Some(*p), e.kind()))
                        .unwrap_or((None, ErrorKind::Internal));
                    warn!(
                        symbol = %symbol,
                        category = %category,
                        error = %route_err,
                        "Fetch failed; continuing batch"
                    );
                    handle.push_error(SessionError {
                        symbol: symbol.to_string(),
                        provider,
                        category: Some(category),
                        kind,
                        message: route_err.to_string(),
                        at: Utc::now(),
                    });
                }
            }
        }

        if changed {
            if let Err(e) = self.storage.save_indicator_fields(symbol, &fields).await {
                self.record_storage_error(handle, symbol, &e);
            }
        }

        let at = Utc::now();
        for provider in served.union(&failed) {
            let ok = served.contains(provider);
            let source = provider.source();
            self.tracker.mark_source_at(symbol, source, ok, at);
            if let Err(e) = self.storage.save_source_flag(symbol, source, ok, at).await {
                self.record_storage_error(handle, symbol, &e);
            }
        }
    }

    fn record_storage_error(&self, handle: &SessionHandle, symbol: &str, e: &anyhow::Error) {
        error!(symbol = %symbol, error = %e, "Storage failure during batch update");
        handle.push_error(SessionError {
            symbol: symbol.to_string(),
            provider: None,
            category: None,
            kind: ErrorKind::Storage,
            message: format!("{:#}", e),
            at: Utc::now(),
        });
    }
}

/// Drop the oldest terminal sessions beyond `keep`.
fn evict_terminal(sessions: &mut HashMap<String, Arc<SessionHandle>>, keep: usize) {
    let mut terminal: Vec<(u64, String)> = sessions
        .iter()
        .filter(|(_, h)| h.snapshot().status.is_terminal())
        .map(|(id, h)| (h.seq, id.clone()))
        .collect();
    if terminal.len() <= keep {
        return;
    }
    terminal.sort_unstable();
    let excess = terminal.len() - keep;
    for (_, id) in terminal.into_iter().take(excess) {
        sessions.remove(&id);
        debug!(session_id = %id, "Evicted finished session");
    }
}
