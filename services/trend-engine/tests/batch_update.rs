//! Integration tests for batch update sessions.
//!
//! Exercises the orchestrator end to end: routing with fallback, per-symbol
//! error recording, single-flight, cooperative cancellation and completeness
//! marking.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fixture, fixture_with_config, flaky_fixture, seeded_storage, Gate, MockProvider};
use trend_common::{Config, ProviderId, SourceId};
use trend_engine::data::{DataCategory, DataSourceRouter, IndicatorFields, ManualClock, RateLimiter, RouterConfig};
use trend_engine::error::ErrorKind;
use trend_engine::{EngineError, MarketDataEngine, SessionStatus, Storage, UpdateScope, UpdateSession};

const FULL_POOL_SYMBOLS: usize = 7;

async fn wait(engine: &MarketDataEngine, id: &str) -> UpdateSession {
    tokio::time::timeout(Duration::from_secs(10), engine.wait_for_session(id))
        .await
        .expect("session did not finish in time")
        .unwrap()
}

async fn entered(gate: &Gate) {
    tokio::time::timeout(Duration::from_secs(10), gate.entered.notified())
        .await
        .expect("gated symbol was never fetched");
}

#[tokio::test]
async fn test_full_pool_update_completes() {
    let fx = fixture(
        MockProvider::healthy(ProviderId::PrimaryBroker),
        MockProvider::healthy(ProviderId::SecondaryBroker),
    )
    .await;
    assert!(!fx.engine.tracker().can_compute());

    let id = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    let session = wait(&fx.engine, &id).await;

    assert_eq!(session.status, SessionStatus::Completed);
    // Five pool symbols (SPY anchor included) plus the two ETFs themselves
    assert_eq!(session.total, FULL_POOL_SYMBOLS);
    assert_eq!(session.completed, session.total);
    assert!(session.errors.is_empty());
    assert!(session.outcome().is_ok());
    assert!(session.can_compute);
    assert_eq!(session.eta_seconds, Some(0.0));
    assert!(session.finished_at.is_some());
    assert!(session.rate_stats.contains_key(&ProviderId::PrimaryBroker));

    // Quotes route to the primary broker, options data to the secondary
    assert_eq!(fx.primary.quote_calls(), FULL_POOL_SYMBOLS as u32);
    assert_eq!(fx.primary.total_calls(), FULL_POOL_SYMBOLS as u32);
    assert_eq!(fx.secondary.total_calls(), 2 * FULL_POOL_SYMBOLS as u32);
    assert_eq!(fx.engine.tracker().coverage("NVDA"), 100.0);
    assert!(fx.engine.tracker().can_compute());

    let fields = fx.storage.load_indicator_fields("NVDA").await.unwrap().unwrap();
    assert_eq!(fields.price, Some(110.0));
    assert!(fields.iv30.is_some());
    assert!(fields.positioning_score.is_some());
    assert_eq!(fields.fetched_at.len(), DataCategory::ALL.len());
}

#[tokio::test]
async fn test_fresh_data_is_not_refetched() {
    let fx = fixture(
        MockProvider::healthy(ProviderId::PrimaryBroker),
        MockProvider::healthy(ProviderId::SecondaryBroker),
    )
    .await;

    let first = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    wait(&fx.engine, &first).await;
    let calls_after_first = fx.primary.total_calls() + fx.secondary.total_calls();

    let second = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    let session = wait(&fx.engine, &second).await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.completed, FULL_POOL_SYMBOLS);
    assert_eq!(fx.primary.total_calls() + fx.secondary.total_calls(), calls_after_first);
}

#[tokio::test]
async fn test_force_refresh_refetches() {
    let mut config = Config::default();
    config.update.force_refresh = true;
    let fx = fixture_with_config(
        config,
        MockProvider::healthy(ProviderId::PrimaryBroker),
        MockProvider::healthy(ProviderId::SecondaryBroker),
    )
    .await;

    for _ in 0..2 {
        let id = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
        wait(&fx.engine, &id).await;
    }
    assert_eq!(fx.primary.quote_calls(), 2 * FULL_POOL_SYMBOLS as u32);
}

#[tokio::test]
async fn test_second_start_conflicts_while_running() {
    let gate = Gate::new("AAPL");
    let fx = fixture(
        MockProvider::healthy(ProviderId::PrimaryBroker).with_gate(gate.clone()),
        MockProvider::healthy(ProviderId::SecondaryBroker),
    )
    .await;

    let id = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    entered(&gate).await;

    let second = fx.engine.start_batch_update(UpdateScope::etf("XLK")).await;
    assert!(matches!(second, Err(EngineError::Conflict(_))));
    assert_eq!(fx.engine.get_session_status(&id).unwrap().status, SessionStatus::Running);

    gate.release.notify_one();
    let session = wait(&fx.engine, &id).await;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.completed, FULL_POOL_SYMBOLS);

    // Slot is free again once the first session is terminal
    let third = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    assert_eq!(wait(&fx.engine, &third).await.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_cancel_stops_at_next_symbol() {
    // Pool order is alphabetical: AAPL, AVGO, MSFT, ...
    let gate = Gate::new("AVGO");
    let fx = fixture(
        MockProvider::healthy(ProviderId::PrimaryBroker).with_gate(gate.clone()),
        MockProvider::healthy(ProviderId::SecondaryBroker),
    )
    .await;

    let id = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    entered(&gate).await;

    assert_eq!(fx.engine.cancel_session(&id).unwrap(), SessionStatus::Running);
    gate.release.notify_one();

    let session = wait(&fx.engine, &id).await;
    assert_eq!(session.status, SessionStatus::Cancelled);
    // The in-flight symbol finished; nothing after it started
    assert_eq!(session.completed, 2);
    assert!(session.completed < session.total);
    assert!(fx.primary.saw("AVGO"));
    assert!(!fx.primary.saw("MSFT"));
    assert!(!session.can_compute);

    // Cancelling a terminal session is a no-op
    assert_eq!(fx.engine.cancel_session(&id).unwrap(), SessionStatus::Cancelled);
    assert_eq!(fx.engine.get_session_status(&id).unwrap().status, SessionStatus::Cancelled);
}

#[tokio::test]
async fn test_fallback_serves_and_primary_marked_invalid() {
    let fx = fixture(
        MockProvider::failing(ProviderId::PrimaryBroker),
        MockProvider::healthy(ProviderId::SecondaryBroker),
    )
    .await;

    let id = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    let session = wait(&fx.engine, &id).await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.errors.is_empty());
    assert_eq!(session.current_provider, Some(ProviderId::SecondaryBroker));

    // Every quote hit the primary once, then the fallback served it
    assert_eq!(fx.primary.quote_calls(), FULL_POOL_SYMBOLS as u32);
    assert_eq!(fx.secondary.quote_calls(), FULL_POOL_SYMBOLS as u32);

    let flags = fx.engine.tracker().flags("NVDA").unwrap();
    assert!(!flags.is_valid(SourceId::PrimaryBroker));
    assert!(flags.get(SourceId::PrimaryBroker).is_some());
    assert!(flags.is_valid(SourceId::SecondaryBroker));
    assert_eq!(fx.engine.tracker().coverage("NVDA"), 75.0);
    assert!(!session.can_compute);

    let stored = fx.storage.load_source_flags("NVDA").await.unwrap();
    assert!(!stored.is_valid(SourceId::PrimaryBroker));
}

#[tokio::test]
async fn test_symbol_failure_is_recorded_and_batch_continues() {
    let fx = fixture(
        MockProvider::failing_for(ProviderId::PrimaryBroker, &["MSFT"]),
        MockProvider::failing_for(ProviderId::SecondaryBroker, &["MSFT"]),
    )
    .await;

    let id = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    let session = wait(&fx.engine, &id).await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.completed, session.total);
    assert_eq!(session.errors.len(), DataCategory::ALL.len());
    for error in &session.errors {
        assert_eq!(error.symbol, "MSFT");
        assert_eq!(error.kind, ErrorKind::Connection);
        assert!(error.provider.is_some());
    }
    assert!(matches!(
        session.outcome(),
        Err(EngineError::PartialBatchFailure { failed: 3, .. })
    ));

    // Symbols after the failing one were still processed
    assert!(fx.primary.saw("NVDA"));
    assert_eq!(fx.engine.tracker().coverage("MSFT"), 50.0);
    assert_eq!(fx.engine.tracker().coverage("NVDA"), 100.0);
    assert!(fx.storage.load_indicator_fields("MSFT").await.unwrap().is_none());
}

#[tokio::test]
async fn test_etf_scope_limits_symbols() {
    let fx = fixture(
        MockProvider::healthy(ProviderId::PrimaryBroker),
        MockProvider::healthy(ProviderId::SecondaryBroker),
    )
    .await;

    let scope = UpdateScope::Etf {
        symbol: "XLK".into(),
        top_n: Some(2),
    };
    let id = fx.engine.start_batch_update(scope).await.unwrap();
    let session = wait(&fx.engine, &id).await;

    assert_eq!(session.scope, "etf:XLK:top2");
    // The ETF itself plus AAPL and MSFT
    assert_eq!(session.total, 3);
    assert_eq!(session.completed, 3);
    assert!(fx.primary.saw("XLK"));
    assert!(fx.primary.saw("MSFT"));
    assert!(!fx.primary.saw("NVDA"));
}

#[tokio::test]
async fn test_malformed_scope_fails_immediately() {
    let fx = fixture(
        MockProvider::healthy(ProviderId::PrimaryBroker),
        MockProvider::healthy(ProviderId::SecondaryBroker),
    )
    .await;

    let id = fx.engine.start_batch_update(UpdateScope::etf("XLE")).await.unwrap();
    let session = fx.engine.get_session_status(&id).unwrap();

    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.total, 0);
    assert_eq!(session.errors.len(), 1);
    assert_eq!(session.errors[0].kind, ErrorKind::Validation);
    assert_eq!(fx.primary.total_calls(), 0);

    // A failed start does not hold the slot
    let next = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    assert_eq!(wait(&fx.engine, &next).await.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_unknown_session_id() {
    let fx = fixture(
        MockProvider::healthy(ProviderId::PrimaryBroker),
        MockProvider::healthy(ProviderId::SecondaryBroker),
    )
    .await;
    assert!(matches!(
        fx.engine.get_session_status("missing"),
        Err(EngineError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_fail_fast_rate_limit_falls_back() {
    let mut config = Config::default();
    config.data_sources.wait_for_rate_limit = false;

    let clock = Arc::new(ManualClock::new());
    let router = DataSourceRouter::new(RouterConfig::from_sources(&config.data_sources), &config.providers)
        .with_limiter(
            ProviderId::PrimaryBroker,
            Arc::new(RateLimiter::with_clock("primary_broker", 1, clock)),
        );

    let storage = seeded_storage().await;
    let engine = MarketDataEngine::with_router(config, storage.clone() as Arc<dyn Storage>, router);
    let primary = Arc::new(MockProvider::healthy(ProviderId::PrimaryBroker));
    let secondary = Arc::new(MockProvider::healthy(ProviderId::SecondaryBroker));
    engine.register_provider(primary.clone()).await;
    engine.register_provider(secondary.clone()).await;
    engine.sync_configured_pool().await.unwrap();

    let id = engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    let session = wait(&engine, &id).await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.errors.is_empty());
    // One primary slot per minute; the rest of the quotes went to the fallback
    assert_eq!(primary.quote_calls(), 1);
    assert_eq!(secondary.quote_calls(), FULL_POOL_SYMBOLS as u32 - 1);
    assert_eq!(session.rate_stats[&ProviderId::PrimaryBroker].current_rate, 1);
}

#[tokio::test]
async fn test_provider_panic_fails_session_and_frees_slot() {
    let fx = fixture(
        MockProvider::panicking(ProviderId::PrimaryBroker),
        MockProvider::healthy(ProviderId::SecondaryBroker),
    )
    .await;

    let id = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    let session = wait(&fx.engine, &id).await;
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.finished_at.is_some());
    let last = session.errors.last().unwrap();
    assert_eq!(last.kind, ErrorKind::Internal);
    assert!(last.message.contains("aborted"));

    // The dead session no longer blocks new ones
    let next = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    assert_ne!(next, id);
    assert_eq!(wait(&fx.engine, &next).await.status, SessionStatus::Failed);
}

#[tokio::test]
async fn test_unreadable_fields_skip_symbol_without_overwrite() {
    let fx = flaky_fixture().await;
    let stored = IndicatorFields {
        price: Some(50.0),
        sma200: Some(40.0),
        ..Default::default()
    };
    fx.storage.inner.save_indicator_fields("AAPL", &stored).await.unwrap();
    fx.storage.fail_field_loads_for("AAPL");

    let id = fx.engine.start_batch_update(UpdateScope::FullPool).await.unwrap();
    let session = wait(&fx.engine, &id).await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.completed, FULL_POOL_SYMBOLS);
    assert_eq!(session.errors.len(), 1);
    assert_eq!(session.errors[0].symbol, "AAPL");
    assert_eq!(session.errors[0].kind, ErrorKind::Storage);

    assert!(!fx.primary.saw("AAPL"));
    assert!(fx.primary.saw("MSFT"));
    let fields = fx.storage.inner.load_indicator_fields("AAPL").await.unwrap().unwrap();
    assert_eq!(fields, stored);
}
