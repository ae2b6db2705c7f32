//! Orchestrator behaviour against a real sqlite store, a scripted source and
//! a recording publisher.
//!
//! Covered:
//!   1. New round end to end      -- persist, forecast next, views refreshed
//!   2. Idempotent repeat ticks   -- no duplicate writes or notifications
//!   3. Verify before forecast    -- pending forecast checked first
//!   4. Startup reconciliation    -- backfill, verify, purge, one pending
//!   5. Failure paths             -- source and store errors, bad entries, publisher errors, health

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use roundwatch::cache::{CacheLayer, ViewCache};
use roundwatch::config::Config;
use roundwatch::forecast::ForecasterRegistry;
use roundwatch::health::HealthStatus;
use roundwatch::ingest::{CycleOutcome, IngestReport, Orchestrator};
use roundwatch::model::{Draw, Forecast, MatchType, RoundId};
use roundwatch::notify::{Notification, Publisher};
use roundwatch::source::{source_now, RawRound, RoundSource, SourceBatch};
use roundwatch::store::Store;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedSource {
    entries: Mutex<Vec<RawRound>>,
    failing: Mutex<bool>,
}

impl ScriptedSource {
    fn publish(&self, entries: Vec<RawRound>) {
        *self.entries.lock().unwrap() = entries;
    }

    fn fail(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl RoundSource for ScriptedSource {
    async fn fetch_recent(&self, limit: usize) -> Result<SourceBatch> {
        if *self.failing.lock().unwrap() {
            return Err(anyhow!("source timed out"));
        }
        let entries = self.entries.lock().unwrap();
        let take = limit.min(entries.len());
        Ok(SourceBatch::from_raw(&entries[..take], source_now()))
    }
}

#[derive(Default)]
struct RecordingPublisher {
    sent: Mutex<Vec<Notification>>,
    failing: bool,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, notification: &Notification, _destinations: &[String]) -> Result<()> {
        if self.failing {
            return Err(anyhow!("chat api unavailable"));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<Store>,
    views: Arc<ViewCache>,
    source: Arc<ScriptedSource>,
    publisher: Arc<RecordingPublisher>,
    orchestrator: Orchestrator,
}

fn harness_with(publisher: RecordingPublisher) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ingest.sqlite");
    let store = Arc::new(Store::open(path.to_str().unwrap(), 2, Duration::from_secs(1)).unwrap());
    store.init().unwrap();

    let cfg = Config {
        notify_destinations: vec!["101".to_string()],
        ..Config::default()
    };
    let cache = Arc::new(CacheLayer::new(cfg.cache_max_entries, cfg.cache_ttl()));
    let views = Arc::new(ViewCache::new(cache, store.clone(), cfg.trend_sample, cfg.trend_window));
    let source = Arc::new(ScriptedSource::default());
    let publisher = Arc::new(publisher);
    let orchestrator = Orchestrator::new(
        &cfg,
        source.clone(),
        store.clone(),
        views.clone(),
        ForecasterRegistry::with_defaults().current(),
        publisher.clone(),
    );
    Harness { _dir: dir, store, views, source, publisher, orchestrator }
}

/// Runs raw SQL against the harness database from a separate connection.
fn exec_sql(h: &Harness, sql: &str) {
    let conn = rusqlite::Connection::open(h._dir.path().join("ingest.sqlite")).unwrap();
    conn.execute_batch(sql).unwrap();
}

fn harness() -> Harness {
    harness_with(RecordingPublisher::default())
}

fn raw(id: u64, draw: &str, sum: &str) -> RawRound {
    RawRound {
        id: id.to_string(),
        observed: "08-23 01:16:00".to_string(),
        draw: draw.to_string(),
        sum: Some(sum.to_string()),
    }
}

/// Newest first, like the source publishes.
fn history(ids: std::ops::RangeInclusive<u64>) -> Vec<RawRound> {
    ids.rev().map(|id| raw(id, "1+2+3", "6")).collect()
}

fn seed(h: &Harness, ids: std::ops::RangeInclusive<u64>) {
    let batch = SourceBatch::from_raw(&history(ids), source_now());
    h.store.upsert_rounds(&batch.rounds).unwrap();
}

fn id(n: u64) -> RoundId {
    RoundId::from_value(n, 7)
}

fn pending(target: u64, draw: &str) -> Forecast {
    Forecast::new(id(target), Draw::parse(draw).unwrap(), "default", "v1.0")
}

fn ingested(outcome: CycleOutcome) -> IngestReport {
    match outcome {
        CycleOutcome::Ingested(report) => report,
        other => panic!("expected ingested, got {}", other.as_str()),
    }
}

// ---------------------------------------------------------------------------
// 1. New round end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_round_is_persisted_forecast_and_served_fresh() {
    let h = harness();
    seed(&h, 3326097..=3326099);

    // warm the views so stale entries exist
    assert_eq!(h.views.latest_round().unwrap().unwrap().id, id(3326099));
    assert!(h.views.forecast_history(10).unwrap().is_empty());

    let mut batch = vec![raw(3326100, "4+3+0", "8")];
    batch.extend(history(3326097..=3326099));
    h.source.publish(batch);

    let report = ingested(h.orchestrator.run_cycle().await.unwrap());
    assert!(report.outcome.is_none());
    assert_eq!(report.round.sum, 7);
    assert_eq!(report.backfilled, 0);

    let forecast = report.forecast.unwrap();
    assert_eq!(forecast.target, id(3326101));
    assert!(h.store.pending_forecast(&id(3326101)).unwrap().is_some());

    let stored = h.store.get_round(&id(3326100)).unwrap().unwrap();
    assert_eq!(stored.sum, 7);

    let latest = h.views.latest_round().unwrap().unwrap();
    assert_eq!(latest.id, id(3326100));
    let history = h.views.forecast_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].target, id(3326101));

    let sent = h.publisher.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "Forecast for round 3326101");
}

// ---------------------------------------------------------------------------
// 2. Idempotent repeat ticks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_batch_is_a_noop() {
    let h = harness();
    h.source.publish(history(3326097..=3326100));

    ingested(h.orchestrator.run_cycle().await.unwrap());
    let forecasts = h.store.latest_forecasts(10).unwrap().len();
    let sent = h.publisher.sent.lock().unwrap().len();

    match h.orchestrator.run_cycle().await.unwrap() {
        CycleOutcome::Unchanged { latest, forecast } => {
            assert_eq!(latest, id(3326100));
            assert!(forecast.is_none());
        }
        other => panic!("expected unchanged, got {}", other.as_str()),
    }
    assert_eq!(h.store.latest_forecasts(10).unwrap().len(), forecasts);
    assert_eq!(h.publisher.sent.lock().unwrap().len(), sent);
    assert_eq!(h.store.unverified_forecasts().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_batch_reports_empty() {
    let h = harness();
    assert!(matches!(h.orchestrator.run_cycle().await.unwrap(), CycleOutcome::Empty));
}

// ---------------------------------------------------------------------------
// 3. Verify before forecast
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pending_forecast_is_verified_before_next_is_generated() {
    let h = harness();
    seed(&h, 3326096..=3326098);
    h.store.upsert_forecast(&pending(3326099, "2+4+0")).unwrap();

    let mut batch = vec![raw(3326099, "2+4+1", "7")];
    batch.extend(history(3326096..=3326098));
    h.source.publish(batch);

    let report = ingested(h.orchestrator.run_cycle().await.unwrap());
    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.match_type, MatchType::Partial);
    assert!(outcome.correct);
    assert_eq!(report.forecast.unwrap().target, id(3326100));

    let verified = h.store.get_forecast(&id(3326099)).unwrap().unwrap();
    assert!(!verified.is_pending());

    let unverified = h.store.unverified_forecasts().unwrap();
    assert_eq!(unverified.len(), 1);
    assert_eq!(unverified[0].target, id(3326100));

    let stats = h.views.accuracy_stats().unwrap();
    assert_eq!((stats.total, stats.correct, stats.partial), (1, 1, 1));
    assert_eq!(stats.accuracy, 1.0);

    let titles: Vec<String> = h.publisher.sent.lock().unwrap().iter().map(|n| n.title.clone()).collect();
    assert_eq!(titles, vec!["Verification for round 3326099", "Forecast for round 3326100"]);
}

#[tokio::test]
async fn rounds_missed_between_ticks_are_backfilled_and_verified() {
    let h = harness();
    seed(&h, 3326095..=3326097);
    h.store.upsert_forecast(&pending(3326098, "1+2+3")).unwrap();
    h.source.publish(history(3326095..=3326100));

    let report = ingested(h.orchestrator.run_cycle().await.unwrap());
    assert_eq!(report.backfilled, 2);
    assert!(h.store.round_exists(&id(3326099)).unwrap());

    // the forecast for a backfilled round was verified, not purged
    let f = h.store.get_forecast(&id(3326098)).unwrap().unwrap();
    assert_eq!(f.outcome.unwrap().match_type, MatchType::Exact);
    assert_eq!(report.forecast.unwrap().target, id(3326101));
}

#[tokio::test]
async fn stale_pending_forecasts_are_purged() {
    let h = harness();
    seed(&h, 3326096..=3326098);
    h.store.upsert_forecast(&pending(3326090, "1+3+1")).unwrap();
    h.source.publish(history(3326096..=3326099));

    ingested(h.orchestrator.run_cycle().await.unwrap());
    assert!(h.store.get_forecast(&id(3326090)).unwrap().is_none());
}

#[tokio::test]
async fn purged_forecasts_leave_the_cached_views() {
    let h = harness();
    seed(&h, 3326096..=3326098);
    h.store.upsert_forecast(&pending(3326090, "1+3+1")).unwrap();
    h.store.upsert_forecast(&pending(3326100, "2+4+0")).unwrap();
    assert_eq!(h.views.forecast_history(10).unwrap().len(), 2);

    // 3326100 is already pending, so no new forecast refreshes the views
    h.source.publish(history(3326096..=3326099));
    let report = ingested(h.orchestrator.run_cycle().await.unwrap());
    assert!(report.forecast.is_none());

    let served: Vec<RoundId> = h.views.forecast_history(10).unwrap().into_iter().map(|f| f.target).collect();
    assert_eq!(served, vec![id(3326100)]);
}

// ---------------------------------------------------------------------------
// 4. Startup reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn startup_reconciliation_leaves_one_pending_forecast() {
    let h = harness();
    h.store.upsert_forecast(&pending(3326090, "1+3+1")).unwrap();
    h.store.upsert_forecast(&pending(3326098, "1+2+3")).unwrap();
    h.source.publish(history(3326095..=3326100));

    let report = h.orchestrator.reconcile_startup().await.unwrap();
    assert_eq!(report.fetched, 6);
    assert_eq!(report.persisted, 6);
    assert_eq!(report.verified, 1);
    assert_eq!(report.purged, 1);
    assert_eq!(report.latest, Some(id(3326100)));
    assert_eq!(report.forecast.unwrap().target, id(3326101));

    let unverified = h.store.unverified_forecasts().unwrap();
    assert_eq!(unverified.len(), 1);
    assert_eq!(unverified[0].target, id(3326101));

    // a second pass finds everything current
    let again = h.orchestrator.reconcile_startup().await.unwrap();
    assert_eq!((again.persisted, again.verified, again.purged), (0, 0, 0));
    assert!(again.forecast.is_none());
}

#[tokio::test]
async fn startup_fails_when_source_is_unreachable() {
    let h = harness();
    h.source.fail(true);
    assert!(h.orchestrator.reconcile_startup().await.is_err());
}

// ---------------------------------------------------------------------------
// 5. Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn source_failure_aborts_without_writes() {
    let h = harness();
    h.source.publish(history(3326097..=3326100));
    h.source.fail(true);

    assert!(h.orchestrator.run_cycle().await.is_err());
    assert!(h.store.latest_round_id().unwrap().is_none());
    assert!(h.store.latest_forecasts(10).unwrap().is_empty());

    h.source.fail(false);
    ingested(h.orchestrator.run_cycle().await.unwrap());
}

#[tokio::test]
async fn forecast_lost_to_store_failure_is_generated_next_tick() {
    let h = harness();
    seed(&h, 3326097..=3326099);
    exec_sql(
        &h,
        "CREATE TRIGGER reject_forecasts BEFORE INSERT ON forecasts
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    );
    let mut batch = vec![raw(3326100, "4+3+0", "8")];
    batch.extend(history(3326097..=3326099));
    h.source.publish(batch);

    assert!(h.orchestrator.run_cycle().await.is_err());
    assert!(h.store.round_exists(&id(3326100)).unwrap());
    assert!(h.store.pending_forecast(&id(3326101)).unwrap().is_none());

    exec_sql(&h, "DROP TRIGGER reject_forecasts;");
    match h.orchestrator.run_cycle().await.unwrap() {
        CycleOutcome::Unchanged { latest, forecast } => {
            assert_eq!(latest, id(3326100));
            assert_eq!(forecast.unwrap().target, id(3326101));
        }
        other => panic!("expected unchanged, got {}", other.as_str()),
    }
    assert!(h.store.pending_forecast(&id(3326101)).unwrap().is_some());
    assert_eq!(h.views.latest_forecast().unwrap().unwrap().target, id(3326101));

    // once repaired, repeat ticks are quiet
    match h.orchestrator.run_cycle().await.unwrap() {
        CycleOutcome::Unchanged { forecast, .. } => assert!(forecast.is_none()),
        other => panic!("expected unchanged, got {}", other.as_str()),
    }
    assert_eq!(h.store.unverified_forecasts().unwrap().len(), 1);
    let titles: Vec<String> = h.publisher.sent.lock().unwrap().iter().map(|n| n.title.clone()).collect();
    assert_eq!(titles, vec!["Forecast for round 3326101"]);
}

#[tokio::test]
async fn malformed_entries_are_skipped() {
    let h = harness();
    let mut batch = vec![raw(3326101, "1+2", "3"), raw(3326100, "4+x+0", "4")];
    batch.extend(history(3326097..=3326099));
    h.source.publish(batch);

    let report = ingested(h.orchestrator.run_cycle().await.unwrap());
    assert_eq!(report.round.id, id(3326099));
    assert!(!h.store.round_exists(&id(3326100)).unwrap());
}

#[tokio::test]
async fn insufficient_history_skips_forecast_only() {
    let h = harness();
    h.source.publish(history(3326100..=3326100));

    let report = ingested(h.orchestrator.run_cycle().await.unwrap());
    assert!(report.forecast.is_none());
    assert_eq!(report.notified, 0);
    assert!(h.store.round_exists(&id(3326100)).unwrap());
}

#[tokio::test]
async fn health_degrades_while_source_is_down() {
    let h = harness();
    h.source.publish(history(3326097..=3326100));
    ingested(h.orchestrator.run_cycle().await.unwrap());

    let report = h.orchestrator.health().await;
    assert_eq!(report.status, HealthStatus::Ok);
    assert_eq!(report.latest_round, Some(id(3326100)));
    assert!(report.cache.valid > 0);

    h.source.fail(true);
    let report = h.orchestrator.health().await;
    assert_eq!(report.status, HealthStatus::Degraded);
    assert_eq!(report.component("source").unwrap().status, HealthStatus::Degraded);
    assert_eq!(report.component("store").unwrap().status, HealthStatus::Ok);
}

#[tokio::test]
async fn publisher_failure_keeps_writes() {
    let h = harness_with(RecordingPublisher { failing: true, ..Default::default() });
    h.source.publish(history(3326097..=3326100));

    let report = ingested(h.orchestrator.run_cycle().await.unwrap());
    assert_eq!(report.notified, 0);
    assert!(h.store.pending_forecast(&id(3326101)).unwrap().is_some());
}
