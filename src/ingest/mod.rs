//! The ingestion orchestrator.
//!
//! One cycle per tick: fetch, novelty check, verify, persist, refresh round
//! views, forecast the next round, persist it, refresh forecast views,
//! notify. Cycles run back to back on a single task and never overlap, which
//! keeps the orchestrator the only writer of round and forecast state.
//! A tick that finds nothing new still checks that the stored latest round
//! has a pending forecast, which repairs a cycle that failed part way.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::cache::ViewCache;
use crate::config::Config;
use crate::forecast::{forecast_next, Forecaster};
use crate::health::{self, HealthReport};
use crate::logging::{
    debug, error, info, log_cycle, log_forecast, log_round_observed, obj, v_int, v_str, warn, Domain, FailureStreak,
    ProfileScope,
};
use crate::model::{Forecast, Outcome, Round, RoundId};
use crate::notify::{Notification, Publisher};
use crate::source::RoundSource;
use crate::store::Store;
use crate::verify::Verifier;

pub mod retention;

/// Consecutive identical failures between repeated error logs.
const FAILURE_LOG_EVERY: u64 = 30;

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub round: Round,
    /// Outcome recorded for the forecast that targeted `round`
    pub outcome: Option<Outcome>,
    /// Forecast generated for the round after `round`
    pub forecast: Option<Forecast>,
    /// Older rounds from the same batch that were missing
    pub backfilled: usize,
    pub notified: usize,
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// The source returned no usable rounds.
    Empty,
    /// The newest round is already stored. `forecast` is set when an
    /// earlier failed cycle left the next round without one.
    Unchanged { latest: RoundId, forecast: Option<Forecast> },
    Ingested(IngestReport),
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Empty => "empty",
            CycleOutcome::Unchanged { .. } => "unchanged",
            CycleOutcome::Ingested(_) => "ingested",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub fetched: usize,
    pub persisted: usize,
    pub verified: usize,
    pub purged: usize,
    pub latest: Option<RoundId>,
    pub forecast: Option<Forecast>,
}

pub struct Orchestrator {
    source: Arc<dyn RoundSource>,
    store: Arc<Store>,
    views: Arc<ViewCache>,
    forecaster: Arc<dyn Forecaster>,
    verifier: Verifier,
    publisher: Arc<dyn Publisher>,
    destinations: Vec<String>,
    fetch_window: usize,
    startup_window: usize,
    poll_interval: Duration,
    /// Target of the last skipped forecast, so a retry on every tick warns once.
    last_skipped: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        cfg: &Config,
        source: Arc<dyn RoundSource>,
        store: Arc<Store>,
        views: Arc<ViewCache>,
        forecaster: Arc<dyn Forecaster>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            source,
            store,
            views,
            forecaster,
            verifier: Verifier::new(cfg.match_threshold),
            publisher,
            destinations: cfg.notify_destinations.clone(),
            fetch_window: cfg.fetch_window,
            startup_window: cfg.startup_window,
            poll_interval: cfg.poll_interval(),
            last_skipped: AtomicU64::new(0),
        }
    }

    /// One full cycle. An `Err` means nothing past the failing step was
    /// written; the next tick starts over, and a round stored before the
    /// failure gets its forecast through the unchanged path.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let _scope = ProfileScope::new("ingest_cycle");

        let batch = self.source.fetch_recent(self.fetch_window).await?;
        let Some(newest) = batch.newest().cloned() else {
            return Ok(CycleOutcome::Empty);
        };
        if self.store.round_exists(&newest.id)? {
            log_round_observed(newest.id.as_str(), &newest.draw.to_string(), newest.sum, false);
            let forecast = self.recover_forecast().await?;
            return Ok(CycleOutcome::Unchanged { latest: newest.id, forecast });
        }
        log_round_observed(newest.id.as_str(), &newest.draw.to_string(), newest.sum, true);

        // Older rounds missed between ticks go in first, each verified
        // before it is stored.
        let mut backfilled = 0;
        for round in batch.rounds[1..].iter().rev() {
            if self.store.round_exists(&round.id)? {
                continue;
            }
            self.verify(round)?;
            self.store.upsert_round(round)?;
            backfilled += 1;
        }
        if backfilled > 0 {
            info(
                Domain::Ingest,
                "backfilled",
                obj(&[("round_id", v_str(newest.id.as_str())), ("count", v_int(backfilled as i64))]),
            );
        }

        let verified = self.verify(&newest)?;
        self.store.upsert_round(&newest)?;
        self.views.on_round_observed(&newest)?;

        self.purge_stale(&newest.id)?;
        let forecast = self.ensure_forecast(&newest)?;

        let mut notified = 0;
        if let Some(forecast) = &verified {
            notified += self.notify(Notification::verification(forecast)).await as usize;
        }
        if let Some(forecast) = &forecast {
            notified += self.notify(Notification::forecast_broadcast(forecast, &newest)).await as usize;
        }

        Ok(CycleOutcome::Ingested(IngestReport {
            outcome: verified.and_then(|f| f.outcome),
            round: newest,
            forecast,
            backfilled,
            notified,
        }))
    }

    /// A cycle that failed after persisting its round leaves the next round
    /// unforecast; repeat ticks fill the gap against the stored latest round.
    async fn recover_forecast(&self) -> Result<Option<Forecast>> {
        let Some(latest) = self.views.latest_round()? else {
            return Ok(None);
        };
        self.purge_stale(&latest.id)?;
        let forecast = self.ensure_forecast(&latest)?;
        if let Some(forecast) = &forecast {
            info(
                Domain::Forecast,
                "forecast_recovered",
                obj(&[("target_id", v_str(forecast.target.as_str()))]),
            );
            self.notify(Notification::forecast_broadcast(forecast, &latest)).await;
        }
        Ok(forecast)
    }

    /// Verifies the pending forecast for `round` and refreshes the views it
    /// affects. No pending forecast is normal (first run, gaps).
    fn verify(&self, round: &Round) -> Result<Option<Forecast>> {
        match self.verifier.verify_round(&self.store, round)? {
            Some((forecast, _)) => {
                self.views.on_forecast_verified()?;
                Ok(Some(forecast))
            }
            None => Ok(None),
        }
    }

    /// Pending forecasts targeting rounds before `latest` can never be
    /// verified.
    fn purge_stale(&self, latest: &RoundId) -> Result<usize> {
        let purged = self.store.purge_stale_pending(latest)?;
        if purged > 0 {
            self.views.on_forecasts_purged();
            warn(
                Domain::Forecast,
                "stale_forecasts_purged",
                obj(&[("round_id", v_str(latest.as_str())), ("count", v_int(purged as i64))]),
            );
        }
        Ok(purged)
    }

    /// Makes sure a pending forecast targets `latest + 1`. Returns the
    /// forecast only when one was generated here.
    fn ensure_forecast(&self, latest: &Round) -> Result<Option<Forecast>> {
        let target = latest.id.next();
        if self.store.pending_forecast(&target)?.is_some() {
            debug(
                Domain::Forecast,
                "forecast_current",
                obj(&[("target_id", v_str(target.as_str()))]),
            );
            return Ok(None);
        }

        let history = self.views.latest_rounds(self.forecaster.required_history())?;
        let forecast = match forecast_next(self.forecaster.as_ref(), &history) {
            Ok(f) => f,
            Err(err) => {
                self.skip_forecast(&target, &err.to_string());
                return Ok(None);
            }
        };
        if forecast.target != target {
            self.skip_forecast(&target, &format!("history ends at {}", history[0].id));
            return Ok(None);
        }

        if !self.store.upsert_forecast(&forecast)? {
            return Ok(None);
        }
        self.views.on_forecast_generated(&forecast)?;
        log_forecast(
            forecast.target.as_str(),
            &forecast.draw.to_string(),
            &forecast.algorithm,
            &forecast.version,
        );
        Ok(Some(forecast))
    }

    fn skip_forecast(&self, target: &RoundId, reason: &str) {
        if self.last_skipped.swap(target.value(), Ordering::Relaxed) == target.value() {
            return;
        }
        warn(
            Domain::Forecast,
            "forecast_skipped",
            obj(&[("target_id", v_str(target.as_str())), ("error", v_str(reason))]),
        );
    }

    async fn notify(&self, notification: Notification) -> bool {
        match self.publisher.publish(&notification, &self.destinations).await {
            Ok(()) => true,
            Err(err) => {
                error(
                    Domain::Notify,
                    "publish_failed",
                    obj(&[("title", v_str(&notification.title)), ("error", v_str(&err.to_string()))]),
                );
                false
            }
        }
    }

    pub async fn health(&self) -> HealthReport {
        health::check(self.source.as_ref(), &self.store, self.views.cache(), self.publisher.as_ref()).await
    }

    /// Runs once before the loop. Any failure here is fatal.
    pub async fn reconcile_startup(&self) -> Result<ReconcileReport> {
        let batch = self
            .source
            .fetch_recent(self.startup_window)
            .await
            .context("startup fetch from round source")?;
        let mut report = ReconcileReport { fetched: batch.rounds.len(), ..Default::default() };

        let missing: Vec<Round> = batch
            .rounds
            .iter()
            .rev()
            .filter_map(|r| match self.store.round_exists(&r.id) {
                Ok(true) => None,
                Ok(false) => Some(Ok(r.clone())),
                Err(e) => Some(Err(e)),
            })
            .collect::<Result<_>>()?;
        report.persisted = self.store.upsert_rounds(&missing)?;

        for pending in self.store.unverified_forecasts()? {
            if let Some(round) = self.store.get_round(&pending.target)? {
                if self.verifier.verify_round(&self.store, &round)?.is_some() {
                    report.verified += 1;
                }
            }
        }
        if report.verified > 0 {
            self.views.on_forecast_verified()?;
        }

        let Some(latest) = self.store.latest_rounds(1)?.into_iter().next() else {
            warn(Domain::System, "reconcile_empty", obj(&[("msg", v_str("no rounds stored yet"))]));
            return Ok(report);
        };
        self.views.on_round_observed(&latest)?;
        report.purged = self.purge_stale(&latest.id)?;
        report.forecast = self.ensure_forecast(&latest)?;
        report.latest = Some(latest.id);

        info(
            Domain::System,
            "reconciled",
            obj(&[
                ("round_id", report.latest.as_ref().map(|id| v_str(id.as_str())).unwrap_or_default()),
                ("fetched", v_int(report.fetched as i64)),
                ("persisted", v_int(report.persisted as i64)),
                ("verified", v_int(report.verified as i64)),
                ("purged", v_int(report.purged as i64)),
                ("generated", serde_json::Value::Bool(report.forecast.is_some())),
            ]),
        );
        Ok(report)
    }

    /// Polls until shutdown. A cycle in flight when shutdown arrives runs
    /// to completion.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures = FailureStreak::new(FAILURE_LOG_EVERY);

        info(
            Domain::Ingest,
            "loop_started",
            obj(&[("poll_ms", v_int(self.poll_interval.as_millis() as i64))]),
        );

        loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info(Domain::Ingest, "loop_stopped", obj(&[]));
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick(&mut failures).await;
                }
            }
        }
    }

    async fn tick(&self, failures: &mut FailureStreak) {
        let scope = ProfileScope::new("tick");
        match self.run_cycle().await {
            Ok(outcome) => {
                let streak = failures.recover();
                if streak > 0 {
                    info(
                        Domain::System,
                        "cycle_recovered",
                        obj(&[("failed_cycles", v_int(streak as i64))]),
                    );
                }
                let round_id = match &outcome {
                    CycleOutcome::Ingested(report) => Some(report.round.id.as_str()),
                    CycleOutcome::Unchanged { latest, .. } => Some(latest.as_str()),
                    CycleOutcome::Empty => None,
                };
                log_cycle(outcome.as_str(), round_id, scope.elapsed_ms());
            }
            Err(err) => {
                if failures.fail() {
                    error(
                        Domain::Ingest,
                        "cycle_failed",
                        obj(&[
                            ("error", v_str(&format!("{:#}", err))),
                            ("consecutive", v_int(failures.consecutive() as i64)),
                        ]),
                    );
                }
            }
        }
    }
}
