//! Component health for the running service.
//!
//! A report probes the round source once, reads the latest stored round and
//! snapshots cache occupancy. Any failing component marks the whole report
//! degraded; the service keeps running either way.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::cache::{CacheLayer, CacheStats};
use crate::ingest::Orchestrator;
use crate::logging::{info, obj, v_int, v_str, warn, Domain};
use crate::model::RoundId;
use crate::notify::Publisher;
use crate::source::RoundSource;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub response_time_ms: Option<i64>,
}

impl ComponentHealth {
    pub fn ok(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Ok,
            message: None,
            response_time_ms: None,
        }
    }

    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            response_time_ms: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_response_time(mut self, ms: i64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub cache: CacheStats,
    pub latest_round: Option<RoundId>,
}

impl HealthReport {
    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.component == name)
    }
}

pub async fn check(
    source: &dyn RoundSource,
    store: &Store,
    cache: &CacheLayer,
    publisher: &dyn Publisher,
) -> HealthReport {
    let mut components = Vec::with_capacity(4);

    let started = Instant::now();
    let probe = source.probe().await;
    let elapsed = started.elapsed().as_millis() as i64;
    let source_health = match probe {
        Ok(()) => ComponentHealth::ok("source"),
        Err(err) => ComponentHealth::degraded("source", format!("{:#}", err)),
    };
    components.push(source_health.with_response_time(elapsed));

    let latest_round = match store.latest_round_id() {
        Ok(latest) => {
            components.push(ComponentHealth::ok("store"));
            latest
        }
        Err(err) => {
            components.push(ComponentHealth::degraded("store", format!("{:#}", err)));
            None
        }
    };

    let stats = cache.stats();
    components.push(
        ComponentHealth::ok("cache").with_message(format!("{}/{} entries live", stats.valid, stats.max_entries)),
    );
    components.push(ComponentHealth::ok("publisher").with_message(publisher.kind()));

    let status = if components.iter().all(|c| c.status == HealthStatus::Ok) {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    };
    HealthReport { checked_at: Utc::now(), status, components, cache: stats, latest_round }
}

pub fn log_report(report: &HealthReport) {
    let mut fields = vec![
        ("status", v_str(report.status.as_str())),
        ("cache_valid", v_int(report.cache.valid as i64)),
        ("cache_total", v_int(report.cache.total as i64)),
    ];
    if let Some(id) = &report.latest_round {
        fields.push(("round_id", v_str(id.as_str())));
    }
    let failing: Vec<String> = report
        .components
        .iter()
        .filter(|c| c.status == HealthStatus::Degraded)
        .map(|c| format!("{}: {}", c.component, c.message.as_deref().unwrap_or("")))
        .collect();

    if failing.is_empty() {
        info(Domain::System, "health", obj(&fields));
    } else {
        fields.push(("failing", v_str(&failing.join("; "))));
        warn(Domain::System, "health", obj(&fields));
    }
}

/// Logs a health report every `every` until shutdown.
pub async fn run(orchestrator: Arc<Orchestrator>, every: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                log_report(&orchestrator.health().await);
            }
        }
    }
}
