use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;

use roundwatch::cache::{CacheLayer, ViewCache};
use roundwatch::config::Config;
use roundwatch::forecast::ForecasterRegistry;
use roundwatch::health;
use roundwatch::ingest::{retention, Orchestrator};
use roundwatch::logging::{error, info, obj, v_int, v_str, Domain};
use roundwatch::notify::publisher_from_config;
use roundwatch::source::HttpSource;
use roundwatch::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    if let Err(err) = cfg.validate() {
        error(Domain::System, "invalid_config", obj(&[("error", v_str(&err.to_string()))]));
        return Err(err);
    }

    let store = Arc::new(Store::open(
        &cfg.sqlite_path,
        cfg.store_pool_size,
        std::time::Duration::from_millis(cfg.store_busy_timeout_ms),
    )?);
    store.init()?;

    let cache = Arc::new(CacheLayer::new(cfg.cache_max_entries, cfg.cache_ttl()));
    let views = Arc::new(ViewCache::new(cache.clone(), store.clone(), cfg.trend_sample, cfg.trend_window));

    let mut registry = ForecasterRegistry::with_defaults();
    registry.select(&cfg.forecast_algorithm)?;

    let source = Arc::new(HttpSource::new(&cfg)?);
    let publisher = publisher_from_config(&cfg)?;

    info(
        Domain::System,
        "startup",
        obj(&[
            ("source", v_str(&cfg.source_url)),
            ("store", v_str(&cfg.sqlite_path)),
            ("algorithm", v_str(&cfg.forecast_algorithm)),
            ("poll_secs", v_int(cfg.poll_secs as i64)),
            ("match_threshold", v_int(cfg.match_threshold as i64)),
        ]),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        &cfg,
        source,
        store.clone(),
        views,
        registry.current(),
        publisher,
    ));
    orchestrator.reconcile_startup().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ingest_task = {
        let orchestrator = orchestrator.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { orchestrator.run(rx).await })
    };
    let retention_task = tokio::spawn(retention::run(
        store.clone(),
        cfg.retention(),
        cfg.cleanup_interval(),
        shutdown_rx.clone(),
    ));
    let sweeper_task = tokio::spawn(cache.clone().run_sweeper(cfg.cache_sweep_interval(), shutdown_rx.clone()));
    let health_task = tokio::spawn(health::run(orchestrator.clone(), cfg.health_interval(), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info(Domain::System, "shutdown_requested", obj(&[]));
    let _ = shutdown_tx.send(true);

    let tasks = [
        ("ingest", ingest_task),
        ("retention", retention_task),
        ("cache_sweeper", sweeper_task),
        ("health", health_task),
    ];
    for (name, task) in tasks {
        if let Err(err) = task.await {
            error(Domain::System, "task_join_failed", obj(&[("task", v_str(name)), ("error", v_str(&err.to_string()))]));
        }
    }

    drop(orchestrator);
    drop(store);
    info(Domain::System, "shutdown_complete", obj(&[]));
    Ok(())
}
