//! Prints the service's read views from an existing store.
//!
//! Usage:
//!   forecast_report [history_len] [--json] [--health]
//!
//! Reads go through the same read-through cache the service uses, so the
//! output matches what clients of the running service see. `--health` also
//! probes the configured round source once.

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use roundwatch::cache::{CacheLayer, ViewCache};
use roundwatch::config::Config;
use roundwatch::health;
use roundwatch::notify::publisher_from_config;
use roundwatch::source::HttpSource;
use roundwatch::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let as_json = args.iter().any(|a| a == "--json");
    let with_health = args.iter().any(|a| a == "--health");
    let history_len = args
        .iter()
        .find_map(|a| a.parse::<usize>().ok())
        .unwrap_or(10);

    let cfg = Config::from_env();
    let store = Arc::new(Store::open(
        &cfg.sqlite_path,
        1,
        Duration::from_millis(cfg.store_busy_timeout_ms),
    )?);
    store.init()?;
    let cache = Arc::new(CacheLayer::new(cfg.cache_max_entries, cfg.cache_ttl()));
    let views = ViewCache::new(cache.clone(), store.clone(), cfg.trend_sample, cfg.trend_window);

    let latest = views.latest_round()?;
    let forecasts = views.forecast_history(history_len)?;
    let accuracy = views.accuracy_stats()?;
    let trend = views.trend_report()?;
    let daily = views.daily_report()?;
    let health_report = if with_health {
        let source = HttpSource::new(&cfg)?;
        let publisher = publisher_from_config(&cfg)?;
        Some(health::check(&source, &store, &cache, publisher.as_ref()).await)
    } else {
        None
    };

    if as_json {
        let report = json!({
            "latest_round": latest,
            "forecasts": forecasts,
            "accuracy": accuracy,
            "trend": trend,
            "daily": daily,
            "health": health_report,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== Latest round ===");
    match &latest {
        Some(r) => println!(
            "{}  {} = {}  {} {}  at {}",
            r.id,
            r.draw,
            r.sum,
            r.parity.as_str(),
            r.magnitude.as_str(),
            r.observed_at
        ),
        None => println!("(none)"),
    }

    println!("\n=== Forecasts (newest first) ===");
    for f in &forecasts {
        let result = match &f.outcome {
            Some(o) => format!(
                "actual {} ({}, {})",
                o.actual,
                o.match_type.as_str(),
                if o.correct { "correct" } else { "incorrect" }
            ),
            None => "pending".to_string(),
        };
        println!("{}  {} = {}  [{} {}]  {}", f.target, f.draw, f.sum, f.algorithm, f.version, result);
    }

    println!("\n=== Accuracy ===");
    println!(
        "{} / {} correct ({:.2})  exact={} partial={} none={}",
        accuracy.correct, accuracy.total, accuracy.accuracy, accuracy.exact, accuracy.partial, accuracy.none
    );

    println!("\n=== Trend (window {}, {} outcomes) ===", trend.window, trend.sample_size);
    println!("{}  {:?}", trend.direction.as_str(), trend.series);

    println!("\n=== Daily ===");
    for day in &daily {
        println!("{}  {}/{}  ({:.2})", day.date, day.correct, day.total, day.accuracy);
    }

    if let Some(report) = &health_report {
        println!("\n=== Health: {} ===", report.status.as_str());
        for c in &report.components {
            println!(
                "{:<10} {:<9} {}",
                c.component,
                c.status.as_str(),
                c.message.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}
