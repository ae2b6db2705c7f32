use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheLayer, TypedKey};
use crate::logging::{obj, v_str, warn, Domain};
use crate::model::{Forecast, Round};
use crate::store::Store;
use crate::verify::stats::{daily_breakdown, AccuracyStats, DailyAccuracy, TrendReport};

/// Windows repopulated eagerly whenever a round lands.
pub const HOT_WINDOWS: [usize; 2] = [3, 10];
/// Forecast history length repopulated after each new forecast.
pub const FORECAST_HISTORY: usize = 10;

pub mod keys {
    use super::TypedKey;
    use crate::model::{Forecast, Round};

    pub const ROUND_LATEST: &str = "round:latest";
    pub const ROUND_FAMILY: &str = "round:*";
    pub const FORECAST_LATEST: &str = "forecast:latest";
    pub const FORECAST_FAMILY: &str = "forecast:*";
    pub const STATS_ACCURACY: &str = "stats:accuracy";
    pub const STATS_TREND: &str = "stats:trend";
    pub const STATS_DAILY: &str = "stats:daily";
    pub const STATS_FAMILY: &str = "stats:*";

    pub fn round_latest() -> TypedKey<Round> {
        TypedKey::new(ROUND_LATEST)
    }

    pub fn forecast_latest() -> TypedKey<Forecast> {
        TypedKey::new(FORECAST_LATEST)
    }

    pub fn round_window(n: usize) -> String {
        format!("round:window:{}", n)
    }

    pub fn round_history(n: usize) -> String {
        format!("round:history:{}", n)
    }

    pub fn forecast_history(n: usize) -> String {
        format!("forecast:history:{}", n)
    }
}

/// Read-through views over the store. Every read tries the cache first and
/// repopulates it from the store on a miss; the `on_*` hooks are called by
/// the writer after each durable change.
pub struct ViewCache {
    cache: Arc<CacheLayer>,
    store: Arc<Store>,
    trend_sample: usize,
    trend_window: usize,
}

impl ViewCache {
    pub fn new(cache: Arc<CacheLayer>, store: Arc<Store>, trend_sample: usize, trend_window: usize) -> Self {
        Self { cache, store, trend_sample, trend_window }
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    fn read_through<T, F>(&self, key: &str, load: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&Store) -> Result<T>,
    {
        if let Some(hit) = self.cache.get::<T>(key) {
            return Ok(hit);
        }
        let value = load(&self.store)?;
        self.put(key, &value);
        Ok(value)
    }

    /// A failed cache write only costs a store read later.
    fn put<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(err) = self.cache.set(key, value, Duration::ZERO) {
            warn(Domain::Cache, "set_failed", obj(&[("key", v_str(key)), ("error", v_str(&err.to_string()))]));
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn latest_round(&self) -> Result<Option<Round>> {
        let key = keys::round_latest();
        if let Some(hit) = self.cache.get_typed(&key) {
            return Ok(Some(hit));
        }
        let latest = self.store.latest_rounds(1)?.into_iter().next();
        if let Some(round) = &latest {
            self.put(key.as_str(), round);
        }
        Ok(latest)
    }

    /// Newest first; the window forecasters read.
    pub fn latest_rounds(&self, n: usize) -> Result<Vec<Round>> {
        self.read_through(&keys::round_window(n), |store| store.latest_rounds(n))
    }

    /// Newest first; populated lazily for display.
    pub fn round_history(&self, n: usize) -> Result<Vec<Round>> {
        self.read_through(&keys::round_history(n), |store| store.latest_rounds(n))
    }

    pub fn latest_forecast(&self) -> Result<Option<Forecast>> {
        let key = keys::forecast_latest();
        if let Some(hit) = self.cache.get_typed(&key) {
            return Ok(Some(hit));
        }
        let latest = self.store.latest_forecasts(1)?.into_iter().next();
        if let Some(forecast) = &latest {
            self.put(key.as_str(), forecast);
        }
        Ok(latest)
    }

    pub fn forecast_history(&self, n: usize) -> Result<Vec<Forecast>> {
        self.read_through(&keys::forecast_history(n), |store| store.latest_forecasts(n))
    }

    pub fn accuracy_stats(&self) -> Result<AccuracyStats> {
        self.read_through(keys::STATS_ACCURACY, |store| {
            Ok(AccuracyStats::from_forecasts(&store.verified_forecasts()?))
        })
    }

    pub fn trend_report(&self) -> Result<TrendReport> {
        let (sample, window) = (self.trend_sample, self.trend_window);
        self.read_through(keys::STATS_TREND, |store| {
            Ok(TrendReport::from_outcomes(&store.recent_outcomes(sample)?, window))
        })
    }

    pub fn daily_report(&self) -> Result<Vec<DailyAccuracy>> {
        self.read_through(keys::STATS_DAILY, |store| Ok(daily_breakdown(&store.verified_forecasts()?)))
    }

    // =========================================================================
    // Write hooks
    // =========================================================================

    /// After a round is persisted: drop every round view and refill the hot ones.
    pub fn on_round_observed(&self, round: &Round) -> Result<()> {
        self.cache.invalidate_by_prefix(keys::ROUND_FAMILY);
        self.put(keys::ROUND_LATEST, round);
        for n in HOT_WINDOWS {
            self.put(&keys::round_window(n), &self.store.latest_rounds(n)?);
        }
        Ok(())
    }

    /// After an outcome is recorded: forecast views now carry stale outcomes
    /// and every statistic has moved.
    pub fn on_forecast_verified(&self) -> Result<()> {
        self.cache.invalidate_by_prefix(keys::STATS_FAMILY);
        self.cache.invalidate_by_prefix(keys::FORECAST_FAMILY);
        self.put(keys::STATS_ACCURACY, &AccuracyStats::from_forecasts(&self.store.verified_forecasts()?));
        Ok(())
    }

    /// After pending forecasts are deleted.
    pub fn on_forecasts_purged(&self) {
        self.cache.invalidate_by_prefix(keys::FORECAST_FAMILY);
        self.cache.invalidate_by_prefix(keys::STATS_FAMILY);
    }

    /// After a new forecast is persisted.
    pub fn on_forecast_generated(&self, forecast: &Forecast) -> Result<()> {
        self.cache.invalidate_by_prefix(keys::FORECAST_FAMILY);
        self.cache.invalidate_by_prefix(keys::STATS_FAMILY);
        self.put(keys::FORECAST_LATEST, forecast);
        self.put(
            &keys::forecast_history(FORECAST_HISTORY),
            &self.store.latest_forecasts(FORECAST_HISTORY)?,
        );
        Ok(())
    }
}
