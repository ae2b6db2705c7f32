use anyhow::{bail, Result};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub source_url: String,
    pub source_timeout_ms: u64,
    pub source_retry_count: u32,
    pub source_retry_delay_ms: u64,
    pub source_retry_max_delay_ms: u64,
    pub fetch_window: usize,
    pub startup_window: usize,
    pub poll_secs: u64,
    pub retention_hours: u64,
    pub cleanup_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub cache_sweep_secs: u64,
    pub health_secs: u64,
    pub sqlite_path: String,
    pub store_pool_size: usize,
    pub store_busy_timeout_ms: u64,
    pub forecast_algorithm: String,
    /// Positions that must match for a forecast to count as correct
    pub match_threshold: usize,
    pub trend_sample: usize,
    pub trend_window: usize,
    pub notify_url: Option<String>,
    pub notify_destinations: Vec<String>,
    pub notify_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_url: "http://127.0.0.1:8080/api/rounds".to_string(),
            source_timeout_ms: 5_000,
            source_retry_count: 3,
            source_retry_delay_ms: 500,
            source_retry_max_delay_ms: 5_000,
            fetch_window: 10,
            startup_window: 50,
            poll_secs: 10,
            retention_hours: 24,
            cleanup_secs: 3_600,
            cache_ttl_secs: 300,
            cache_max_entries: 1_000,
            cache_sweep_secs: 300,
            health_secs: 300,
            sqlite_path: "./roundwatch.sqlite".to_string(),
            store_pool_size: 4,
            store_busy_timeout_ms: 5_000,
            forecast_algorithm: "default".to_string(),
            match_threshold: 2,
            trend_sample: 50,
            trend_window: 10,
            notify_url: None,
            notify_destinations: Vec::new(),
            notify_timeout_ms: 5_000,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            source_url: std::env::var("SOURCE_URL").unwrap_or(d.source_url),
            source_timeout_ms: env_or("SOURCE_TIMEOUT_MS", d.source_timeout_ms),
            source_retry_count: env_or("SOURCE_RETRY_COUNT", d.source_retry_count),
            source_retry_delay_ms: env_or("SOURCE_RETRY_DELAY_MS", d.source_retry_delay_ms),
            source_retry_max_delay_ms: env_or("SOURCE_RETRY_MAX_DELAY_MS", d.source_retry_max_delay_ms),
            fetch_window: env_or("FETCH_WINDOW", d.fetch_window),
            startup_window: env_or("STARTUP_WINDOW", d.startup_window),
            poll_secs: env_or("POLL_SECS", d.poll_secs),
            retention_hours: env_or("RETENTION_HOURS", d.retention_hours),
            cleanup_secs: env_or("CLEANUP_SECS", d.cleanup_secs),
            cache_ttl_secs: env_or("CACHE_TTL_SECS", d.cache_ttl_secs),
            cache_max_entries: env_or("CACHE_MAX_ENTRIES", d.cache_max_entries),
            cache_sweep_secs: env_or("CACHE_SWEEP_SECS", d.cache_sweep_secs),
            health_secs: env_or("HEALTH_SECS", d.health_secs),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            store_pool_size: env_or("STORE_POOL_SIZE", d.store_pool_size),
            store_busy_timeout_ms: env_or("STORE_BUSY_TIMEOUT_MS", d.store_busy_timeout_ms),
            forecast_algorithm: std::env::var("FORECAST_ALGORITHM").unwrap_or(d.forecast_algorithm),
            match_threshold: env_or("MATCH_THRESHOLD", d.match_threshold),
            trend_sample: env_or("TREND_SAMPLE", d.trend_sample),
            trend_window: env_or("TREND_WINDOW", d.trend_window),
            notify_url: std::env::var("NOTIFY_URL").ok().filter(|v| !v.trim().is_empty()),
            notify_destinations: std::env::var("NOTIFY_DESTINATIONS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            notify_timeout_ms: env_or("NOTIFY_TIMEOUT_MS", d.notify_timeout_ms),
        }
    }

    /// Rejects settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_secs == 0 {
            bail!("POLL_SECS must be > 0");
        }
        if self.source_timeout_ms >= self.poll_secs * 1000 {
            bail!(
                "SOURCE_TIMEOUT_MS ({}) must be shorter than the polling interval ({}s)",
                self.source_timeout_ms,
                self.poll_secs
            );
        }
        if self.fetch_window == 0 || self.startup_window < self.fetch_window {
            bail!("FETCH_WINDOW must be > 0 and STARTUP_WINDOW >= FETCH_WINDOW");
        }
        if self.cache_max_entries == 0 || self.cache_ttl_secs == 0 || self.cache_sweep_secs == 0 {
            bail!("cache capacity, TTL and sweep interval must all be > 0");
        }
        if self.store_pool_size == 0 || self.store_pool_size > 32 {
            bail!("STORE_POOL_SIZE must be within 1..=32, got {}", self.store_pool_size);
        }
        if !(1..=3).contains(&self.match_threshold) {
            bail!("MATCH_THRESHOLD must be within 1..=3, got {}", self.match_threshold);
        }
        if self.trend_window == 0 || self.trend_sample < self.trend_window {
            bail!("TREND_WINDOW must be > 0 and TREND_SAMPLE >= TREND_WINDOW");
        }
        if self.retention_hours == 0 || self.cleanup_secs == 0 {
            bail!("RETENTION_HOURS and CLEANUP_SECS must be > 0");
        }
        if self.health_secs == 0 {
            bail!("HEALTH_SECS must be > 0");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
