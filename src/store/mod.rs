//! Durable store for rounds and forecasts, backed by sqlite.
//!
//! Writes are idempotent: a stored round keeps its first observation, a
//! verified forecast is never overwritten, and verification itself is a
//! conditional update that succeeds at most once per target.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::logging::{obj, v_str, warn, Domain};
use crate::model::{Draw, Forecast, MatchType, Outcome, Parity, Round, RoundId};

const OBSERVED_FMT: &str = "%Y-%m-%d %H:%M:%S";

const ROUND_COLUMNS: &str =
    "id, draw, observed_at, observed_raw, created_at, updated_at";

const FORECAST_COLUMNS: &str = "target_id, draw, algorithm, version, created_at, \
     actual_draw, correct, match_type, matched_positions, verified_at";

pub struct Store {
    pool: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl Store {
    pub fn open(path: &str, pool_size: usize, busy_timeout: Duration) -> Result<Self> {
        let mut pool = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let conn = Connection::open(path).with_context(|| format!("opening store at {}", path))?;
            conn.busy_timeout(busy_timeout)?;
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
            pool.push(Mutex::new(conn));
        }
        Ok(Self { pool, next: AtomicUsize::new(0) })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let mut conn = self.pool[idx]
            .lock()
            .map_err(|_| anyhow!("store connection {} poisoned", idx))?;
        f(&mut conn)
    }

    pub fn init(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "BEGIN;
                CREATE TABLE IF NOT EXISTS rounds (
                    id TEXT PRIMARY KEY,
                    num INTEGER NOT NULL,
                    draw TEXT NOT NULL,
                    sum INTEGER NOT NULL,
                    parity TEXT NOT NULL,
                    magnitude TEXT NOT NULL,
                    observed_at TEXT NOT NULL,
                    observed_raw TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_rounds_num ON rounds(num);
                CREATE INDEX IF NOT EXISTS idx_rounds_created ON rounds(created_at);
                CREATE TABLE IF NOT EXISTS forecasts (
                    target_id TEXT PRIMARY KEY,
                    target_num INTEGER NOT NULL,
                    draw TEXT NOT NULL,
                    sum INTEGER NOT NULL,
                    parity TEXT NOT NULL,
                    algorithm TEXT NOT NULL,
                    version TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    actual_draw TEXT,
                    actual_sum INTEGER,
                    actual_parity TEXT,
                    correct INTEGER,
                    match_type TEXT,
                    matched_positions TEXT,
                    verified_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_forecasts_num ON forecasts(target_num);
                CREATE INDEX IF NOT EXISTS idx_forecasts_created ON forecasts(created_at);
                COMMIT;",
            )?;
            Ok(())
        })
    }

    // =========================================================================
    // Rounds
    // =========================================================================

    pub fn round_exists(&self, id: &RoundId) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM rounds WHERE id = ?1", params![id.as_str()], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn get_round(&self, id: &RoundId) -> Result<Option<Round>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM rounds WHERE id = ?1", ROUND_COLUMNS);
            let row = conn
                .query_row(&sql, params![id.as_str()], RoundRow::read)
                .optional()?;
            row.map(RoundRow::into_round).transpose()
        })
    }

    /// Returns true when the round was new. A stored round is never rewritten.
    pub fn upsert_round(&self, round: &Round) -> Result<bool> {
        self.with_conn(|conn| Ok(upsert_round_on(conn, round)? > 0))
    }

    /// Upserts many rounds in one transaction; returns how many were new.
    pub fn upsert_rounds(&self, rounds: &[Round]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut changed = 0;
            for round in rounds {
                changed += upsert_round_on(&tx, round)?;
            }
            tx.commit()?;
            Ok(changed)
        })
    }

    /// Newest first.
    pub fn latest_rounds(&self, n: usize) -> Result<Vec<Round>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM rounds ORDER BY num DESC LIMIT ?1", ROUND_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![n as i64], RoundRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(RoundRow::into_round).collect()
        })
    }

    pub fn latest_round_id(&self) -> Result<Option<RoundId>> {
        self.with_conn(|conn| {
            let id: Option<String> = conn
                .query_row("SELECT id FROM rounds ORDER BY num DESC LIMIT 1", [], |r| r.get(0))
                .optional()?;
            Ok(id.map(|s| RoundId::parse(&s)).transpose()?)
        })
    }

    // =========================================================================
    // Forecasts
    // =========================================================================

    /// Inserts or replaces a pending forecast. A verified row is left alone;
    /// returns false in that case.
    pub fn upsert_forecast(&self, forecast: &Forecast) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT INTO forecasts (target_id, target_num, draw, sum, parity, algorithm, version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(target_id) DO UPDATE SET
                    draw = excluded.draw,
                    sum = excluded.sum,
                    parity = excluded.parity,
                    algorithm = excluded.algorithm,
                    version = excluded.version,
                    created_at = excluded.created_at
                 WHERE forecasts.verified_at IS NULL",
                params![
                    forecast.target.as_str(),
                    forecast.target.value() as i64,
                    forecast.draw.to_string(),
                    forecast.sum as i64,
                    forecast.parity.as_str(),
                    forecast.algorithm,
                    forecast.version,
                    forecast.created_at.timestamp_millis(),
                ],
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_forecast(&self, target: &RoundId) -> Result<Option<Forecast>> {
        self.query_forecast("WHERE target_id = ?1", target)
    }

    pub fn pending_forecast(&self, target: &RoundId) -> Result<Option<Forecast>> {
        self.query_forecast("WHERE target_id = ?1 AND verified_at IS NULL", target)
    }

    fn query_forecast(&self, clause: &str, target: &RoundId) -> Result<Option<Forecast>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM forecasts {}", FORECAST_COLUMNS, clause);
            let row = conn
                .query_row(&sql, params![target.as_str()], ForecastRow::read)
                .optional()?;
            row.map(ForecastRow::into_forecast).transpose()
        })
    }

    fn query_forecasts(&self, clause: &str, limit: Option<usize>) -> Result<Vec<Forecast>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM forecasts {} LIMIT ?1",
                FORECAST_COLUMNS, clause
            );
            let limit = limit.map(|n| n as i64).unwrap_or(-1);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![limit], ForecastRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(ForecastRow::into_forecast).collect()
        })
    }

    /// Oldest target first.
    pub fn unverified_forecasts(&self) -> Result<Vec<Forecast>> {
        self.query_forecasts("WHERE verified_at IS NULL ORDER BY target_num ASC", None)
    }

    /// Newest target first, verified or not.
    pub fn latest_forecasts(&self, n: usize) -> Result<Vec<Forecast>> {
        self.query_forecasts("ORDER BY target_num DESC", Some(n))
    }

    pub fn verified_forecasts(&self) -> Result<Vec<Forecast>> {
        self.query_forecasts("WHERE verified_at IS NOT NULL ORDER BY target_num ASC", None)
    }

    /// The `n` most recently targeted verified forecasts, newest first.
    pub fn recent_outcomes(&self, n: usize) -> Result<Vec<Forecast>> {
        self.query_forecasts("WHERE verified_at IS NOT NULL ORDER BY target_num DESC", Some(n))
    }

    /// Writes every outcome column at once, only if the forecast is still
    /// pending. Returns false when already verified or absent.
    pub fn record_verification(&self, target: &RoundId, outcome: &Outcome) -> Result<bool> {
        let positions = outcome
            .matched_positions
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE forecasts SET
                    actual_draw = ?2,
                    actual_sum = ?3,
                    actual_parity = ?4,
                    correct = ?5,
                    match_type = ?6,
                    matched_positions = ?7,
                    verified_at = ?8
                 WHERE target_id = ?1 AND verified_at IS NULL",
                params![
                    target.as_str(),
                    outcome.actual.to_string(),
                    outcome.actual_sum as i64,
                    outcome.actual_parity.as_str(),
                    outcome.correct,
                    outcome.match_type.as_str(),
                    positions,
                    outcome.verified_at.timestamp_millis(),
                ],
            )?;
            Ok(n == 1)
        })
    }

    /// Drops pending forecasts whose target is older than `latest`; their
    /// round has already gone by unobserved.
    pub fn purge_stale_pending(&self, latest: &RoundId) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM forecasts WHERE verified_at IS NULL AND target_num < ?1",
                params![latest.value() as i64],
            )?)
        })
    }

    /// Retention: returns (rounds, forecasts) deleted.
    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<(usize, usize)> {
        let cutoff = cutoff.timestamp_millis();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let rounds = tx.execute("DELETE FROM rounds WHERE created_at < ?1", params![cutoff])?;
            let forecasts = tx.execute("DELETE FROM forecasts WHERE created_at < ?1", params![cutoff])?;
            tx.commit()?;
            Ok((rounds, forecasts))
        })
    }
}

fn upsert_round_on(conn: &Connection, round: &Round) -> Result<usize> {
    let inserted = conn.execute(
        "INSERT INTO rounds (id, num, draw, sum, parity, magnitude, observed_at, observed_raw, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO NOTHING",
        params![
            round.id.as_str(),
            round.id.value() as i64,
            round.draw.to_string(),
            round.sum as i64,
            round.parity.as_str(),
            round.magnitude.as_str(),
            round.observed_at.format(OBSERVED_FMT).to_string(),
            round.observed_raw,
            round.created_at.timestamp_millis(),
            round.updated_at.timestamp_millis(),
        ],
    )?;
    if inserted == 0 {
        let stored: String = conn.query_row(
            "SELECT draw FROM rounds WHERE id = ?1",
            params![round.id.as_str()],
            |r| r.get(0),
        )?;
        let observed = round.draw.to_string();
        if stored != observed {
            warn(
                Domain::Store,
                "round_conflict",
                obj(&[
                    ("round_id", v_str(round.id.as_str())),
                    ("stored", v_str(&stored)),
                    ("observed", v_str(&observed)),
                ]),
            );
        }
    }
    Ok(inserted)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("bad timestamp {}", ms))
}

struct RoundRow {
    id: String,
    draw: String,
    observed_at: String,
    observed_raw: String,
    created_at: i64,
    updated_at: i64,
}

impl RoundRow {
    fn read(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            draw: r.get(1)?,
            observed_at: r.get(2)?,
            observed_raw: r.get(3)?,
            created_at: r.get(4)?,
            updated_at: r.get(5)?,
        })
    }

    fn into_round(self) -> Result<Round> {
        let observed_at = NaiveDateTime::parse_from_str(&self.observed_at, OBSERVED_FMT)?;
        let mut round = Round::new(
            RoundId::parse(&self.id)?,
            Draw::parse(&self.draw)?,
            observed_at,
            self.observed_raw,
        );
        round.created_at = from_millis(self.created_at)?;
        round.updated_at = from_millis(self.updated_at)?;
        Ok(round)
    }
}

struct ForecastRow {
    target_id: String,
    draw: String,
    algorithm: String,
    version: String,
    created_at: i64,
    actual_draw: Option<String>,
    correct: Option<bool>,
    match_type: Option<String>,
    matched_positions: Option<String>,
    verified_at: Option<i64>,
}

impl ForecastRow {
    fn read(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            target_id: r.get(0)?,
            draw: r.get(1)?,
            algorithm: r.get(2)?,
            version: r.get(3)?,
            created_at: r.get(4)?,
            actual_draw: r.get(5)?,
            correct: r.get(6)?,
            match_type: r.get(7)?,
            matched_positions: r.get(8)?,
            verified_at: r.get(9)?,
        })
    }

    fn into_forecast(self) -> Result<Forecast> {
        let mut forecast = Forecast::new(
            RoundId::parse(&self.target_id)?,
            Draw::parse(&self.draw)?,
            &self.algorithm,
            &self.version,
        );
        forecast.created_at = from_millis(self.created_at)?;

        if let (Some(actual), Some(verified_at)) = (self.actual_draw, self.verified_at) {
            let actual = Draw::parse(&actual)?;
            let match_type = self
                .match_type
                .as_deref()
                .and_then(MatchType::from_label)
                .ok_or_else(|| anyhow!("forecast {} has no match type", self.target_id))?;
            let matched_positions = self
                .matched_positions
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<usize>())
                .collect::<Result<Vec<_>, _>>()?;
            forecast.outcome = Some(Outcome {
                actual_sum: actual.sum(),
                actual_parity: Parity::of(actual.sum()),
                actual,
                correct: self.correct.unwrap_or(false),
                match_type,
                matched_positions,
                verified_at: from_millis(verified_at)?,
            });
        }
        Ok(forecast)
    }
}
