use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDateTime};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;

use crate::logging::{obj, v_int, v_str, warn, Domain};
use crate::model::{Draw, ParseError, Round, RoundId};

mod http;
pub mod retry;

pub use http::HttpSource;

const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// One entry as published by the source. Every field is untrusted.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRound {
    #[serde(alias = "qihao", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(alias = "opentime")]
    pub observed: String,
    #[serde(alias = "opennum")]
    pub draw: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub sum: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub data: Vec<RawRound>,
    #[serde(default)]
    pub message: String,
}

impl ApiEnvelope {
    pub fn into_rounds(self) -> Result<Vec<RawRound>> {
        if self.message != "success" {
            bail!("source reported failure: {:?}", self.message);
        }
        Ok(self.data)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Str(s) => s,
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(f) => f.to_string(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Scalar::deserialize(d)?.into_string())
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(Scalar::into_string))
}

/// Parses `MM-DD HH:MM:SS` in the year of `now`. A result more than a day
/// ahead of `now` is a round from late last year.
pub fn parse_observed(raw: &str, now: NaiveDateTime) -> Result<NaiveDateTime, ParseError> {
    let raw = raw.trim();
    if let Ok(full) = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FMT) {
        return Ok(full);
    }
    let with_year = |year: i32| NaiveDateTime::parse_from_str(&format!("{}-{}", year, raw), TIMESTAMP_FMT);
    let year = now.year();
    let parsed = with_year(year).map_err(|_| ParseError::InvalidTimestamp(raw.to_string()))?;
    if parsed > now + Duration::days(1) {
        return with_year(year - 1).map_err(|_| ParseError::InvalidTimestamp(raw.to_string()));
    }
    Ok(parsed)
}

/// Validates one raw entry. The stored sum is always recomputed from the
/// draw; the published one is only compared against it.
pub fn parse_raw(raw: &RawRound, now: NaiveDateTime) -> Result<Round, ParseError> {
    let id = RoundId::parse(&raw.id)?;
    let draw = Draw::parse(&raw.draw)?;
    let observed_at = parse_observed(&raw.observed, now)?;
    let round = Round::new(id, draw, observed_at, raw.observed.clone());

    if let Some(hint) = raw.sum.as_deref() {
        match hint.trim().parse::<u32>() {
            Ok(reported) if reported == round.sum => {}
            Ok(reported) => warn(
                Domain::Source,
                "sum_mismatch",
                obj(&[
                    ("round_id", v_str(round.id.as_str())),
                    ("draw", v_str(&raw.draw)),
                    ("reported", v_int(reported as i64)),
                    ("computed", v_int(round.sum as i64)),
                ]),
            ),
            Err(_) => warn(
                Domain::Source,
                "sum_unparseable",
                obj(&[("round_id", v_str(round.id.as_str())), ("reported", v_str(hint))]),
            ),
        }
    }
    Ok(round)
}

/// A validated fetch: accepted rounds newest first, plus rejected entries.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub rounds: Vec<Round>,
    pub rejected: Vec<(String, ParseError)>,
}

impl SourceBatch {
    pub fn from_raw(raw: &[RawRound], now: NaiveDateTime) -> Self {
        let mut batch = SourceBatch::default();
        let mut seen = HashSet::new();
        for entry in raw {
            match parse_raw(entry, now) {
                Ok(round) => {
                    if seen.insert(round.id.clone()) {
                        batch.rounds.push(round);
                    }
                }
                Err(err) => {
                    warn(
                        Domain::Source,
                        "entry_rejected",
                        obj(&[
                            ("round_id", v_str(&entry.id)),
                            ("draw", v_str(&entry.draw)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                    batch.rejected.push((entry.id.clone(), err));
                }
            }
        }
        batch.rounds.sort_by(|a, b| b.id.cmp(&a.id));
        batch
    }

    pub fn newest(&self) -> Option<&Round> {
        self.rounds.first()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}

/// The external feed of rounds. Polled, never pushed.
#[async_trait]
pub trait RoundSource: Send + Sync {
    async fn fetch_recent(&self, limit: usize) -> Result<SourceBatch>;

    /// Reachability check for health reports.
    async fn probe(&self) -> Result<()> {
        self.fetch_recent(1).await.map(|_| ())
    }
}

/// Clock used for year inference, in source-local time.
pub fn source_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}
