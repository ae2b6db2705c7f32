//! Domain records shared by the store, cache and orchestrator.
//!
//! A `Round` is immutable once observed. A `Forecast` is created before its
//! target round exists and gains an `Outcome` exactly once.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Sums at or above this are "big".
pub const BIG_THRESHOLD: u32 = 14;
pub const SLOTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid round id {0:?}")]
    InvalidId(String),
    #[error("draw should have 3 slots, got {0}")]
    WrongSlotCount(usize),
    #[error("non-numeric value {value:?} in slot {slot}")]
    NonNumericSlot { slot: usize, value: String },
    #[error("slot {slot} out of range 0-9: {value}")]
    SlotOutOfRange { slot: usize, value: i64 },
    #[error("unparseable timestamp {0:?}")]
    InvalidTimestamp(String),
}

// =============================================================================
// Identifiers
// =============================================================================

/// Fixed-width numeric round identifier, ordered by numeric value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoundId {
    raw: String,
    value: u64,
}

impl RoundId {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let raw = raw.trim();
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidId(raw.to_string()));
        }
        let value = raw
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidId(raw.to_string()))?;
        Ok(Self { raw: raw.to_string(), value })
    }

    pub fn from_value(value: u64, width: usize) -> Self {
        Self { raw: format!("{:0width$}", value, width = width), value }
    }

    /// The identifier the source will publish after this one.
    pub fn next(&self) -> Self {
        Self::from_value(self.value + 1, self.raw.len())
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Ord for RoundId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl PartialOrd for RoundId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for RoundId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoundId> for String {
    fn from(id: RoundId) -> Self {
        id.raw
    }
}

// =============================================================================
// Draws and derived classes
// =============================================================================

/// Three positional slots, each 0-9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Draw([u8; SLOTS]);

impl Draw {
    pub fn new(slots: [u8; SLOTS]) -> Result<Self, ParseError> {
        for (slot, v) in slots.iter().enumerate() {
            if *v > 9 {
                return Err(ParseError::SlotOutOfRange { slot, value: *v as i64 });
            }
        }
        Ok(Self(slots))
    }

    /// Parses `a+b+c`.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = raw.split('+').collect();
        if parts.len() != SLOTS {
            return Err(ParseError::WrongSlotCount(parts.len()));
        }
        let mut slots = [0u8; SLOTS];
        for (slot, part) in parts.iter().enumerate() {
            let part = part.trim();
            let value: i64 = part.parse().map_err(|_| ParseError::NonNumericSlot {
                slot,
                value: part.to_string(),
            })?;
            if !(0..=9).contains(&value) {
                return Err(ParseError::SlotOutOfRange { slot, value });
            }
            slots[slot] = value as u8;
        }
        Ok(Self(slots))
    }

    pub fn slots(&self) -> [u8; SLOTS] {
        self.0
    }

    pub fn sum(&self) -> u32 {
        self.0.iter().map(|v| *v as u32).sum()
    }
}

impl fmt::Display for Draw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}+{}", self.0[0], self.0[1], self.0[2])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    Odd,
    Even,
}

impl Parity {
    pub fn of(sum: u32) -> Self {
        if sum % 2 == 0 {
            Parity::Even
        } else {
            Parity::Odd
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Parity::Odd => "odd",
            Parity::Even => "even",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Magnitude {
    Big,
    Small,
}

impl Magnitude {
    pub fn of(sum: u32) -> Self {
        if sum >= BIG_THRESHOLD {
            Magnitude::Big
        } else {
            Magnitude::Small
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Magnitude::Big => "big",
            Magnitude::Small => "small",
        }
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub draw: Draw,
    pub sum: u32,
    pub parity: Parity,
    pub magnitude: Magnitude,
    /// Source-local observation time (the source publishes no zone)
    pub observed_at: NaiveDateTime,
    pub observed_raw: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Round {
    /// Derived fields always come from the draw itself.
    pub fn new(id: RoundId, draw: Draw, observed_at: NaiveDateTime, observed_raw: String) -> Self {
        let sum = draw.sum();
        let now = Utc::now();
        Self {
            id,
            draw,
            sum,
            parity: Parity::of(sum),
            magnitude: Magnitude::of(sum),
            observed_at,
            observed_raw,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Partial,
    None,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Partial => "partial",
            MatchType::None => "none",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(MatchType::Exact),
            "partial" => Some(MatchType::Partial),
            "none" => Some(MatchType::None),
            _ => None,
        }
    }
}

/// Verification result written onto a forecast once its target is observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub actual: Draw,
    pub actual_sum: u32,
    pub actual_parity: Parity,
    pub correct: bool,
    pub match_type: MatchType,
    pub matched_positions: Vec<usize>,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub target: RoundId,
    pub draw: Draw,
    pub sum: u32,
    pub parity: Parity,
    pub algorithm: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub outcome: Option<Outcome>,
}

impl Forecast {
    pub fn new(target: RoundId, draw: Draw, algorithm: &str, version: &str) -> Self {
        let sum = draw.sum();
        Self {
            target,
            draw,
            sum,
            parity: Parity::of(sum),
            algorithm: algorithm.to_string(),
            version: version.to_string(),
            created_at: Utc::now(),
            outcome: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn is_correct(&self) -> Option<bool> {
        self.outcome.as_ref().map(|o| o.correct)
    }
}
