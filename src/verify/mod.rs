//! Forecast verification.
//!
//! A forecast is compared slot by slot with the round it targeted. All three
//! slots equal is an exact match; otherwise the number of equal positions
//! decides between partial and none, and the configured threshold decides
//! correctness.

use anyhow::Result;
use chrono::Utc;
use thiserror::Error;

use crate::logging::{log_verification, obj, v_str, warn, Domain};
use crate::model::{Draw, Forecast, MatchType, Outcome, Round, SLOTS};
use crate::store::Store;

pub mod stats;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("forecast for {0} is already verified")]
    AlreadyVerified(String),
    #[error("forecast targets {forecast} but round is {round}")]
    TargetMismatch { forecast: String, round: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub match_type: MatchType,
    pub matched_positions: Vec<usize>,
    pub correct: bool,
}

/// Positional comparison. Numeric closeness is irrelevant.
pub fn classify(predicted: &Draw, actual: &Draw, threshold: usize) -> Classification {
    let (p, a) = (predicted.slots(), actual.slots());
    let matched_positions: Vec<usize> = (0..SLOTS).filter(|&i| p[i] == a[i]).collect();
    let (match_type, correct) = match matched_positions.len() {
        SLOTS => (MatchType::Exact, true),
        0 => (MatchType::None, false),
        n => (MatchType::Partial, n >= threshold),
    };
    Classification { match_type, matched_positions, correct }
}

#[derive(Debug, Clone)]
pub struct Verifier {
    threshold: usize,
}

impl Verifier {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Builds the outcome for a pending forecast. Never re-verifies.
    pub fn verify(&self, forecast: &Forecast, round: &Round) -> Result<Outcome, VerifyError> {
        if !forecast.is_pending() {
            return Err(VerifyError::AlreadyVerified(forecast.target.to_string()));
        }
        if forecast.target != round.id {
            return Err(VerifyError::TargetMismatch {
                forecast: forecast.target.to_string(),
                round: round.id.to_string(),
            });
        }
        let c = classify(&forecast.draw, &round.draw, self.threshold);
        Ok(Outcome {
            actual: round.draw,
            actual_sum: round.sum,
            actual_parity: round.parity,
            correct: c.correct,
            match_type: c.match_type,
            matched_positions: c.matched_positions,
            verified_at: Utc::now(),
        })
    }

    /// Verifies the pending forecast targeting `round`, if there is one.
    /// Returns the outcome that was recorded.
    pub fn verify_round(&self, store: &Store, round: &Round) -> Result<Option<(Forecast, Outcome)>> {
        let Some(mut forecast) = store.pending_forecast(&round.id)? else {
            return Ok(None);
        };
        let outcome = self.verify(&forecast, round)?;
        if !store.record_verification(&round.id, &outcome)? {
            warn(
                Domain::Verify,
                "verification_skipped",
                obj(&[("target_id", v_str(round.id.as_str())), ("reason", v_str("no longer pending"))]),
            );
            return Ok(None);
        }
        log_verification(
            round.id.as_str(),
            &forecast.draw.to_string(),
            &round.draw.to_string(),
            outcome.match_type.as_str(),
            outcome.correct,
        );
        forecast.outcome = Some(outcome.clone());
        Ok(Some((forecast, outcome)))
    }
}
