//! Forecasting algorithms behind a common capability trait.
//!
//! The orchestrator depends only on [`Forecaster`]; the active
//! implementation is chosen by name from a [`ForecasterRegistry`].

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::model::{Draw, Forecast, Round};

mod algorithms;

pub use algorithms::{ParityHeuristic, RepeatLast};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForecastError {
    #[error("insufficient history: need {need}, got {got}")]
    InsufficientHistory { need: usize, got: usize },
    #[error("invalid history: {0}")]
    InvalidInput(String),
    #[error("unknown forecasting algorithm {0:?}")]
    UnknownAlgorithm(String),
}

pub trait Forecaster: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str;

    /// Rounds `predict` needs, newest first.
    fn required_history(&self) -> usize;

    /// History must be newest first, long enough, and strictly descending.
    fn validate_input(&self, history: &[Round]) -> Result<(), ForecastError> {
        let need = self.required_history();
        if history.len() < need {
            return Err(ForecastError::InsufficientHistory { need, got: history.len() });
        }
        for pair in history[..need].windows(2) {
            if pair[0].id <= pair[1].id {
                return Err(ForecastError::InvalidInput(format!(
                    "rounds out of order: {} before {}",
                    pair[0].id, pair[1].id
                )));
            }
        }
        Ok(())
    }

    fn predict(&self, history: &[Round]) -> Result<Draw, ForecastError>;
}

/// Builds the forecast for the round after `history[0]`.
pub fn forecast_next(forecaster: &dyn Forecaster, history: &[Round]) -> Result<Forecast, ForecastError> {
    forecaster.validate_input(history)?;
    let latest = &history[0];
    let draw = forecaster.predict(history)?;
    Ok(Forecast::new(latest.id.next(), draw, forecaster.name(), forecaster.version()))
}

pub struct ForecasterRegistry {
    algorithms: BTreeMap<&'static str, Arc<dyn Forecaster>>,
    current: Arc<dyn Forecaster>,
}

impl ForecasterRegistry {
    pub fn new(initial: Arc<dyn Forecaster>) -> Self {
        let mut algorithms = BTreeMap::new();
        algorithms.insert(initial.name(), initial.clone());
        Self { algorithms, current: initial }
    }

    /// Every built-in algorithm, with `default` selected.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new(Arc::new(ParityHeuristic));
        registry.register(Arc::new(RepeatLast));
        registry
    }

    pub fn register(&mut self, forecaster: Arc<dyn Forecaster>) {
        self.algorithms.insert(forecaster.name(), forecaster);
    }

    pub fn select(&mut self, name: &str) -> Result<(), ForecastError> {
        let chosen = self
            .algorithms
            .get(name)
            .ok_or_else(|| ForecastError::UnknownAlgorithm(name.to_string()))?;
        self.current = chosen.clone();
        Ok(())
    }

    pub fn current(&self) -> Arc<dyn Forecaster> {
        self.current.clone()
    }

    pub fn available(&self) -> Vec<&'static str> {
        self.algorithms.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RoundId;
    use chrono::NaiveDateTime;

    struct Fixed;

    impl Forecaster for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn version(&self) -> &'static str {
            "test"
        }
        fn required_history(&self) -> usize {
            1
        }
        fn predict(&self, _history: &[Round]) -> Result<Draw, ForecastError> {
            Ok(Draw::parse("9+9+9").unwrap())
        }
    }

    fn round(id: &str) -> Round {
        let observed = NaiveDateTime::parse_from_str("2026-08-23 01:16:00", "%Y-%m-%d %H:%M:%S").unwrap();
        Round::new(RoundId::parse(id).unwrap(), Draw::parse("1+2+3").unwrap(), observed, "08-23 01:16:00".into())
    }

    #[test]
    fn test_registry_select() {
        let mut registry = ForecasterRegistry::with_defaults();
        assert_eq!(registry.current().name(), "default");
        assert_eq!(registry.available(), vec!["default", "repeat"]);

        registry.register(Arc::new(Fixed));
        registry.select("fixed").unwrap();
        assert_eq!(registry.current().name(), "fixed");
        assert_eq!(
            registry.select("nope").unwrap_err(),
            ForecastError::UnknownAlgorithm("nope".into())
        );
        assert_eq!(registry.current().name(), "fixed");
    }

    #[test]
    fn test_forecast_targets_next_round() {
        let f = forecast_next(&Fixed, &[round("3326100")]).unwrap();
        assert_eq!(f.target.as_str(), "3326101");
        assert_eq!(f.algorithm, "fixed");
        assert!(f.is_pending());
    }

    #[test]
    fn test_validate_rejects_short_or_unordered_history() {
        let forecaster = ParityHeuristic;
        assert_eq!(
            forecaster.validate_input(&[round("3"), round("2")]),
            Err(ForecastError::InsufficientHistory { need: 3, got: 2 })
        );
        assert!(matches!(
            forecaster.validate_input(&[round("3"), round("1"), round("2")]),
            Err(ForecastError::InvalidInput(_))
        ));
        assert!(forecaster.validate_input(&[round("3"), round("2"), round("1")]).is_ok());
    }
}
