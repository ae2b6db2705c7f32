use crate::forecast::{ForecastError, Forecaster};
use crate::logging::{debug, obj, v_int, v_str, Domain};
use crate::model::{Draw, Parity, Round};

const EVEN_PICK: [u8; 3] = [2, 4, 0];
const ODD_PICK: [u8; 3] = [1, 3, 1];

/// Sums every slot of the last three rounds and takes the integer mean;
/// an even mean predicts an even-sum draw, an odd one an odd-sum draw.
pub struct ParityHeuristic;

impl Forecaster for ParityHeuristic {
    fn name(&self) -> &'static str {
        "default"
    }

    fn version(&self) -> &'static str {
        "v1.0"
    }

    fn required_history(&self) -> usize {
        3
    }

    fn predict(&self, history: &[Round]) -> Result<Draw, ForecastError> {
        let recent = &history[..self.required_history().min(history.len())];
        let total: u32 = recent.iter().map(|r| r.draw.sum()).sum();
        let mean = total / self.required_history() as u32;
        let pick = match Parity::of(mean) {
            Parity::Even => EVEN_PICK,
            Parity::Odd => ODD_PICK,
        };
        debug(
            Domain::Forecast,
            "parity_heuristic",
            obj(&[
                ("total", v_int(total as i64)),
                ("mean", v_int(mean as i64)),
                ("parity", v_str(Parity::of(mean).as_str())),
            ]),
        );
        Draw::new(pick).map_err(|e| ForecastError::InvalidInput(e.to_string()))
    }
}

/// Predicts the most recent draw again.
pub struct RepeatLast;

impl Forecaster for RepeatLast {
    fn name(&self) -> &'static str {
        "repeat"
    }

    fn version(&self) -> &'static str {
        "v1.0"
    }

    fn required_history(&self) -> usize {
        1
    }

    fn predict(&self, history: &[Round]) -> Result<Draw, ForecastError> {
        history
            .first()
            .map(|r| r.draw)
            .ok_or(ForecastError::InsufficientHistory { need: 1, got: 0 })
    }
}
