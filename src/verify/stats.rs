use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{Forecast, MatchType};

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Aggregate accuracy over verified forecasts. Pending forecasts are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyStats {
    pub total: usize,
    pub correct: usize,
    /// `correct / total`, two decimals
    pub accuracy: f64,
    pub exact: usize,
    pub partial: usize,
    pub none: usize,
    pub first_forecast_at: Option<DateTime<Utc>>,
    pub last_forecast_at: Option<DateTime<Utc>>,
}

impl AccuracyStats {
    pub fn from_forecasts(forecasts: &[Forecast]) -> Self {
        let mut stats = AccuracyStats::default();
        for f in forecasts {
            let Some(outcome) = &f.outcome else { continue };
            stats.total += 1;
            if outcome.correct {
                stats.correct += 1;
            }
            match outcome.match_type {
                MatchType::Exact => stats.exact += 1,
                MatchType::Partial => stats.partial += 1,
                MatchType::None => stats.none += 1,
            }
            stats.first_forecast_at = Some(match stats.first_forecast_at {
                Some(t) => t.min(f.created_at),
                None => f.created_at,
            });
            stats.last_forecast_at = Some(match stats.last_forecast_at {
                Some(t) => t.max(f.created_at),
                None => f.created_at,
            });
        }
        if stats.total > 0 {
            stats.accuracy = round2(stats.correct as f64 / stats.total as f64);
        }
        stats
    }
}

/// Percent correct over each full sliding window, oldest window first.
pub fn moving_average(outcomes: &[bool], window: usize) -> Vec<f64> {
    if window == 0 || outcomes.len() < window {
        return Vec::new();
    }
    outcomes
        .windows(window)
        .map(|w| {
            let hits = w.iter().filter(|c| **c).count();
            round2(hits as f64 / window as f64 * 100.0)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

impl TrendDirection {
    /// Compares the last two points of a percentage series.
    pub fn from_series(series: &[f64]) -> Self {
        let [.., prev, last] = series else {
            return TrendDirection::InsufficientData;
        };
        let delta = last - prev;
        if delta > 1.0 {
            TrendDirection::Improving
        } else if delta < -1.0 {
            TrendDirection::Declining
        } else {
            TrendDirection::Stable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Improving => "improving",
            TrendDirection::Declining => "declining",
            TrendDirection::Stable => "stable",
            TrendDirection::InsufficientData => "insufficient_data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub sample_size: usize,
    pub window: usize,
    pub series: Vec<f64>,
    pub direction: TrendDirection,
}

impl TrendReport {
    /// Verified forecasts in any order; the series runs oldest target to newest.
    pub fn from_outcomes(forecasts: &[Forecast], window: usize) -> Self {
        let mut verified: Vec<&Forecast> = forecasts.iter().filter(|f| f.outcome.is_some()).collect();
        verified.sort_by(|a, b| a.target.cmp(&b.target));
        let flags: Vec<bool> = verified.iter().filter_map(|f| f.is_correct()).collect();
        let series = moving_average(&flags, window);
        Self {
            sample_size: flags.len(),
            window,
            direction: TrendDirection::from_series(&series),
            series,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAccuracy {
    pub date: NaiveDate,
    pub total: usize,
    pub correct: usize,
    pub accuracy: f64,
}

/// Verified forecasts grouped by creation day (UTC), oldest day first.
pub fn daily_breakdown(forecasts: &[Forecast]) -> Vec<DailyAccuracy> {
    let mut days: BTreeMap<NaiveDate, (usize, usize)> = BTreeMap::new();
    for f in forecasts {
        if let Some(correct) = f.is_correct() {
            let day = days.entry(f.created_at.date_naive()).or_default();
            day.0 += 1;
            if correct {
                day.1 += 1;
            }
        }
    }
    days.into_iter()
        .map(|(date, (total, correct))| DailyAccuracy {
            date,
            total,
            correct,
            accuracy: round2(correct as f64 / total as f64),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Draw, Outcome, Parity, RoundId};
    use chrono::TimeZone;

    fn verified(target: u64, correct: bool, match_type: MatchType) -> Forecast {
        let mut f = Forecast::new(RoundId::from_value(target, 7), Draw::parse("2+4+0").unwrap(), "default", "v1.0");
        let actual = Draw::parse("2+4+1").unwrap();
        f.outcome = Some(Outcome {
            actual,
            actual_sum: actual.sum(),
            actual_parity: Parity::of(actual.sum()),
            correct,
            match_type,
            matched_positions: vec![],
            verified_at: Utc::now(),
        });
        f
    }

    #[test]
    fn test_accuracy_ignores_pending() {
        let mut forecasts = vec![
            verified(1, true, MatchType::Exact),
            verified(2, true, MatchType::Partial),
            verified(3, false, MatchType::None),
        ];
        forecasts.push(Forecast::new(RoundId::from_value(4, 7), Draw::parse("1+3+1").unwrap(), "default", "v1.0"));

        let stats = AccuracyStats::from_forecasts(&forecasts);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.correct, 2);
        assert_eq!(stats.accuracy, 0.67);
        assert_eq!((stats.exact, stats.partial, stats.none), (1, 1, 1));
        assert!(stats.first_forecast_at <= stats.last_forecast_at);
    }

    #[test]
    fn test_accuracy_empty() {
        let stats = AccuracyStats::from_forecasts(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.accuracy, 0.0);
        assert!(stats.first_forecast_at.is_none());
    }

    #[test]
    fn test_moving_average_percent() {
        let series = moving_average(&[true, false, true, true], 2);
        assert_eq!(series, vec![50.0, 50.0, 100.0]);
        assert!(moving_average(&[true], 2).is_empty());
    }

    #[test]
    fn test_trend_direction_thresholds() {
        assert_eq!(TrendDirection::from_series(&[50.0]), TrendDirection::InsufficientData);
        assert_eq!(TrendDirection::from_series(&[50.0, 52.0]), TrendDirection::Improving);
        assert_eq!(TrendDirection::from_series(&[50.0, 48.0]), TrendDirection::Declining);
        assert_eq!(TrendDirection::from_series(&[50.0, 51.0]), TrendDirection::Stable);
        assert_eq!(TrendDirection::from_series(&[50.0, 49.0]), TrendDirection::Stable);
    }

    #[test]
    fn test_trend_report_is_chronological() {
        // newest first, as the store returns them
        let forecasts = vec![
            verified(4, true, MatchType::Exact),
            verified(3, true, MatchType::Exact),
            verified(2, false, MatchType::None),
            verified(1, false, MatchType::None),
        ];
        let report = TrendReport::from_outcomes(&forecasts, 2);
        assert_eq!(report.series, vec![0.0, 50.0, 100.0]);
        assert_eq!(report.direction, TrendDirection::Improving);
        assert_eq!(report.sample_size, 4);
    }

    #[test]
    fn test_daily_breakdown_groups_by_day() {
        let mut a = verified(1, true, MatchType::Exact);
        a.created_at = Utc.with_ymd_and_hms(2026, 8, 22, 23, 0, 0).unwrap();
        let mut b = verified(2, false, MatchType::None);
        b.created_at = Utc.with_ymd_and_hms(2026, 8, 23, 1, 0, 0).unwrap();
        let mut c = verified(3, true, MatchType::Partial);
        c.created_at = Utc.with_ymd_and_hms(2026, 8, 23, 2, 0, 0).unwrap();

        let days = daily_breakdown(&[c, a, b]);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2026, 8, 22).unwrap());
        assert_eq!((days[1].total, days[1].correct, days[1].accuracy), (2, 1, 0.5));
    }
}
