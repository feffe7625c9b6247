use crate::error::EngineError;
use crate::models::Candle;
use crate::Result;
use chrono::Duration;
use std::collections::HashMap;

/// Sanity checks for a single OHLCV bar
pub struct CandleValidator;

impl CandleValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, candle: &Candle) -> Result<()> {
        self.validate_prices(candle)?;
        self.validate_ohlc_relationship(candle)?;
        Ok(())
    }

    fn validate_prices(&self, candle: &Candle) -> Result<()> {
        for (name, value) in [
            ("open", candle.open),
            ("high", candle.high),
            ("low", candle.low),
            ("close", candle.close),
        ] {
            if value.is_nan() || value <= 0.0 {
                return Err(invalid(format!("{} price {} at {}", name, value, candle.timestamp)));
            }
        }
        if candle.volume < 0.0 {
            return Err(invalid(format!("volume {} at {}", candle.volume, candle.timestamp)));
        }
        Ok(())
    }

    fn validate_ohlc_relationship(&self, candle: &Candle) -> Result<()> {
        if candle.high < candle.low {
            return Err(invalid(format!(
                "high ({}) is less than low ({})",
                candle.high, candle.low
            )));
        }
        if candle.high < candle.open.max(candle.close) {
            return Err(invalid(format!(
                "high ({}) is below open/close at {}",
                candle.high, candle.timestamp
            )));
        }
        if candle.low > candle.open.min(candle.close) {
            return Err(invalid(format!(
                "low ({}) is above open/close at {}",
                candle.low, candle.timestamp
            )));
        }
        Ok(())
    }
}

impl Default for CandleValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(msg: String) -> EngineError {
    EngineError::DataIntegrity(msg)
}

/// Diagnostics for a loaded candle series. Nothing is corrected; the caller decides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegrityReport {
    pub candles: usize,
    /// Most common spacing between consecutive candles
    pub interval: Option<Duration>,
    pub duplicates: usize,
    pub out_of_order: usize,
    pub gaps: usize,
    /// Sum of |(gap - interval) / interval| over every irregular step
    pub missing_score: f64,
    pub invalid: usize,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.duplicates == 0 && self.out_of_order == 0 && self.gaps == 0 && self.invalid == 0
    }
}

/// Inspect a candle series for duplicates, gaps and malformed bars
pub fn check_candles(candles: &[Candle]) -> IntegrityReport {
    let mut report = IntegrityReport {
        candles: candles.len(),
        ..Default::default()
    };

    let validator = CandleValidator::new();
    report.invalid = candles
        .iter()
        .filter(|c| validator.validate(c).is_err())
        .count();

    let diffs: Vec<i64> = candles
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).num_seconds())
        .collect();

    let mut counts: HashMap<i64, usize> = HashMap::new();
    for d in diffs.iter().filter(|d| **d > 0) {
        *counts.entry(*d).or_insert(0) += 1;
    }
    // Ties resolve to the shorter spacing
    let interval = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(d, _)| *d);
    report.interval = interval.map(Duration::seconds);

    for d in &diffs {
        match (*d, interval) {
            (0, _) => report.duplicates += 1,
            (d, _) if d < 0 => report.out_of_order += 1,
            (d, Some(iv)) if d != iv => {
                report.gaps += 1;
                report.missing_score += ((d - iv) as f64 / iv as f64).abs();
            }
            _ => {}
        }
    }

    tracing::info!(
        "Candle check: {} candles, interval {:?}s, {} duplicates, {} out of order, {} invalid",
        report.candles,
        interval,
        report.duplicates,
        report.out_of_order,
        report.invalid
    );
    if report.gaps > 0 {
        tracing::warn!(
            "Total Missing Candles: {} gaps, score {:.2}",
            report.gaps,
            report.missing_score
        );
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(minute: i64) -> Candle {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute);
        Candle::new(t, 100.0, 101.0, 99.0, 100.5, 10.0)
    }

    #[test]
    fn test_clean_series() {
        let candles: Vec<Candle> = (0..10).map(candle).collect();
        let report = check_candles(&candles);
        assert!(report.is_clean());
        assert_eq!(report.interval, Some(Duration::minutes(1)));
        assert_eq!(report.missing_score, 0.0);
    }

    #[test]
    fn test_gaps_and_duplicates() {
        let candles = vec![candle(0), candle(1), candle(1), candle(2), candle(5), candle(6)];
        let report = check_candles(&candles);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.gaps, 1);
        // 3-minute step against a 1-minute interval
        assert!((report.missing_score - 2.0).abs() < 1e-9);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_validator_rejects_bad_bars() {
        let validator = CandleValidator::new();
        let mut c = candle(0);
        assert!(validator.validate(&c).is_ok());

        c.high = 98.0;
        assert!(validator.validate(&c).is_err());

        let mut c = candle(0);
        c.close = 0.0;
        assert!(validator.validate(&c).is_err());
    }
}
