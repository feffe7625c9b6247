use crate::error::EngineError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timeframes the engine can resample to, with their length in minutes
pub const ALLOWED_TIMEFRAMES: &[(&str, u32)] = &[
    ("1m", 1),
    ("2m", 2),
    ("3m", 3),
    ("4m", 4),
    ("5m", 5),
    ("6m", 6),
    ("7m", 7),
    ("8m", 8),
    ("9m", 9),
    ("10m", 10),
    ("11m", 11),
    ("15m", 15),
    ("30m", 30),
    ("45m", 45),
    ("1h", 60),
    ("2h", 120),
    ("3h", 180),
    ("4h", 240),
    ("6h", 360),
    ("12h", 720),
    ("1d", 1440),
    ("3d", 4320),
];

/// A named bucket duration, e.g. "5m" or "4h"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    label: String,
    minutes: u32,
}

impl Timeframe {
    pub(crate) fn known(label: &str, minutes: u32) -> Self {
        Self {
            label: label.to_string(),
            minutes,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    pub fn seconds(&self) -> i64 {
        self.minutes as i64 * 60
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes as i64)
    }

    pub fn is_multiple_of(&self, base: &Timeframe) -> bool {
        self.minutes % base.minutes == 0
    }

    /// Whether `ts` sits exactly on a bucket edge of this timeframe
    pub fn is_boundary(&self, ts: DateTime<Utc>) -> bool {
        ts.timestamp().rem_euclid(self.seconds()) == 0
    }

    /// Right edge of the bucket that contains `ts` (right-closed: an edge belongs to the bucket it ends)
    pub fn bucket_end(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let width = self.seconds();
        let rem = secs.rem_euclid(width);
        let end = if rem == 0 && ts.timestamp_subsec_nanos() == 0 {
            secs
        } else {
            secs - rem + width
        };
        Utc.timestamp_opt(end, 0).single().unwrap_or(ts)
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::known("1m", 1)
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALLOWED_TIMEFRAMES
            .iter()
            .find(|(label, _)| *label == s)
            .map(|(label, minutes)| Timeframe {
                label: label.to_string(),
                minutes: *minutes,
            })
            .ok_or_else(|| EngineError::Config(format!("unsupported timeframe: {}", s)))
    }
}

impl TryFrom<String> for Timeframe {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.label
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_parse() {
        let tf: Timeframe = "4h".parse().unwrap();
        assert_eq!(tf.minutes(), 240);
        assert_eq!(tf.label(), "4h");
        assert!("7h".parse::<Timeframe>().is_err());
        assert!("".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_bucket_end_is_right_closed() {
        let tf: Timeframe = "5m".parse().unwrap();
        assert_eq!(tf.bucket_end(at(10, 0)), at(10, 0));
        assert_eq!(tf.bucket_end(at(10, 1)), at(10, 5));
        assert_eq!(tf.bucket_end(at(10, 4)), at(10, 5));
        assert_eq!(tf.bucket_end(at(10, 5)), at(10, 5));
    }

    #[test]
    fn test_multiple_of() {
        let base: Timeframe = "1m".parse().unwrap();
        let five: Timeframe = "5m".parse().unwrap();
        let three: Timeframe = "3m".parse().unwrap();
        assert!(five.is_multiple_of(&base));
        assert!(!five.is_multiple_of(&three));
    }

    #[test]
    fn test_serde_as_string() {
        let tf: Timeframe = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(tf.minutes(), 60);
        assert_eq!(serde_json::to_string(&tf).unwrap(), "\"1h\"");
    }
}
