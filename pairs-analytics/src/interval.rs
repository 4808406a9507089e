use chrono::{DateTime, TimeDelta, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};
use thiserror::Error;

/// Fixed bar interval.
///
/// Buckets are left-aligned to the Unix epoch, so a `1m` bucket always starts at a whole
/// minute and a `5m` bucket at minute 0, 5, 10, ...
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Deserialize, Serialize,
)]
pub enum Interval {
    #[display("1s")]
    #[serde(rename = "1s")]
    S1,
    #[display("1m")]
    #[serde(rename = "1m")]
    M1,
    #[display("5m")]
    #[serde(rename = "5m")]
    M5,
    #[display("15m")]
    #[serde(rename = "15m")]
    M15,
    #[display("1h")]
    #[serde(rename = "1h")]
    H1,
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("unsupported interval: {0}")]
pub struct ParseIntervalError(pub String);

impl Interval {
    pub const ALL: [Interval; 5] = [
        Interval::S1,
        Interval::M1,
        Interval::M5,
        Interval::M15,
        Interval::H1,
    ];

    pub fn as_millis(&self) -> i64 {
        match self {
            Interval::S1 => 1_000,
            Interval::M1 => 60_000,
            Interval::M5 => 300_000,
            Interval::M15 => 900_000,
            Interval::H1 => 3_600_000,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.as_millis() as u64)
    }

    pub fn time_delta(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.as_millis())
    }

    /// Truncate `time` down to the start of the bucket it falls into.
    pub fn bucket_start(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let millis = time.timestamp_millis();
        let floored = millis - millis.rem_euclid(self.as_millis());
        DateTime::from_timestamp_millis(floored).unwrap_or(time)
    }
}

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1s" => Ok(Interval::S1),
            "1m" => Ok(Interval::M1),
            "5m" => Ok(Interval::M5),
            "15m" => Ok(Interval::M15),
            "1h" => Ok(Interval::H1),
            other => Err(ParseIntervalError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bucket_start() {
        struct TestCase {
            interval: Interval,
            expected: DateTime<Utc>,
        }

        // 2025-12-16 12:18:57.486
        let time = Utc.with_ymd_and_hms(2025, 12, 16, 12, 18, 57).unwrap()
            + TimeDelta::milliseconds(486);

        let tests = vec![
            TestCase {
                // TC0: 1s bucket drops sub-second precision
                interval: Interval::S1,
                expected: Utc.with_ymd_and_hms(2025, 12, 16, 12, 18, 57).unwrap(),
            },
            TestCase {
                // TC1: 1m bucket zeroes seconds
                interval: Interval::M1,
                expected: Utc.with_ymd_and_hms(2025, 12, 16, 12, 18, 0).unwrap(),
            },
            TestCase {
                // TC2: 5m bucket aligns to the preceding 5 minute mark
                interval: Interval::M5,
                expected: Utc.with_ymd_and_hms(2025, 12, 16, 12, 15, 0).unwrap(),
            },
            TestCase {
                // TC3: 15m bucket
                interval: Interval::M15,
                expected: Utc.with_ymd_and_hms(2025, 12, 16, 12, 15, 0).unwrap(),
            },
            TestCase {
                // TC4: 1h bucket
                interval: Interval::H1,
                expected: Utc.with_ymd_and_hms(2025, 12, 16, 12, 0, 0).unwrap(),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.interval.bucket_start(time);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_bucket_start_is_idempotent_on_boundary() {
        let boundary = Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap();
        assert_eq!(Interval::M5.bucket_start(boundary), boundary);
    }

    #[test]
    fn test_interval_parse_and_display() {
        for interval in Interval::ALL {
            let parsed: Interval = interval.to_string().parse().unwrap();
            assert_eq!(parsed, interval);
        }
        assert_eq!("1M".parse::<Interval>(), Ok(Interval::M1));
        assert_eq!(
            "2m".parse::<Interval>(),
            Err(ParseIntervalError("2m".to_string()))
        );
    }

    #[test]
    fn test_interval_serde_uses_short_labels() {
        let json = serde_json::to_string(&Interval::M5).unwrap();
        assert_eq!(json, "\"5m\"");
        let interval: Interval = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(interval, Interval::H1);
    }
}
