use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Wire format for every timestamp exchanged or persisted: `YYYYMMDDhhmmss` in UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

const TIMESTAMP_LEN: usize = 14;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("timestamp must be 14 digits (YYYYMMDDhhmmss), got {0:?}")]
    Malformed(String),
    #[error("timestamp {0:?} is not a valid calendar time")]
    OutOfRange(String),
}

/// Second-resolution UTC instant with a fixed-width, lexicographically sortable
/// string form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Truncates sub-second precision so that formatting and parsing round-trip.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Timestamp(at.trunc_subsecs(0))
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn parse(value: &str) -> Result<Self, TimestampError> {
        if value.len() != TIMESTAMP_LEN || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimestampError::Malformed(value.to_string()));
        }
        let naive = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
            .map_err(|_| TimestampError::OutOfRange(value.to_string()))?;
        Ok(Timestamp(Utc.from_utc_datetime(&naive)))
    }

    pub fn checked_add(&self, delta: Duration) -> Option<Self> {
        self.0.checked_add_signed(delta).map(Timestamp)
    }

    /// Signed distance `self - earlier`.
    pub fn signed_since(&self, earlier: DateTime<Utc>) -> Duration {
        self.0.signed_duration_since(earlier)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timestamp::parse(s)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Timestamp::from_datetime(value)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = TimestampError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Timestamp::parse(&value)
    }
}

impl From<Timestamp> for String {
    fn from(value: Timestamp) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_is_fixed_width_and_parses_back() {
        let at = Utc.with_ymd_and_hms(2024, 1, 5, 3, 4, 9).unwrap();
        let ts = Timestamp::from_datetime(at);
        assert_eq!(ts.to_string(), "20240105030409");
        assert_eq!(Timestamp::parse("20240105030409").unwrap(), ts);
    }

    #[test]
    fn test_subseconds_are_dropped() {
        let at = Utc.with_ymd_and_hms(2024, 1, 5, 3, 4, 9).unwrap() + Duration::milliseconds(750);
        let ts = Timestamp::from_datetime(at);
        assert_eq!(ts.to_string(), "20240105030409");
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(matches!(
            Timestamp::parse("2024-01-05 03:04"),
            Err(TimestampError::Malformed(_))
        ));
        assert!(matches!(
            Timestamp::parse("2024010503040"),
            Err(TimestampError::Malformed(_))
        ));
        assert!(matches!(
            Timestamp::parse("20241305030409"),
            Err(TimestampError::OutOfRange(_))
        ));
        assert!(Timestamp::parse("").is_err());
    }

    #[test]
    fn test_rejects_surrounding_whitespace() {
        for padded in [
            " 20240101000000",
            "20240101000000 ",
            " 20240101000000 ",
            "20240101000000\n",
        ] {
            assert!(
                matches!(Timestamp::parse(padded), Err(TimestampError::Malformed(_))),
                "{padded:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_string_order_matches_time_order() {
        let early = Timestamp::parse("20231231235959").unwrap();
        let late = Timestamp::parse("20240101000000").unwrap();
        assert!(early < late);
        assert!(early.to_string() < late.to_string());
    }

    #[test]
    fn test_serde_uses_string_form() {
        let ts = Timestamp::parse("20240105030409").unwrap();
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"20240105030409\"");
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }
}
