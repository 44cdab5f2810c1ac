//! How long a finalized file stays downloadable.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Closed set of lifetimes a client may pick for an upload.
///
/// The discriminant is the lifetime in minutes, which is also the value
/// persisted in `file_entries.expires_in`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(try_from = "ExpiryRepr", into = "String")]
pub enum ExpiryDuration {
    OneMinute = 1,
    FiveMinutes = 5,
    TenMinutes = 10,
    ThirtyMinutes = 30,
    OneHour = 60,
    FourHours = 240,
    OneDay = 1440,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid expiry duration: {0}")]
pub struct UnknownExpiry(pub String);

const ALL: [ExpiryDuration; 7] = [
    ExpiryDuration::OneMinute,
    ExpiryDuration::FiveMinutes,
    ExpiryDuration::TenMinutes,
    ExpiryDuration::ThirtyMinutes,
    ExpiryDuration::OneHour,
    ExpiryDuration::FourHours,
    ExpiryDuration::OneDay,
];

impl ExpiryDuration {
    pub fn minutes(self) -> i64 {
        self as i64
    }

    pub fn as_duration(self) -> Duration {
        Duration::minutes(self.minutes())
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::OneMinute => "OneMinute",
            Self::FiveMinutes => "FiveMinutes",
            Self::TenMinutes => "TenMinutes",
            Self::ThirtyMinutes => "ThirtyMinutes",
            Self::OneHour => "OneHour",
            Self::FourHours => "FourHours",
            Self::OneDay => "OneDay",
        }
    }

    /// Human-readable lifetime, e.g. `30 minutes` or `1 day`.
    pub fn describe(self) -> String {
        let minutes = self.minutes();
        let (count, unit) = if minutes % 1440 == 0 {
            (minutes / 1440, "day")
        } else if minutes % 60 == 0 {
            (minutes / 60, "hour")
        } else {
            (minutes, "minute")
        };
        if count == 1 {
            format!("1 {}", unit)
        } else {
            format!("{} {}s", count, unit)
        }
    }
}

impl TryFrom<i64> for ExpiryDuration {
    type Error = UnknownExpiry;

    fn try_from(minutes: i64) -> Result<Self, Self::Error> {
        ALL.into_iter()
            .find(|candidate| candidate.minutes() == minutes)
            .ok_or_else(|| UnknownExpiry(minutes.to_string()))
    }
}

/// Accepts either the variant name (`OneDay`) or the minute count (`1440`).
impl FromStr for ExpiryDuration {
    type Err = UnknownExpiry;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(minutes) = trimmed.parse::<i64>() {
            return Self::try_from(minutes);
        }
        ALL.into_iter()
            .find(|candidate| candidate.name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownExpiry(trimmed.to_string()))
    }
}

impl fmt::Display for ExpiryDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<ExpiryDuration> for String {
    fn from(value: ExpiryDuration) -> Self {
        value.name().to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiryRepr {
    Minutes(i64),
    Name(String),
}

impl TryFrom<ExpiryRepr> for ExpiryDuration {
    type Error = UnknownExpiry;

    fn try_from(value: ExpiryRepr) -> Result<Self, Self::Error> {
        match value {
            ExpiryRepr::Minutes(minutes) => Self::try_from(minutes),
            ExpiryRepr::Name(name) => name.parse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_minutes() {
        assert_eq!("OneDay".parse(), Ok(ExpiryDuration::OneDay));
        assert_eq!("1440".parse(), Ok(ExpiryDuration::OneDay));
        assert_eq!("fourhours".parse(), Ok(ExpiryDuration::FourHours));
        assert_eq!(ExpiryDuration::try_from(30), Ok(ExpiryDuration::ThirtyMinutes));
    }

    #[test]
    fn rejects_values_outside_the_set() {
        assert!("7".parse::<ExpiryDuration>().is_err());
        assert!("Forever".parse::<ExpiryDuration>().is_err());
        assert!(ExpiryDuration::try_from(0).is_err());
    }

    #[test]
    fn describes_lifetimes_in_the_largest_whole_unit() {
        assert_eq!(ExpiryDuration::OneMinute.describe(), "1 minute");
        assert_eq!(ExpiryDuration::ThirtyMinutes.describe(), "30 minutes");
        assert_eq!(ExpiryDuration::FourHours.describe(), "4 hours");
        assert_eq!(ExpiryDuration::OneDay.describe(), "1 day");
    }

    #[test]
    fn deserializes_from_json_number_or_string() {
        let from_number: ExpiryDuration = serde_json::from_str("60").unwrap();
        let from_name: ExpiryDuration = serde_json::from_str("\"OneHour\"").unwrap();
        assert_eq!(from_number, ExpiryDuration::OneHour);
        assert_eq!(from_name, ExpiryDuration::OneHour);
        assert!(serde_json::from_str::<ExpiryDuration>("2").is_err());
    }
}
