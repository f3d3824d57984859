//! Race time strings as they appear on timing sheets and in the stage results:
//! `SS.sss`, `M:SS.sss` and `H:MM:SS.sss`, with `,` accepted as the decimal
//! separator and normalized to `.`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lap-time cell (`TMV`, lap sheets).
static LAP_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2}:)?\d{1,2}[.,]\d{1,3}$").expect("lap pattern"));

/// Total-time cell (`TT`): at least `M:SS.sss`.
static TOTAL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2}:)?\d{1,2}:\d{2}[.,]\d{1,3}$").expect("total pattern"));

/// Anything an operator may type by hand.
static MANUAL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^((\d{1,2}:)?\d{1,2}:)?\d{1,2}[.,]\d{1,3}$").expect("manual pattern")
});

/// Sort value for a missing time; above any real time so unset rows go last.
pub const UNSET_TIME_MS: u64 = u64::MAX;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("invalid time '{0}', expected MM:SS.sss or SS.sss")]
    InvalidFormat(String),
}

/// Millisecond-precision race time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RaceTime {
    millis: u64,
}

impl RaceTime {
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self { millis: secs * 1000 }
    }

    pub const fn as_millis(&self) -> u64 {
        self.millis
    }

    pub fn saturating_sub(self, other: RaceTime) -> RaceTime {
        RaceTime::from_millis(self.millis.saturating_sub(other.millis))
    }
}

impl FromStr for RaceTime {
    type Err = TimeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = normalize(raw);
        let invalid = || TimeError::InvalidFormat(raw.trim().to_string());

        let parts: Vec<&str> = normalized.split(':').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(invalid());
        }

        let (seconds_part, leading) = parts.split_last().ok_or_else(invalid)?;
        let (whole, fraction) = seconds_part.split_once('.').unwrap_or((seconds_part, ""));
        if whole.is_empty() || fraction.len() > 3 {
            return Err(invalid());
        }
        let seconds: u64 = parse_digits(whole).ok_or_else(invalid)?;
        let fraction_ms: u64 = if fraction.is_empty() {
            0
        } else {
            // "4" → 400 ms, "45" → 450 ms
            let padded = format!("{fraction:0<3}");
            parse_digits(&padded).ok_or_else(invalid)?
        };

        let mut minutes_total: u64 = 0;
        for part in leading {
            minutes_total = minutes_total * 60 + parse_digits(part).ok_or_else(invalid)?;
        }

        Ok(RaceTime::from_millis(
            (minutes_total * 60 + seconds) * 1000 + fraction_ms,
        ))
    }
}

impl fmt::Display for RaceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.millis % 1000;
        let total_secs = self.millis / 1000;
        let secs = total_secs % 60;
        let mins = (total_secs / 60) % 60;
        let hours = total_secs / 3600;

        if hours > 0 {
            write!(f, "{hours}:{mins:02}:{secs:02}.{ms:03}")
        } else if mins > 0 {
            write!(f, "{mins}:{secs:02}.{ms:03}")
        } else {
            write!(f, "{secs}.{ms:03}")
        }
    }
}

fn parse_digits(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Trim and swap a decimal comma for a period.
pub fn normalize(raw: &str) -> String {
    raw.trim().replace(',', ".")
}

pub fn is_lap_time(raw: &str) -> bool {
    LAP_PATTERN.is_match(raw.trim())
}

pub fn is_total_time(raw: &str) -> bool {
    TOTAL_PATTERN.is_match(raw.trim())
}

/// Validate a hand-typed time and return its normalized text.
pub fn validate_manual(raw: &str) -> Result<String, TimeError> {
    if MANUAL_PATTERN.is_match(raw.trim()) {
        Ok(normalize(raw))
    } else {
        Err(TimeError::InvalidFormat(raw.trim().to_string()))
    }
}

/// Milliseconds for sorting; `UNSET_TIME_MS` when missing or unparseable.
pub fn sort_millis(value: Option<&str>) -> u64 {
    value
        .and_then(|v| v.parse::<RaceTime>().ok())
        .map(|t| t.as_millis())
        .unwrap_or(UNSET_TIME_MS)
}
