//! Parsing of Go-style duration strings such as `8760h` or `1h30m`, as found
//! in resource settings.

use std::{fmt, str::FromStr, time::Duration};

/// A non-negative duration expressed in Go's `time.Duration` string format.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct GoDuration(Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid duration {0:?}: empty")]
    Empty(String),

    #[error("invalid duration {0:?}: {EXPECTED_UNITS}")]
    InvalidUnit(String),

    #[error("invalid duration {0:?}: missing a unit, {EXPECTED_UNITS}")]
    NoUnit(String),

    #[error("invalid duration {0:?}: not a number")]
    NotANumber(String),

    #[error("invalid duration {0:?}: must not be negative")]
    Negative(String),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

// === impl GoDuration ===

impl GoDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for GoDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl From<GoDuration> for Duration {
    fn from(GoDuration(d): GoDuration) -> Self {
        d
    }
}

impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let s = input.trim();
        if s.is_empty() {
            return Err(ParseError::Empty(input.to_string()));
        }
        if s.starts_with('-') {
            if s.trim_start_matches('-') == "0" {
                return Ok(Self(Duration::ZERO));
            }
            return Err(ParseError::Negative(input.to_string()));
        }
        let mut rest = s.trim_start_matches('+');
        if rest == "0" {
            return Ok(Self(Duration::ZERO));
        }

        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| c.is_alphabetic())
                .ok_or_else(|| ParseError::NoUnit(input.to_string()))?;
            let (value, tail) = rest.split_at(unit_start);
            let unit_end = tail
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_end);

            let value = value
                .parse::<f64>()
                .map_err(|_| ParseError::NotANumber(input.to_string()))?;
            let base = unit_base(unit).ok_or_else(|| ParseError::InvalidUnit(input.to_string()))?;
            total += base.mul_f64(value);
            rest = tail;
        }
        Ok(Self(total))
    }
}

fn unit_base(unit: &str) -> Option<Duration> {
    const MINUTE: Duration = Duration::from_secs(60);
    let base = match unit {
        "ns" => Duration::from_nanos(1),
        // U+00B5 is the micro sign and U+03BC the Greek letter mu.
        "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
        "ms" => Duration::from_millis(1),
        "s" => Duration::from_secs(1),
        "m" => MINUTE,
        "h" => MINUTE * 60,
        _ => return None,
    };
    Some(base)
}
