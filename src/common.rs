use std::{
    collections::VecDeque,
    fmt,
    str::FromStr,
    time::{Duration, Instant},
};

use crate::ThrottlingError;

const SECONDS_PER_UNIT: [(char, u64); 4] = [('s', 1), ('m', 60), ('h', 3_600), ('d', 86_400)];

/// A validated rate: at most `limit` admissions within any trailing `period`.
///
/// Rates are usually parsed from strings of the form `<count>/[factor]<unit>`:
///
/// - `count`: positive integer, the admission limit
/// - `factor`: optional positive integer multiplying the unit (default `1`)
/// - `unit`: `s`, `m`, `h` or `d`. Only the first letter counts and case is
///   ignored, so `"sec"`, `"Minutes"` and `"h"` are all accepted.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use throttling::Rate;
///
/// let rate: Rate = "8/2s".parse().unwrap();
/// assert_eq!(rate.limit(), 8);
/// assert_eq!(rate.period(), Duration::from_secs(2));
///
/// assert!("8 per second".parse::<Rate>().is_err());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rate {
    limit: u64,
    period: Duration,
}

impl Rate {
    /// Create a rate from its parts.
    ///
    /// Fails with [`ThrottlingError::MalformedRate`] if `limit` is zero or `period`
    /// is empty.
    pub fn new(limit: u64, period: Duration) -> Result<Self, ThrottlingError> {
        if limit == 0 {
            return Err(ThrottlingError::MalformedRate(
                "limit must be greater than 0".to_string(),
            ));
        }

        if period.is_zero() {
            return Err(ThrottlingError::MalformedRate(
                "period must be greater than 0".to_string(),
            ));
        }

        Ok(Self { limit, period })
    }

    /// Maximum number of admissions per period.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Length of the sliding window.
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Default for Rate {
    /// Three admissions per second.
    fn default() -> Self {
        Self {
            limit: 3,
            period: Duration::from_secs(1),
        }
    }
}

/// Whole-second periods render as `"<limit>/<seconds>s"`, which parses back to
/// an equal rate. Sub-second periods render with a fractional factor such as
/// `"1/0.5s"`, which [`FromStr`] rejects instead of misreading.
impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.period.subsec_nanos() == 0 {
            write!(f, "{}/{}s", self.limit, self.period.as_secs())
        } else {
            write!(f, "{}/{}s", self.limit, self.period.as_secs_f64())
        }
    }
}

impl FromStr for Rate {
    type Err = ThrottlingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed =
            |reason: &str| ThrottlingError::MalformedRate(format!("{value:?}: {reason}"));

        let Some((count, period)) = value.split_once('/') else {
            return Err(malformed("expected <count>/[factor]<unit>"));
        };

        if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed("count must be a decimal integer"));
        }

        let limit: u64 = count
            .parse()
            .map_err(|_| malformed("count is out of range"))?;

        let unit_start = period
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| malformed("missing unit"))?;
        let (factor, unit) = period.split_at(unit_start);

        if !unit.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(malformed("unit must be alphabetic"));
        }

        let factor: u64 = match factor {
            "" => 1,
            digits => digits
                .parse()
                .map_err(|_| malformed("factor is out of range"))?,
        };

        let Some(first) = unit.chars().next().map(|c| c.to_ascii_lowercase()) else {
            return Err(malformed("missing unit"));
        };

        let Some(&(_, seconds)) = SECONDS_PER_UNIT.iter().find(|(letter, _)| *letter == first)
        else {
            return Err(malformed("unit must be one of s, m, h, d"));
        };

        let period_secs = factor
            .checked_mul(seconds)
            .ok_or_else(|| malformed("period is out of range"))?;

        Rate::new(limit, Duration::from_secs(period_secs)).map_err(|_| {
            if limit == 0 {
                malformed("count must be greater than 0")
            } else {
                malformed("factor must be greater than 0")
            }
        })
    }
}

impl TryFrom<&str> for Rate {
    type Error = ThrottlingError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<String> for Rate {
    type Error = ThrottlingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Admission timestamps for one quota, oldest first.
#[derive(Debug, Default)]
pub(crate) struct History {
    entries: VecDeque<Instant>,
}

impl History {
    /// Drop every entry whose age has reached `period`.
    ///
    /// The window is half-open: an entry exactly `period` old is already out, and
    /// [`retry_after`](Self::retry_after) is never zero for an entry still held.
    pub fn evict(&mut self, now: Instant, period: Duration) {
        while let Some(oldest) = self.entries.front()
            && now.saturating_duration_since(*oldest) >= period
        {
            self.entries.pop_front();
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.entries.push_back(now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn oldest(&self) -> Option<Instant> {
        self.entries.front().copied()
    }

    /// Time until the oldest entry leaves the window.
    pub fn retry_after(&self, now: Instant, period: Duration) -> Option<Duration> {
        self.oldest()
            .map(|oldest| period.saturating_sub(now.saturating_duration_since(oldest)))
    }
}
