//! Time types for calcgrid.
//!
//! `Timestamp` is the valuation instant that compiled functions are built
//! for, and the creation time stamped on job specifications.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Wall clock instant with nanosecond precision since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    /// Whole seconds since the epoch
    pub seconds: u64,
    /// Sub-second nanoseconds
    pub nanos: u32,
}

impl Timestamp {
    /// Maximum nanoseconds per second
    pub const NANOS_PER_SEC: u32 = 1_000_000_000;

    /// The epoch itself
    pub const EPOCH: Self = Self {
        seconds: 0,
        nanos: 0,
    };

    /// Create a new timestamp
    #[must_use]
    pub const fn new(seconds: u64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Create from milliseconds since the epoch
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            seconds: millis / 1_000,
            nanos: ((millis % 1_000) * 1_000_000) as u32,
        }
    }

    /// Get current timestamp
    ///
    /// A clock set before the epoch reads as the epoch.
    #[must_use]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: duration.as_secs(),
            nanos: duration.subsec_nanos(),
        }
    }

    /// Parse an RFC 3339 string such as `2024-03-01T12:00:00Z`
    ///
    /// # Errors
    ///
    /// Returns `InvalidTimestamp` if the string does not parse or lies
    /// before the epoch.
    pub fn parse_rfc3339(text: &str) -> CoreResult<Self> {
        let parsed = DateTime::parse_from_rfc3339(text).map_err(|e| CoreError::InvalidTimestamp {
            reason: format!("{text}: {e}"),
        })?;
        let utc = parsed.with_timezone(&Utc);
        let seconds = u64::try_from(utc.timestamp()).map_err(|_| CoreError::InvalidTimestamp {
            reason: format!("{text} is before the epoch"),
        })?;
        Ok(Self::new(seconds, utc.timestamp_subsec_nanos()))
    }

    /// Format as RFC 3339 in UTC
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        i64::try_from(self.seconds)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, self.nanos))
            .map_or_else(
                || self.to_string(),
                |dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            )
    }

    /// Convert to milliseconds
    #[must_use]
    pub const fn as_millis(&self) -> u128 {
        self.seconds as u128 * 1_000 + self.nanos as u128 / 1_000_000
    }

    /// Get duration since another timestamp (zero if `earlier` is later)
    #[must_use]
    pub fn duration_since(&self, earlier: &Timestamp) -> Duration {
        if self <= earlier {
            return Duration::zero();
        }
        let mut seconds = self.seconds - earlier.seconds;
        let mut nanos = i64::from(self.nanos) - i64::from(earlier.nanos);

        if nanos < 0 {
            seconds -= 1;
            nanos += i64::from(Self::NANOS_PER_SEC);
        }

        Duration {
            seconds,
            nanos: nanos as u32,
        }
    }

    /// Add a duration, saturating at the far future
    #[must_use]
    pub fn add(&self, duration: &Duration) -> Self {
        let mut seconds = self.seconds.saturating_add(duration.seconds);
        let mut nanos = self.nanos + duration.nanos;

        if nanos >= Self::NANOS_PER_SEC {
            seconds = seconds.saturating_add(1);
            nanos -= Self::NANOS_PER_SEC;
        }

        Self { seconds, nanos }
    }

    /// Subtract a duration, saturating at the epoch
    #[must_use]
    pub fn saturating_sub(&self, duration: &Duration) -> Self {
        let Some(mut seconds) = self.seconds.checked_sub(duration.seconds) else {
            return Self::EPOCH;
        };
        let nanos = if self.nanos >= duration.nanos {
            self.nanos - duration.nanos
        } else {
            let Some(borrowed) = seconds.checked_sub(1) else {
                return Self::EPOCH;
            };
            seconds = borrowed;
            self.nanos + Self::NANOS_PER_SEC - duration.nanos
        };
        Self { seconds, nanos }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

/// A span of time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Duration {
    /// Whole seconds
    pub seconds: u64,
    /// Sub-second nanoseconds
    pub nanos: u32,
}

impl Duration {
    /// Create a new duration
    #[must_use]
    pub const fn new(seconds: u64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Zero duration
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            seconds: 0,
            nanos: 0,
        }
    }

    /// Duration from seconds
    #[must_use]
    pub const fn from_secs(seconds: u64) -> Self {
        Self { seconds, nanos: 0 }
    }

    /// Duration from milliseconds
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            seconds: millis / 1_000,
            nanos: ((millis % 1_000) * 1_000_000) as u32,
        }
    }

    /// Get total milliseconds
    #[must_use]
    pub fn as_millis(&self) -> u128 {
        self.seconds as u128 * 1_000 + self.nanos as u128 / 1_000_000
    }

    /// Get total nanoseconds
    #[must_use]
    pub fn as_nanos(&self) -> u128 {
        self.seconds as u128 * 1_000_000_000 + self.nanos as u128
    }
}

impl Default for Duration {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<Duration> for std::time::Duration {
    fn from(value: Duration) -> Self {
        Self::new(value.seconds, value.nanos)
    }
}

impl std::fmt::Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.seconds == 0 && self.nanos == 0 {
            write!(f, "0s")
        } else if self.seconds == 0 && self.nanos % 1_000_000 == 0 {
            write!(f, "{}ms", self.nanos / 1_000_000)
        } else if self.seconds == 0 {
            write!(f, "{}ns", self.nanos)
        } else if self.nanos == 0 {
            write!(f, "{}s", self.seconds)
        } else {
            write!(f, "{}.{:09}s", self.seconds, self.nanos)
        }
    }
}
