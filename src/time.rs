//! Microsecond timestamps and durations, the units every timer and poll
//! timeout in this crate is expressed in.

use std::ops;
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp, microseconds since the Unix epoch.
///
/// Sampled immediately after the demultiplexer's wait returns, and used to
/// order timer expirations and to stamp read callbacks.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Samples the current wall-clock time.
    pub fn now() -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(StdDuration::ZERO);
        Timestamp(since_epoch.as_micros() as i64)
    }

    pub(crate) fn from_micros(micros: i64) -> Timestamp {
        Timestamp(micros)
    }

    pub fn micros_since_epoch(self) -> i64 {
        self.0
    }
}

impl ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.0)
    }
}

impl ops::Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

/// A signed microsecond duration with the small set of scaling helpers the
/// timer and backoff code need.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Duration(i64);

impl Duration {
    pub const MICROSECOND: Duration = Duration(1);
    pub const MILLISECOND: Duration = Duration(1_000);
    pub const SECOND: Duration = Duration(1_000_000);

    pub const fn from_micros(us: i64) -> Duration {
        Duration(us)
    }

    pub fn from_secs_f64(secs: f64) -> Duration {
        Duration((secs * Self::SECOND.0 as f64) as i64)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    pub fn as_millis_f64(self) -> f64 {
        self.0 as f64 / Self::MILLISECOND.0 as f64
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / Self::SECOND.0 as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn max(self, other: Duration) -> Duration {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }
}

impl ops::Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl ops::Mul<i64> for Duration {
    type Output = Duration;

    fn mul(self, rhs: i64) -> Duration {
        Duration(self.0 * rhs)
    }
}

impl From<Duration> for StdDuration {
    fn from(d: Duration) -> StdDuration {
        if d.0 <= 0 {
            StdDuration::ZERO
        } else {
            StdDuration::from_micros(d.0 as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_arithmetic() {
        let half_sec = Duration::from_secs_f64(0.5);
        assert_eq!(half_sec.as_micros(), 500_000);
        let doubled = half_sec * 2;
        assert_eq!(doubled, Duration::SECOND);
    }

    #[test]
    fn timestamp_ordering_and_subtraction() {
        let t0 = Timestamp::from_micros(1_000);
        let t1 = t0 + Duration::from_micros(500);
        assert!(t1 > t0);
        assert_eq!(t1 - t0, Duration::from_micros(500));
    }

    #[test]
    fn max_picks_the_larger_duration() {
        let a = Duration::from_micros(100);
        let b = Duration::from_micros(50);
        assert_eq!(a.max(b), a);
        assert_eq!(b.max(a), a);
    }
}
