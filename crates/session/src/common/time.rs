use std::sync::atomic;
use std::time::{SystemTime, UNIX_EPOCH};

/// Local time, in milliseconds since Epoch.
///
/// This clock is monotonic.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default)]
pub struct LocalTime {
    millis: u64,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.millis)
    }
}

impl LocalTime {
    /// Construct a local time from the current system time.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).as_millis();
        let last = LAST.load(atomic::Ordering::SeqCst);

        // If the current time is in the past, return the last recorded time instead.
        if now < last {
            Self::from_millis(last)
        } else {
            LAST.store(now, atomic::Ordering::SeqCst);
            LocalTime::from_millis(now)
        }
    }

    /// Construct a local time from whole milliseconds since Epoch.
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    /// Milliseconds since Epoch.
    pub const fn as_millis(&self) -> u64 {
        self.millis
    }

    /// Get the duration since the given time, or zero if `earlier` is later than `self`.
    pub fn duration_since(&self, earlier: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(earlier.millis))
    }
}

/// Convert a `SystemTime` into a local time.
impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let millis = system
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self { millis }
    }
}

/// Substract two local times. Yields a duration.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

/// Add a duration to a local time. Yields a local time.
impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis + other.0,
        }
    }
}

/// Time duration as measured locally.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u64);

impl LocalDuration {
    /// Maximum duration.
    pub const MAX: LocalDuration = LocalDuration(u64::MAX);

    /// Create a new duration from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    /// Construct a new duration from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Return the number of seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Return the number of milliseconds in this duration.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < 1000 {
            write!(f, "{} millisecond(s)", self.as_millis())
        } else {
            let fraction = self.as_millis() % 1000;
            if fraction > 0 {
                write!(f, "{}.{} second(s)", self.as_secs(), fraction)
            } else {
                write!(f, "{} second(s)", self.as_secs())
            }
        }
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0 + other.0)
    }
}

impl std::ops::Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: u64) -> LocalDuration {
        LocalDuration(self.0 * other)
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_millis(other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_arithmetic() {
        let t = LocalTime::from_millis(10_000);
        let later = t + LocalDuration::from_secs(5);

        assert_eq!(later - t, LocalDuration::from_millis(5000));
        assert_eq!(t - later, LocalDuration::from_millis(0));
        assert_eq!(t.duration_since(later), LocalDuration::default());
    }

    #[test]
    fn test_duration_display() {
        assert_eq!(LocalDuration::from_millis(15).to_string(), "15 millisecond(s)");
        assert_eq!(LocalDuration::from_secs(5).to_string(), "5 second(s)");
        assert_eq!(LocalDuration::from_millis(1500).to_string(), "1.500 second(s)");
    }
}
