use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, to: SystemTime) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Whole seconds since the unix epoch, saturating at zero for earlier times.
#[must_use]
pub fn unix_seconds(value: SystemTime) -> u64 {
    value
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[must_use]
pub fn from_unix_seconds(value: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let start = from_unix_seconds(1_700_000_000);
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(2 * 24 * 60 * 60));
        assert_eq!(unix_seconds(clock.now()), 1_700_000_000 + 172_800);

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn unix_seconds_saturates_before_epoch() {
        let before = SystemTime::UNIX_EPOCH - Duration::from_secs(10);
        assert_eq!(unix_seconds(before), 0);
    }
}
