//! Connect-failure embargo.
//!
//! A pool-wide cooldown applied after failed connection attempts so that a
//! struggling host is not hammered by every slot at once. The level starts
//! at zero, jumps to the configured base on the first failure, doubles on
//! repeated failures and resets on the first successful establishment.

use std::time::Duration;

use rand::Rng;

/// Pool-wide connect backoff state.
#[derive(Debug)]
pub(crate) struct Embargo {
    current: Duration,
    base: Duration,
    /// Ceiling for the doubling base. Jitter adds up to the same amount
    /// again, so this is half the configured maximum backoff.
    cap: Duration,
}

impl Embargo {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        let cap = max / 2;
        Self {
            current: Duration::ZERO,
            base: base.min(cap),
            cap,
        }
    }

    /// The current embargo level.
    pub(crate) fn level(&self) -> Duration {
        self.current
    }

    /// Record a failed connection attempt that began when the embargo was
    /// at `attempt_level`. Returns `true` if the level changed.
    ///
    /// Only the first failure from the current level escalates; failures of
    /// attempts started under an older level report in late and must not
    /// double the backoff again.
    pub(crate) fn on_attempt_failed(&mut self, attempt_level: Duration) -> bool {
        if self.current.is_zero() {
            self.current = self.base;
            !self.current.is_zero()
        } else if self.current == attempt_level {
            let next = (self.current * 2).min(self.cap);
            let changed = next != self.current;
            self.current = next;
            changed
        } else {
            false
        }
    }

    /// Record a successful establishment. Returns `true` if the level
    /// changed (was nonzero).
    pub(crate) fn on_attempt_succeeded(&mut self) -> bool {
        let changed = !self.current.is_zero();
        self.current = Duration::ZERO;
        changed
    }

    /// The wait a slot must observe before its next connection attempt:
    /// the level plus up to the same amount of jitter.
    pub(crate) fn jittered_wait(level: Duration) -> Duration {
        if level.is_zero() {
            return Duration::ZERO;
        }
        let jitter_ns = rand::thread_rng().gen_range(0..level.as_nanos().max(1)) as u64;
        level + Duration::from_nanos(jitter_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(2);

    #[test]
    fn test_escalation_sequence() {
        let mut embargo = Embargo::new(BASE, MAX);
        assert_eq!(embargo.level(), Duration::ZERO);

        assert!(embargo.on_attempt_failed(Duration::ZERO));
        assert_eq!(embargo.level(), Duration::from_millis(100));

        assert!(embargo.on_attempt_failed(Duration::from_millis(100)));
        assert_eq!(embargo.level(), Duration::from_millis(200));

        assert!(embargo.on_attempt_failed(Duration::from_millis(200)));
        assert_eq!(embargo.level(), Duration::from_millis(400));
    }

    #[test]
    fn test_caps_at_half_max() {
        let mut embargo = Embargo::new(BASE, MAX);
        let mut level = Duration::ZERO;
        for _ in 0..20 {
            embargo.on_attempt_failed(level);
            level = embargo.level();
        }
        assert_eq!(embargo.level(), MAX / 2);
    }

    #[test]
    fn test_stale_attempt_does_not_escalate() {
        let mut embargo = Embargo::new(BASE, MAX);
        embargo.on_attempt_failed(Duration::ZERO);
        embargo.on_attempt_failed(Duration::from_millis(100));
        assert_eq!(embargo.level(), Duration::from_millis(200));

        // An attempt that started back at 100ms fails late; another slot
        // already escalated past it.
        assert!(!embargo.on_attempt_failed(Duration::from_millis(100)));
        assert_eq!(embargo.level(), Duration::from_millis(200));
    }

    #[test]
    fn test_success_resets() {
        let mut embargo = Embargo::new(BASE, MAX);
        embargo.on_attempt_failed(Duration::ZERO);
        assert!(embargo.on_attempt_succeeded());
        assert_eq!(embargo.level(), Duration::ZERO);
        assert!(!embargo.on_attempt_succeeded());
    }

    #[test]
    fn test_jitter_bounds() {
        let level = Duration::from_millis(100);
        for _ in 0..100 {
            let wait = Embargo::jittered_wait(level);
            assert!(wait >= level);
            assert!(wait < level * 2);
        }
        assert_eq!(Embargo::jittered_wait(Duration::ZERO), Duration::ZERO);
    }
}
