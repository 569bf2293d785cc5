use crate::config::ApplicationSpec;
use std::time::Duration;

/// Crash-restart policy of one application
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    /// Consecutive crash-restarts allowed before giving up
    pub max_restarts: usize,
    /// Delay before the first restart of a crash streak
    pub initial_delay: Duration,
    /// Upper bound for the exponential backoff
    pub max_delay: Duration,
    /// Uptime after which a crash no longer counts as part of a streak
    pub min_uptime: Duration,
}

impl RestartPolicy {
    pub fn from_spec(spec: &ApplicationSpec) -> Self {
        Self {
            enabled: spec.autorestart,
            max_restarts: spec.max_restarts,
            initial_delay: spec.restart_delay,
            max_delay: spec.max_restart_delay,
            min_uptime: spec.min_uptime,
        }
    }

    /// Exponential backoff: `initial * 2^streak`, capped at `max_delay`
    pub fn backoff(&self, streak: usize) -> Duration {
        let factor = 2_u32.saturating_pow(streak.min(31) as u32);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What the controller should do after a crash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after the given delay
    Restart(Duration),
    /// Automatic restart is disabled
    Disabled,
    /// The crash streak hit `max_restarts`
    GiveUp,
}

/// Tracks the current streak of consecutive crash-restarts for one instance
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    streak: usize,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide the next step after a crash of a process that ran for `uptime`.
    ///
    /// A process that stayed up for `min_uptime` is considered healthy, so
    /// its crash starts a new streak with the initial delay.
    pub fn on_crash(&mut self, policy: &RestartPolicy, uptime: Duration) -> RestartDecision {
        if !policy.enabled {
            return RestartDecision::Disabled;
        }

        if uptime >= policy.min_uptime {
            self.streak = 0;
        }

        if self.streak >= policy.max_restarts {
            return RestartDecision::GiveUp;
        }

        let delay = policy.backoff(self.streak);
        self.streak += 1;
        RestartDecision::Restart(delay)
    }

    /// Consecutive crash-restarts in the current streak
    pub fn streak(&self) -> usize {
        self.streak
    }

    /// Forget the streak (manual restart)
    pub fn clear(&mut self) {
        self.streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy {
            enabled: true,
            max_restarts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            min_uptime: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_backoff_exponential_and_capped() {
        let policy = policy();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(usize::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_delays_non_decreasing() {
        let policy = policy();
        let mut tracker = RestartTracker::new();
        let mut last = Duration::from_secs(0);

        for _ in 0..policy.max_restarts {
            match tracker.on_crash(&policy, Duration::from_millis(10)) {
                RestartDecision::Restart(delay) => {
                    assert!(delay >= last);
                    assert!(delay <= policy.max_delay);
                    last = delay;
                }
                other => panic!("unexpected decision {:?}", other),
            }
        }
    }

    #[test]
    fn test_gives_up_after_max_restarts() {
        let policy = policy();
        let mut tracker = RestartTracker::new();

        for _ in 0..5 {
            assert!(matches!(
                tracker.on_crash(&policy, Duration::ZERO),
                RestartDecision::Restart(_)
            ));
        }
        assert_eq!(tracker.on_crash(&policy, Duration::ZERO), RestartDecision::GiveUp);
    }

    #[test]
    fn test_healthy_uptime_resets_streak() {
        let policy = policy();
        let mut tracker = RestartTracker::new();

        tracker.on_crash(&policy, Duration::ZERO);
        tracker.on_crash(&policy, Duration::ZERO);
        tracker.on_crash(&policy, Duration::ZERO);
        assert_eq!(tracker.streak(), 3);

        let decision = tracker.on_crash(&policy, Duration::from_secs(60));
        assert_eq!(decision, RestartDecision::Restart(Duration::from_millis(100)));
        assert_eq!(tracker.streak(), 1);
    }

    #[test]
    fn test_disabled_policy() {
        let mut policy = policy();
        policy.enabled = false;
        let mut tracker = RestartTracker::new();
        assert_eq!(tracker.on_crash(&policy, Duration::ZERO), RestartDecision::Disabled);
        assert_eq!(tracker.streak(), 0);
    }

    #[test]
    fn test_clear() {
        let policy = policy();
        let mut tracker = RestartTracker::new();
        tracker.on_crash(&policy, Duration::ZERO);
        tracker.clear();
        assert_eq!(tracker.streak(), 0);
    }
}
