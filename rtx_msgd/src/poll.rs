//! Adaptive poll interval.
//!
//! Draining anything snaps the interval back to the minimum; every idle
//! cycle lengthens it by one step, up to the maximum.

use rtx_common::config::MsgdConfig;
use std::time::Duration;

/// Poll interval that decays while the ring stays empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptivePoll {
    min: Duration,
    max: Duration,
    step: Duration,
    current: Duration,
}

impl AdaptivePoll {
    /// Interval starting at `min`.
    pub fn new(min: Duration, max: Duration, step: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            step,
            current: min,
        }
    }

    /// Interval from the daemon settings.
    pub fn from_config(config: &MsgdConfig) -> Self {
        Self::new(
            Duration::from_millis(config.poll_min_ms),
            Duration::from_millis(config.poll_max_ms),
            Duration::from_millis(config.poll_step_ms),
        )
    }

    /// Wait before the next poll.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Account for one poll that drained `records` and return the next wait.
    pub fn after_poll(&mut self, records: usize) -> Duration {
        self.current = if records > 0 {
            self.min
        } else {
            (self.current + self.step).min(self.max)
        };
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn idle_polls_back_off_to_the_cap() {
        let mut poll = AdaptivePoll::new(ms(20), ms(50), ms(10));
        assert_eq!(poll.current(), ms(20));
        assert_eq!(poll.after_poll(0), ms(30));
        assert_eq!(poll.after_poll(0), ms(40));
        assert_eq!(poll.after_poll(0), ms(50));
        assert_eq!(poll.after_poll(0), ms(50));
        assert_eq!(poll.after_poll(3), ms(20));
    }

    #[test]
    fn defaults_follow_the_config() {
        let poll = AdaptivePoll::from_config(&MsgdConfig::default());
        assert_eq!(poll.current(), ms(20));
    }
}
