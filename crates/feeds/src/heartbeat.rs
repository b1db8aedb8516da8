//! Heartbeat liveness counter for feeds that emit periodic heartbeat frames.

use std::time::Duration;

/// Counter value after a heartbeat frame arrives.
pub const HEARTBEAT_INIT_COUNTER: i64 = 2;

/// How often the counter is decremented.
pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Decrementing liveness counter.
///
/// The feed handler calls [`reset`](Self::reset) on every heartbeat frame and
/// [`decrease`](Self::decrease) on a timer independent of frame arrival. The
/// feed is considered lost once the counter reaches zero.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    counter: i64,
    init: i64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::with_initial(HEARTBEAT_INIT_COUNTER)
    }

    pub fn with_initial(init: i64) -> Self {
        Self { counter: init, init }
    }

    pub fn reset(&mut self) {
        self.counter = self.init;
    }

    pub fn decrease(&mut self) {
        self.counter -= 1;
    }

    pub fn is_lost(&self) -> bool {
        self.counter <= 0
    }

    pub fn counter(&self) -> i64 {
        self.counter
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_lost_after_missed_checks() {
        let mut hb = Heartbeat::new();
        assert!(!hb.is_lost());
        hb.decrease();
        assert!(!hb.is_lost());
        hb.decrease();
        assert!(hb.is_lost());
        hb.decrease();
        assert!(hb.is_lost());
    }

    #[test]
    fn test_heartbeat_reset_restores_initial() {
        let mut hb = Heartbeat::new();
        for _ in 0..5 {
            hb.decrease();
        }
        assert_eq!(hb.counter(), HEARTBEAT_INIT_COUNTER - 5);

        hb.reset();
        assert_eq!(hb.counter(), HEARTBEAT_INIT_COUNTER);
        assert!(!hb.is_lost());
    }

    #[test]
    fn test_custom_initial_counter() {
        let mut hb = Heartbeat::with_initial(1);
        hb.decrease();
        assert!(hb.is_lost());
    }
}
