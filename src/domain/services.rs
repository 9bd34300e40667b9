//! External services for the session engine.
//!
//! Services provide external dependencies (like time) to the engine
//! without coupling it to specific implementations.

use crate::domain::types::TimestampUtc;
use chrono::Utc;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

/// Wall-clock source. Session validity is a pure function of this clock.
pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> TimestampUtc;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the system time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimestampUtc {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used to test expiry boundaries.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<TimestampUtc>>,
}

impl ManualClock {
    pub fn new(start: TimestampUtc) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: TimestampUtc) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimestampUtc {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Returns a shared system clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));

        let shared: SharedClock = Arc::new(clock.clone());
        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(shared.now(), start + chrono::Duration::seconds(100));
    }
}
