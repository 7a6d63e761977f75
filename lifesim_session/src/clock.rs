// Shared logical game clock.
//
// The surrounding game loop owns time: it advances this clock as in-game hours
// pass, and the session stamps registry entries, chat and death messages with
// the current reading. Cloning the handle shares the same counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lifesim_protocol::LogicalTime;

#[derive(Clone, Debug, Default)]
pub struct GameClock {
    minutes: Arc<AtomicU64>,
}

impl GameClock {
    pub fn starting_at(start: LogicalTime) -> Self {
        Self {
            minutes: Arc::new(AtomicU64::new(start.0)),
        }
    }

    pub fn now(&self) -> LogicalTime {
        LogicalTime(self.minutes.load(Ordering::SeqCst))
    }

    pub fn set(&self, at: LogicalTime) {
        self.minutes.store(at.0, Ordering::SeqCst);
    }

    /// Move the clock forward and return the new reading.
    pub fn advance(&self, minutes: u64) -> LogicalTime {
        let prev = self.minutes.fetch_add(minutes, Ordering::SeqCst);
        LogicalTime(prev).plus_minutes(minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_same_time() {
        let clock = GameClock::starting_at(LogicalTime(6 * 60));
        let other = clock.clone();
        assert_eq!(clock.advance(90), LogicalTime(7 * 60 + 30));
        assert_eq!(other.now(), LogicalTime(7 * 60 + 30));
        other.set(LogicalTime(0));
        assert_eq!(clock.now(), LogicalTime(0));
    }
}
