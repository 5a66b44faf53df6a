//! Idle reaper state machine
//!
//! ```text
//!             empty tick               empty tick
//!   Active ───────────────▶ GracePeriod ──────────▶ Closing
//!     ▲                         │
//!     └──── any use ────────────┘
//! ```
//!
//! "Use" is a pending acquisition or any attached consumer. A session is only
//! closed on the second consecutive empty tick, so a consumer that has been
//! handed the session but has not registered yet always gets one full interval.
//! The machine is pure; the registry drives it from a `tokio::time::interval`.

/// Hysteresis state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperState {
    Active,
    /// One empty tick seen
    GracePeriod,
    /// Terminal: the session should be closed
    Closing,
}

/// Snapshot the reaper looks at on each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub pending_user_count: usize,
    pub has_consumers: bool,
}

impl Occupancy {
    pub fn idle() -> Self {
        Self {
            pending_user_count: 0,
            has_consumers: false,
        }
    }

    fn in_use(&self) -> bool {
        self.pending_user_count > 0 || self.has_consumers
    }
}

#[derive(Debug)]
pub struct IdleReaper {
    state: ReaperState,
}

impl IdleReaper {
    pub fn new() -> Self {
        Self {
            state: ReaperState::Active,
        }
    }

    pub fn state(&self) -> ReaperState {
        self.state
    }

    /// Advance one tick. Returns the new state.
    pub fn tick(&mut self, occupancy: Occupancy) -> ReaperState {
        self.state = match (self.state, occupancy.in_use()) {
            (ReaperState::Closing, _) => ReaperState::Closing,
            (_, true) => ReaperState::Active,
            (ReaperState::Active, false) => ReaperState::GracePeriod,
            (ReaperState::GracePeriod, false) => ReaperState::Closing,
        };
        self.state
    }
}

impl Default for IdleReaper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> Occupancy {
        Occupancy {
            pending_user_count: 0,
            has_consumers: true,
        }
    }

    #[test]
    fn test_closes_on_second_empty_tick() {
        let mut reaper = IdleReaper::new();
        assert_eq!(reaper.tick(Occupancy::idle()), ReaperState::GracePeriod);
        assert_eq!(reaper.tick(Occupancy::idle()), ReaperState::Closing);
        // Closing is terminal
        assert_eq!(reaper.tick(busy()), ReaperState::Closing);
    }

    #[test]
    fn test_use_between_ticks_rescues() {
        let mut reaper = IdleReaper::new();
        reaper.tick(Occupancy::idle());
        assert_eq!(reaper.tick(busy()), ReaperState::Active);
        assert_eq!(reaper.tick(Occupancy::idle()), ReaperState::GracePeriod);
    }

    #[test]
    fn test_pending_counts_as_use() {
        let mut reaper = IdleReaper::new();
        reaper.tick(Occupancy::idle());
        let pending = Occupancy {
            pending_user_count: 1,
            has_consumers: false,
        };
        assert_eq!(reaper.tick(pending), ReaperState::Active);
    }
}
