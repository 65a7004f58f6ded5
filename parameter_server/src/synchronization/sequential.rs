use log::debug;

use super::{Admission, ClockTable, Synchronizer};

/// Bulk synchronous rounds: a pull stamped with clock `c` waits until every
/// worker pushed for round `c`.
///
/// An admitted pull is answered with the current values, so it may also see
/// pushes for round `c + 1` from workers that already got their own answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialSync {
    completed: u64,
}

impl SequentialSync {
    /// Creates a new `SequentialSync` synchronizer, no round completed yet.
    pub fn new() -> Self {
        Self { completed: 0 }
    }

    /// The amount of rounds every worker pushed for.
    pub fn completed(&self) -> u64 {
        self.completed
    }
}

impl Synchronizer for SequentialSync {
    fn admit(&self, clock: u64, _clocks: &ClockTable) -> Admission {
        if self.completed >= clock {
            Admission::Free
        } else {
            Admission::Waiting
        }
    }

    fn on_push(&mut self, clocks: &ClockTable) {
        while clocks.min_pushed() > self.completed {
            self.completed += 1;
            debug!(round = self.completed; "round completed");
        }
    }
}
