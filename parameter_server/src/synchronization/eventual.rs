use super::{Admission, ClockTable, Synchronizer};

/// Answers every pull immediately with whatever pushes were applied so far.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventualSync;

impl EventualSync {
    /// Creates a new `EventualSync` synchronizer.
    pub fn new() -> Self {
        Self
    }
}

impl Synchronizer for EventualSync {
    fn admit(&self, _clock: u64, _clocks: &ClockTable) -> Admission {
        Admission::Free
    }
}
