use super::{Admission, ClockTable, Synchronizer};

/// Lets a worker run at most `staleness` rounds ahead of the slowest one.
///
/// A pull stamped with clock `c` is admitted once every worker applied a push
/// stamped with at least `c - staleness - 1`.
#[derive(Debug, Clone, Copy)]
pub struct BoundedDelaySync {
    staleness: u64,
}

impl BoundedDelaySync {
    /// Creates a new `BoundedDelaySync` synchronizer.
    ///
    /// # Arguments
    /// * `staleness` - The amount of rounds a worker may be ahead.
    pub fn new(staleness: u64) -> Self {
        Self { staleness }
    }

    /// The slowest push clock a pull stamped with `clock` needs.
    fn required(&self, clock: u64) -> u64 {
        clock.saturating_sub(self.staleness.saturating_add(1))
    }
}

impl Synchronizer for BoundedDelaySync {
    fn admit(&self, clock: u64, clocks: &ClockTable) -> Admission {
        if clocks.min_pushed() >= self.required(clock) {
            Admission::Free
        } else {
            Admission::Waiting
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(clocks: &[u64]) -> ClockTable {
        let ids: Vec<_> = (0..clocks.len() as u32).collect();
        let mut table = ClockTable::new(&ids);

        for (&id, &clock) in ids.iter().zip(clocks) {
            table.record_push(id, clock);
        }

        table
    }

    #[test]
    fn one_round_of_slack() {
        let sync = BoundedDelaySync::new(1);

        assert_eq!(sync.admit(5, &table(&[5, 3])), Admission::Free);
        assert_eq!(sync.admit(5, &table(&[5, 2])), Admission::Waiting);
    }

    #[test]
    fn early_clocks_never_wait() {
        let sync = BoundedDelaySync::new(2);

        for clock in 0..=3 {
            assert_eq!(sync.admit(clock, &table(&[clock, 0])), Admission::Free);
        }

        assert_eq!(sync.admit(4, &table(&[4, 0])), Admission::Waiting);
    }

    #[test]
    fn zero_staleness_waits_for_the_previous_round() {
        let sync = BoundedDelaySync::new(0);

        assert_eq!(sync.admit(3, &table(&[3, 2])), Admission::Free);
        assert_eq!(sync.admit(3, &table(&[3, 1])), Admission::Waiting);
    }
}
