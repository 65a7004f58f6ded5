use std::collections::HashMap;

use comms::{PsError, Result, node::NodeId};

/// What a server knows of one worker's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockState {
    /// The clock of the last applied push.
    pub pushed: u64,
    /// The clock of the last answered pull.
    pub pulled: u64,
}

/// The progress of every worker in the job, as seen by one server.
#[derive(Debug, Clone)]
pub struct ClockTable {
    states: HashMap<NodeId, ClockState>,
}

impl ClockTable {
    /// Creates a new `ClockTable` with every worker at clock `0`.
    ///
    /// # Arguments
    /// * `workers` - The id of every worker declared in the cluster.
    pub fn new(workers: &[NodeId]) -> Self {
        let states = workers
            .iter()
            .map(|&id| (id, ClockState::default()))
            .collect();

        Self { states }
    }

    pub fn get(&self, worker: NodeId) -> Option<ClockState> {
        self.states.get(&worker).copied()
    }

    pub fn workers(&self) -> usize {
        self.states.len()
    }

    /// Checks whether a push from `worker` stamped with `clock` may be applied.
    ///
    /// # Returns
    /// `PsError::Protocol` for undeclared workers or regressing clocks.
    pub fn check_push(&self, worker: NodeId, clock: u64) -> Result<()> {
        let state = self
            .states
            .get(&worker)
            .ok_or_else(|| PsError::Protocol(format!("node {worker} is not a declared worker")))?;

        if clock < state.pushed {
            return Err(PsError::Protocol(format!(
                "push clock of worker {worker} went back from {} to {clock}",
                state.pushed
            )));
        }

        Ok(())
    }

    /// Records an applied push, `ClockTable::check_push` must have passed.
    pub fn record_push(&mut self, worker: NodeId, clock: u64) {
        if let Some(state) = self.states.get_mut(&worker) {
            state.pushed = state.pushed.max(clock);
        }
    }

    /// Records an answered pull.
    pub fn record_pull(&mut self, worker: NodeId, clock: u64) {
        if let Some(state) = self.states.get_mut(&worker) {
            state.pulled = state.pulled.max(clock);
        }
    }

    /// The push clock of the slowest worker.
    pub fn min_pushed(&self) -> u64 {
        self.states.values().map(|s| s.pushed).min().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_worker_starts_at_zero() {
        let table = ClockTable::new(&[3, 4]);

        assert_eq!(table.get(3), Some(ClockState::default()));
        assert_eq!(table.get(9), None);
        assert_eq!(table.min_pushed(), 0);
    }

    #[test]
    fn tracks_the_slowest_worker() {
        let mut table = ClockTable::new(&[3, 4, 5]);

        table.record_push(3, 2);
        table.record_push(4, 1);
        assert_eq!(table.min_pushed(), 0);

        table.record_push(5, 4);
        assert_eq!(table.min_pushed(), 1);
    }

    #[test]
    fn rejects_regressions_and_strangers() {
        let mut table = ClockTable::new(&[3]);
        table.record_push(3, 5);

        assert!(table.check_push(3, 5).is_ok());
        assert!(matches!(table.check_push(3, 4), Err(PsError::Protocol(_))));
        assert!(matches!(table.check_push(8, 1), Err(PsError::Protocol(_))));
    }

    #[test]
    fn pulls_only_move_forward() {
        let mut table = ClockTable::new(&[3]);

        table.record_pull(3, 4);
        table.record_pull(3, 2);

        assert_eq!(table.get(3).unwrap().pulled, 4);
    }
}
