use super::ClockTable;

/// Whether a pull may be answered right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Free,
    Waiting,
}

/// Decides which pulls a server answers, given the progress of every worker.
///
/// A `Synchronizer` is resolved once per job from its consistency policy.
pub trait Synchronizer: Send {
    /// Should decide whether a pull stamped with `clock` can be answered now.
    ///
    /// # Arguments
    /// * `clock` - The clock of the pulling worker.
    /// * `clocks` - The progress of every worker.
    fn admit(&self, clock: u64, clocks: &ClockTable) -> Admission;

    /// Called after every applied push, once `clocks` is up to date.
    ///
    /// # Arguments
    /// * `clocks` - The progress of every worker.
    fn on_push(&mut self, clocks: &ClockTable) {
        let _ = clocks;
    }
}
