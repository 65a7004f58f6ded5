use std::sync::Arc;

use comms::{
    Key, Result,
    msg::{PullRequest, PullResponse, PushRequest},
    node::NodeId,
};
use log::debug;
use parking_lot::Mutex;

use crate::{
    storage::{Combiner, ParameterShard},
    synchronization::{Admission, ClockState, ClockTable, Synchronizer},
};

/// A pull the synchronizer is holding back.
#[derive(Debug)]
struct Deferred {
    worker: NodeId,
    request: PullRequest,
}

#[derive(Debug)]
struct State<C: Combiner, S: Synchronizer> {
    shard: ParameterShard<C>,
    clocks: ClockTable,
    synchronizer: S,
    deferred: Vec<Deferred>,
}

impl<C: Combiner, S: Synchronizer> State<C, S> {
    /// Reads the requested keys and records the pull.
    fn answer(&mut self, worker: NodeId, request: PullRequest) -> Result<PullResponse> {
        let values = self.shard.read_batch(&request.keys)?;
        self.clocks.record_pull(worker, request.clock);

        Ok(PullResponse {
            request_id: request.request_id,
            keys: request.keys,
            values,
        })
    }

    /// Answers every deferred pull that became admissible, in arrival order.
    fn release(&mut self) -> Vec<(NodeId, PullResponse)> {
        let mut released = Vec::new();
        let mut waiting = Vec::new();

        for Deferred { worker, request } in std::mem::take(&mut self.deferred) {
            match self.synchronizer.admit(request.clock, &self.clocks) {
                Admission::Free => match self.answer(worker, request) {
                    Ok(response) => released.push((worker, response)),
                    // ownership was checked before deferring
                    Err(e) => debug!(worker = worker; "dropping deferred pull: {e}"),
                },
                Admission::Waiting => waiting.push(Deferred { worker, request }),
            }
        }

        self.deferred = waiting;
        released
    }
}

/// The shared interface to a server's shard and its consistency state.
///
/// Every operation runs under a single lock, so a push is applied as a whole
/// with respect to any pull.
pub struct StoreHandle<C: Combiner, S: Synchronizer>(Arc<Mutex<State<C, S>>>);

impl<C: Combiner, S: Synchronizer> Clone for StoreHandle<C, S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<C: Combiner, S: Synchronizer> StoreHandle<C, S> {
    /// Creates a new `StoreHandle`.
    ///
    /// # Arguments
    /// * `shard` - The keys owned by this server.
    /// * `clocks` - The progress table of every worker.
    /// * `synchronizer` - The consistency policy of the job.
    pub fn new(shard: ParameterShard<C>, clocks: ClockTable, synchronizer: S) -> Self {
        let state = State {
            shard,
            clocks,
            synchronizer,
            deferred: Vec::new(),
        };

        Self(Arc::new(Mutex::new(state)))
    }

    /// Applies a push from `worker`.
    ///
    /// The whole request is validated first, a rejected push writes nothing.
    ///
    /// # Returns
    /// The deferred pulls this push unblocked, or the reason of the rejection.
    pub fn push(
        &self,
        worker: NodeId,
        request: &PushRequest,
    ) -> Result<Vec<(NodeId, PullResponse)>> {
        let mut state = self.0.lock();
        let state = &mut *state;

        state.clocks.check_push(worker, request.clock)?;
        state.shard.apply_batch(&request.keys, &request.values)?;
        state.clocks.record_push(worker, request.clock);
        state.synchronizer.on_push(&state.clocks);

        if state.deferred.is_empty() {
            return Ok(Vec::new());
        }

        Ok(state.release())
    }

    /// Serves a pull from `worker`.
    ///
    /// # Returns
    /// The response if the pull is admitted now, `None` if it was deferred
    /// until enough pushes arrive, or `PsError::UnknownKey`.
    pub fn pull(&self, worker: NodeId, request: PullRequest) -> Result<Option<PullResponse>> {
        let mut state = self.0.lock();

        for &key in &request.keys {
            state.shard.check_owned(key)?;
        }

        match state.synchronizer.admit(request.clock, &state.clocks) {
            Admission::Free => state.answer(worker, request).map(Some),
            Admission::Waiting => {
                debug!(worker = worker, clock = request.clock; "deferring pull");
                state.deferred.push(Deferred { worker, request });
                Ok(None)
            }
        }
    }

    /// Forgets every pull deferred on behalf of `worker`.
    ///
    /// # Returns
    /// The amount of dropped pulls.
    pub fn drop_deferred(&self, worker: NodeId) -> usize {
        let mut state = self.0.lock();
        let before = state.deferred.len();
        state.deferred.retain(|d| d.worker != worker);
        before - state.deferred.len()
    }

    /// The amount of pulls currently held back.
    pub fn deferred(&self) -> usize {
        self.0.lock().deferred.len()
    }

    /// The current value of `key`.
    pub fn get(&self, key: Key) -> Result<Vec<f32>> {
        self.0.lock().shard.get(key)
    }

    pub fn clock_of(&self, worker: NodeId) -> Option<ClockState> {
        self.0.lock().clocks.get(worker)
    }
}
