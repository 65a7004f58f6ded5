use std::{collections::HashMap, sync::Arc};

use comms::{
    PsError, Result,
    msg::{PullResponse, RequestId},
    node::NodeId,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// What a server answers to a single request.
#[derive(Debug)]
pub(crate) enum Reply {
    Ack,
    Values(PullResponse),
}

type Slot = oneshot::Sender<Result<Reply>>;

/// The requests waiting for an answer, keyed by server and request id.
#[derive(Clone, Default)]
pub(crate) struct Pending(Arc<Mutex<HashMap<(NodeId, RequestId), Slot>>>);

impl Pending {
    /// Registers a request towards `server`, replacing any previous attempt.
    ///
    /// # Returns
    /// Where the answer will be delivered.
    pub fn register(
        &self,
        server: NodeId,
        request_id: RequestId,
    ) -> oneshot::Receiver<Result<Reply>> {
        let (tx, rx) = oneshot::channel();
        self.0.lock().insert((server, request_id), tx);
        rx
    }

    pub fn remove(&self, server: NodeId, request_id: RequestId) {
        self.0.lock().remove(&(server, request_id));
    }

    /// Hands `reply` to whoever waits for it.
    ///
    /// # Returns
    /// `false` if nobody was waiting, the request timed out or never existed.
    pub fn resolve(&self, server: NodeId, request_id: RequestId, reply: Result<Reply>) -> bool {
        let Some(slot) = self.0.lock().remove(&(server, request_id)) else {
            return false;
        };

        slot.send(reply).is_ok()
    }

    /// Fails every request towards `server` with a `PsError::Link`.
    ///
    /// # Returns
    /// The amount of failed requests.
    pub fn fail_server(&self, server: NodeId, reason: &str) -> usize {
        let failed: Vec<_> = {
            let mut slots = self.0.lock();
            let keys: Vec<_> = slots.keys().filter(|(s, _)| *s == server).copied().collect();
            keys.into_iter().filter_map(|key| slots.remove(&key)).collect()
        };

        let count = failed.len();
        for slot in failed {
            let _ = slot.send(Err(PsError::link(server, reason)));
        }

        count
    }

    /// Drops every pending request, their receivers observe a closed channel.
    pub fn clear(&self) {
        self.0.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_only_the_matching_request() {
        let pending = Pending::default();

        let first = pending.register(1, 10);
        let second = pending.register(2, 10);

        assert!(pending.resolve(1, 10, Ok(Reply::Ack)));
        assert!(!pending.resolve(1, 10, Ok(Reply::Ack)));

        assert!(matches!(first.await, Ok(Ok(Reply::Ack))));
        assert_eq!(pending.len(), 1);
        drop(second);
    }

    #[tokio::test]
    async fn failing_a_server_spares_the_others() {
        let pending = Pending::default();

        let a = pending.register(1, 1);
        let b = pending.register(1, 2);
        let c = pending.register(2, 3);

        assert_eq!(pending.fail_server(1, "reset"), 2);

        for rx in [a, b] {
            assert!(matches!(rx.await, Ok(Err(PsError::Link { peer: 1, .. }))));
        }

        assert_eq!(pending.len(), 1);
        pending.clear();
        assert!(c.await.is_err());
    }
}
