use comms::{
    PsError, Result,
    msg::{Msg, PullRequest, PushRequest, Rejection},
    node::{NodeId, SCHEDULER_ID},
    transport::{Envelope, Event, Inbox, Outbox},
};
use log::{debug, info, warn};

use crate::{
    service::Server,
    storage::{Combiner, StoreHandle},
    synchronization::Synchronizer,
};

/// A server node's request loop.
///
/// Requests are handled one at a time in arrival order, so pushes coming from
/// the same worker are applied in the order they were sent.
pub struct ParameterServer<C: Combiner, S: Synchronizer> {
    id: NodeId,
    handle: StoreHandle<C, S>,
    outbox: Outbox,
}

impl<C: Combiner, S: Synchronizer> ParameterServer<C, S> {
    /// Creates a new `ParameterServer`.
    ///
    /// # Arguments
    /// * `handle` - The store of this server.
    /// * `outbox` - The sending half of this node's transport.
    pub fn new(handle: StoreHandle<C, S>, outbox: Outbox) -> Self {
        Self {
            id: outbox.local(),
            handle,
            outbox,
        }
    }

    pub fn handle(&self) -> &StoreHandle<C, S> {
        &self.handle
    }

    /// Handles requests until the scheduler sends `Shutdown`.
    ///
    /// # Returns
    /// `PsError::Link` if the link to the scheduler breaks first.
    pub async fn serve(&mut self, inbox: &mut Inbox) -> Result<()> {
        info!(server = self.id; "serving requests");

        while let Some(event) = inbox.recv().await {
            match event {
                Event::Message(Envelope { source, msg }) => {
                    if self.handle_msg(source, msg) {
                        break;
                    }
                }
                Event::LinkDown { peer, reason } if peer == SCHEDULER_ID => {
                    warn!(server = self.id; "lost the scheduler: {reason}");
                    return Err(PsError::link(peer, reason));
                }
                Event::LinkDown { peer, reason } => {
                    let dropped = self.handle.drop_deferred(peer);
                    info!(server = self.id, peer = peer, dropped = dropped; "link down: {reason}");
                }
            }
        }

        let dropped = self.handle.deferred();
        if dropped > 0 {
            warn!(server = self.id, dropped = dropped; "stopping with pulls still deferred");
        }

        info!(server = self.id; "stopped serving");
        Ok(())
    }

    /// Dispatches a single message.
    ///
    /// # Returns
    /// Whether the server must stop.
    fn handle_msg(&self, source: NodeId, msg: Msg) -> bool {
        match msg {
            Msg::Push(request) => self.on_push(source, request),
            Msg::Pull(request) => self.on_pull(source, request),
            Msg::Shutdown if source == SCHEDULER_ID => return true,
            Msg::Heartbeat => {}
            msg => warn!(
                server = self.id,
                peer = source,
                kind = msg.kind_name();
                "unexpected message"
            ),
        }

        false
    }

    fn on_push(&self, worker: NodeId, request: PushRequest) {
        let request_id = request.request_id;

        match self.handle.push(worker, &request) {
            Ok(released) => {
                debug!(worker = worker, request_id = request_id, keys = request.keys.len(); "push applied");
                self.reply(worker, Msg::PushAck(request_id));

                for (peer, response) in released {
                    self.reply(peer, Msg::PullResponse(response));
                }
            }
            Err(e) => self.reject(worker, request_id, &e),
        }
    }

    fn on_pull(&self, worker: NodeId, request: PullRequest) {
        let request_id = request.request_id;

        match self.handle.pull(worker, request) {
            Ok(Some(response)) => self.reply(worker, Msg::PullResponse(response)),
            Ok(None) => {}
            Err(e) => self.reject(worker, request_id, &e),
        }
    }

    fn reject(&self, worker: NodeId, request_id: u64, err: &PsError) {
        warn!(server = self.id, worker = worker, request_id = request_id; "rejecting request: {err}");
        self.reply(worker, Msg::Err(Rejection::from_error(request_id, err)));
    }

    fn reply(&self, peer: NodeId, msg: Msg) {
        if let Err(e) = self.outbox.send(peer, msg) {
            warn!(server = self.id; "failed to reply: {e}");
        }
    }
}

#[async_trait::async_trait]
impl<C, S> Server for ParameterServer<C, S>
where
    C: Combiner + 'static,
    S: Synchronizer + 'static,
{
    /// Indirection call to `Self::serve`.
    async fn serve(&mut self, inbox: &mut Inbox) -> Result<()> {
        self.serve(inbox).await
    }

    fn deferred(&self) -> usize {
        self.handle.deferred()
    }
}
