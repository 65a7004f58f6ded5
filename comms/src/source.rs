use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::{debug, warn};
use tokio::{io::AsyncRead, sync::mpsc, task::JoinHandle};

use crate::{
    OnoReceiver,
    msg::Msg,
    node::NodeId,
    transport::{Envelope, Event},
};

/// The reading half of a link.
///
/// A dedicated task decodes incoming frames into the node's inbox.
pub(crate) struct Source {
    handle: JoinHandle<()>,
}

impl Source {
    /// Creates a new `Source` and spawns its reading task.
    ///
    /// # Arguments
    /// * `peer` - The node on the other end of the link.
    /// * `rx` - The receiving end of the communication.
    /// * `alive` - Cleared as soon as the link breaks.
    /// * `events` - The node's inbox queue.
    pub fn spawn<R>(
        peer: NodeId,
        rx: OnoReceiver<R>,
        alive: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let handle = tokio::spawn(Self::consume(peer, rx, alive, events));
        Self { handle }
    }

    /// Stops reading, nothing else is delivered from this link afterwards.
    pub fn abort(self) {
        self.handle.abort();
    }

    /// Will read frames from `source`, forwarding them into `sink`.
    async fn consume<R>(
        peer: NodeId,
        mut source: OnoReceiver<R>,
        alive: Arc<AtomicBool>,
        sink: mpsc::UnboundedSender<Event>,
    ) where
        R: AsyncRead + Unpin,
    {
        let reason = loop {
            let (kind, source_id, payload) = match source.recv_frame().await {
                Ok(frame) => frame,
                Err(e) => break format!("read failed: {e}"),
            };

            if source_id != peer {
                warn!(peer = peer, claimed = source_id; "dropping frame with a foreign source id");
                continue;
            }

            let msg = match <Msg as crate::Deserialize>::deserialize(kind, payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(peer = peer; "failed to deserialize message: {e}");
                    continue;
                }
            };

            let envelope = Envelope { source: peer, msg };
            if sink.send(Event::Message(envelope)).is_err() {
                debug!(peer = peer; "inbox closed, stopping source");
                return;
            }
        };

        alive.store(false, Ordering::Release);
        debug!(peer = peer; "link down: {reason}");
        let _ = sink.send(Event::LinkDown { peer, reason });
    }
}
