use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, warn};
use tokio::{io::AsyncWrite, sync::mpsc, task::JoinHandle};

use crate::{OnoSender, msg::Msg, node::NodeId, transport::Event};

/// The writing half of a link.
///
/// Messages are queued without blocking and written in order by a dedicated task.
pub(crate) struct Sink {
    queue: mpsc::UnboundedSender<Msg>,
    handle: JoinHandle<()>,
}

impl Sink {
    /// Creates a new `Sink` and spawns its writing task.
    ///
    /// # Arguments
    /// * `peer` - The node on the other end of the link.
    /// * `tx` - The sending end of the communication.
    /// * `alive` - Cleared as soon as a write fails.
    /// * `events` - Where to report a link failure.
    pub fn spawn<W>(
        peer: NodeId,
        tx: OnoSender<W>,
        alive: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (queue, source) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::consume(peer, source, tx, alive, events));

        Self { queue, handle }
    }

    /// Enqueues `msg` for delivery.
    ///
    /// # Returns
    /// The message back if the writing task is gone.
    pub fn send(&self, msg: Msg) -> Result<(), Msg> {
        self.queue.send(msg).map_err(|mpsc::error::SendError(msg)| msg)
    }

    /// Stops accepting messages and waits until the queued ones are written.
    pub async fn close(self) {
        let Self { queue, handle } = self;
        drop(queue);

        if let Err(e) = handle.await {
            warn!("failed to join sink task: {e}");
        }
    }

    /// Will consume from `source` and write its incoming messages onto `sink`.
    async fn consume<W>(
        peer: NodeId,
        mut source: mpsc::UnboundedReceiver<Msg>,
        mut sink: OnoSender<W>,
        alive: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<Event>,
    ) where
        W: AsyncWrite + Unpin,
    {
        while let Some(msg) = source.recv().await {
            match sink.send(&msg).await {
                Ok(()) => continue,
                // Rejected before anything reached the stream.
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                    warn!(peer = peer, kind = msg.kind_name(); "dropping message: {e}");
                    continue;
                }
                Err(e) => {
                    warn!(peer = peer, kind = msg.kind_name(); "failed to write message: {e}");
                    alive.store(false, Ordering::Release);

                    let reason = format!("write failed: {e}");
                    let _ = events.send(Event::LinkDown { peer, reason });
                    return;
                }
            }
        }

        debug!(peer = peer; "sink drained, shutting down the write half");
        let _ = sink.shutdown().await;
    }
}
