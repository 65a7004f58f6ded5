//! Per-node message transport.
//!
//! A node owns one `Outbox`, shared by every task that needs to send, and a
//! single `Inbox` where every link delivers its decoded messages.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Notify, mpsc},
    time::{self, Instant},
};

use crate::{
    MAX_PAYLOAD, OnoReceiver, OnoSender, PsError, Result, msg::Msg, node::NodeId, sink::Sink,
    source::Source,
};

/// A message together with the node that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: NodeId,
    pub msg: Msg,
}

/// Everything a node can observe from its links.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(Envelope),
    LinkDown { peer: NodeId, reason: String },
}

struct Link {
    sink: Sink,
    source: Source,
    alive: Arc<AtomicBool>,
}

impl Link {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Creates the sending and receiving halves of a node's transport.
///
/// # Arguments
/// * `local` - The id of the node owning the transport.
pub fn transport(local: NodeId) -> (Outbox, Inbox) {
    let (events, queue) = mpsc::unbounded_channel();

    let outbox = Outbox {
        local,
        links: Arc::new(Mutex::new(HashMap::new())),
        events,
        attached: Arc::new(Notify::new()),
    };

    let inbox = Inbox {
        queue,
        backlog: VecDeque::new(),
    };

    (outbox, inbox)
}

/// The sending half of the transport, cheap to clone.
#[derive(Clone)]
pub struct Outbox {
    local: NodeId,
    links: Arc<Mutex<HashMap<NodeId, Link>>>,
    events: mpsc::UnboundedSender<Event>,
    attached: Arc<Notify>,
}

impl Outbox {
    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Registers a new link to `peer`, spawning its reading and writing tasks.
    ///
    /// # Arguments
    /// * `peer` - The node on the other end.
    /// * `rx` - The receiving end of the connection.
    /// * `tx` - The sending end of the connection.
    ///
    /// # Returns
    /// `false` if a live link to `peer` already exists, in which case the
    /// given halves are dropped.
    pub fn attach<R, W>(&self, peer: NodeId, rx: OnoReceiver<R>, tx: OnoSender<W>) -> bool
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut links = self.links.lock();

        if links.get(&peer).is_some_and(Link::is_alive) {
            warn!(local = self.local, peer = peer; "refusing duplicate link");
            return false;
        }

        let alive = Arc::new(AtomicBool::new(true));
        let link = Link {
            sink: Sink::spawn(peer, tx, alive.clone(), self.events.clone()),
            source: Source::spawn(peer, rx, alive.clone(), self.events.clone()),
            alive,
        };

        if let Some(stale) = links.insert(peer, link) {
            stale.source.abort();
            drop(stale.sink);
        }

        drop(links);
        debug!(local = self.local, peer = peer; "link attached");
        self.attached.notify_waiters();
        true
    }

    /// Queues `msg` towards `peer`.
    ///
    /// # Returns
    /// `PsError::Link` if there is no live link to `peer`, or
    /// `PsError::PayloadTooLarge` if `msg` can't fit in a frame.
    pub fn send(&self, peer: NodeId, msg: Msg) -> Result<()> {
        let len = msg.payload_len();
        if len > MAX_PAYLOAD {
            return Err(PsError::PayloadTooLarge {
                len,
                max: MAX_PAYLOAD,
            });
        }

        let links = self.links.lock();

        let link = match links.get(&peer) {
            Some(link) if link.is_alive() => link,
            Some(_) => return Err(PsError::link(peer, "link is down")),
            None => return Err(PsError::link(peer, "not connected")),
        };

        link.sink
            .send(msg)
            .map_err(|msg| PsError::link(peer, format!("sink closed, dropped {}", msg.kind_name())))
    }

    /// Sends a copy of `msg` to every node in `peers`.
    ///
    /// # Returns
    /// The first failure, after trying every peer.
    pub fn broadcast(&self, peers: &[NodeId], msg: &Msg) -> Result<()> {
        let mut first_err = None;

        for &peer in peers {
            if let Err(e) = self.send(peer, msg.clone()) {
                first_err.get_or_insert(e);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    pub fn is_connected(&self, peer: NodeId) -> bool {
        self.links.lock().get(&peer).is_some_and(Link::is_alive)
    }

    /// The ids of every peer with a live link, sorted.
    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<_> = self
            .links
            .lock()
            .iter()
            .filter(|(_, link)| link.is_alive())
            .map(|(&peer, _)| peer)
            .collect();

        peers.sort_unstable();
        peers
    }

    /// Waits until every node in `expected` has a live link.
    ///
    /// # Arguments
    /// * `expected` - The peers to wait for.
    /// * `timeout` - The maximum time to wait.
    ///
    /// # Returns
    /// `PsError::Bootstrap` naming the missing peers if the deadline passes.
    pub async fn wait_for(&self, expected: &[NodeId], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let attached = self.attached.notified();

            let missing: Vec<_> = expected
                .iter()
                .copied()
                .filter(|&peer| !self.is_connected(peer))
                .collect();

            if missing.is_empty() {
                return Ok(());
            }

            if time::timeout_at(deadline, attached).await.is_err() {
                return Err(PsError::Bootstrap(format!(
                    "node {} timed out after {timeout:?} waiting for nodes {missing:?}",
                    self.local
                )));
            }
        }
    }

    /// Flushes every queued message and tears down all links.
    ///
    /// Nothing is delivered to the inbox afterwards.
    pub async fn close(&self) {
        let links: Vec<_> = self.links.lock().drain().collect();
        let count = links.len();

        for (_, link) in links {
            link.source.abort();
            link.sink.close().await;
        }

        info!(local = self.local, links = count; "transport closed");
    }
}

/// The receiving half of the transport.
pub struct Inbox {
    queue: mpsc::UnboundedReceiver<Event>,
    backlog: VecDeque<Event>,
}

impl Inbox {
    /// Waits for the next event, deferred ones come first.
    ///
    /// # Returns
    /// `None` once every `Outbox` clone and link is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        self.queue.recv().await
    }

    /// Like `Inbox::recv` but gives up after `timeout`.
    ///
    /// # Returns
    /// `PsError::Timeout` if nothing arrived in time.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Event>> {
        time::timeout(timeout, self.recv())
            .await
            .map_err(|_| PsError::Timeout(timeout))
    }

    /// Puts `event` back so it is handed out again before any new one.
    pub fn defer(&mut self, event: Event) {
        self.backlog.push_back(event);
    }

    /// Waits for the first event accepted by `wanted`.
    ///
    /// Every skipped event is kept, in order, for later calls to `Inbox::recv`.
    ///
    /// # Returns
    /// `None` if the inbox closed before a match arrived.
    pub async fn wait_for<F>(&mut self, mut wanted: F) -> Option<Event>
    where
        F: FnMut(&Event) -> bool,
    {
        if let Some(pos) = self.backlog.iter().position(&mut wanted) {
            return self.backlog.remove(pos);
        }

        while let Some(event) = self.queue.recv().await {
            if wanted(&event) {
                return Some(event);
            }

            self.backlog.push_back(event);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use tokio::io;

    use super::*;
    use crate::channel;

    fn pair(local: NodeId, peer: NodeId) -> (Outbox, Inbox, io::DuplexStream) {
        let (ours, theirs) = io::duplex(4096);
        let (rx, tx) = io::split(ours);
        let (outbox, inbox) = transport(local);

        let (rx, tx) = channel(rx, tx, local);
        assert!(outbox.attach(peer, rx, tx));

        (outbox, inbox, theirs)
    }

    #[tokio::test]
    async fn wait_for_keeps_skipped_events_in_order() {
        let (outbox, mut inbox) = transport(1);
        drop(outbox);

        inbox.backlog.push_back(Event::LinkDown {
            peer: 7,
            reason: "a".into(),
        });
        inbox.backlog.push_back(Event::Message(Envelope {
            source: 3,
            msg: Msg::Heartbeat,
        }));
        inbox.backlog.push_back(Event::LinkDown {
            peer: 8,
            reason: "b".into(),
        });

        let got = inbox
            .wait_for(|e| matches!(e, Event::Message(_)))
            .await
            .unwrap();
        assert!(matches!(got, Event::Message(Envelope { source: 3, .. })));

        assert!(matches!(inbox.recv().await, Some(Event::LinkDown { peer: 7, .. })));
        assert!(matches!(inbox.recv().await, Some(Event::LinkDown { peer: 8, .. })));
        assert_eq!(inbox.recv().await, None);
    }

    #[tokio::test]
    async fn duplicate_links_are_refused() {
        let (outbox, _inbox, _theirs) = pair(0, 5);

        let (ours, _other) = io::duplex(64);
        let (rx, tx) = io::split(ours);
        let (rx, tx) = channel(rx, tx, 0);

        assert!(!outbox.attach(5, rx, tx));
        assert_eq!(outbox.peers(), vec![5]);
    }

    #[tokio::test]
    async fn sending_to_unknown_peer_is_a_link_error() {
        let (outbox, _inbox) = transport(0);
        let err = outbox.send(9, Msg::Heartbeat).unwrap_err();

        assert!(matches!(err, PsError::Link { peer: 9, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn oversized_messages_are_refused_without_losing_the_link() {
        let (outbox, _inbox, theirs) = pair(0, 5);
        let keys = vec![0; MAX_PAYLOAD / size_of::<u64>() + 1];
        let pull = Msg::Pull(crate::msg::PullRequest {
            request_id: 1,
            clock: 0,
            keys,
        });

        let err = outbox.send(5, pull).unwrap_err();
        assert!(matches!(err, PsError::PayloadTooLarge { max: MAX_PAYLOAD, .. }));
        assert!(!err.is_transient());

        outbox.send(5, Msg::Heartbeat).unwrap();

        let (rx, _tx) = io::split(theirs);
        let (mut rx, _) = channel(rx, io::sink(), 5);
        let (source, msg) = rx.recv::<Msg>().await.unwrap();
        assert_eq!((source, msg), (0, Msg::Heartbeat));
        assert!(outbox.is_connected(5));
    }

    #[tokio::test]
    async fn remote_close_reports_link_down() {
        let (outbox, mut inbox, theirs) = pair(0, 5);
        drop(theirs);

        let event = inbox.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(event, Some(Event::LinkDown { peer: 5, .. })));
        assert!(!outbox.is_connected(5));
    }

    #[tokio::test]
    async fn wait_for_peers_times_out_naming_the_missing_ones() {
        let (outbox, _inbox, _theirs) = pair(0, 5);

        let err = outbox
            .wait_for(&[5, 6], Duration::from_millis(30))
            .await
            .unwrap_err();

        match err {
            PsError::Bootstrap(detail) => assert!(detail.contains("[6]"), "{detail}"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
