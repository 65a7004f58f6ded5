use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use comms::{
    Result,
    msg::{BarrierGroup, Msg},
    node::{NodeId, NodeRole},
    specs::cluster::ClusterSpec,
    transport::{Envelope, Event, Inbox, Outbox},
};
use log::{debug, info, warn};
use tokio::time::{self, Instant, MissedTickBehavior};

/// Heartbeats a node may miss before it's reported as stale.
const MISSED_HEARTBEATS: u32 = 3;

/// The coordination loop of the scheduler node.
///
/// It releases barriers, keeps track of heartbeats and shuts the cluster down
/// once every worker finalized.
pub struct Scheduler {
    spec: ClusterSpec,
    outbox: Outbox,
    barriers: HashMap<BarrierGroup, HashSet<NodeId>>,
    last_seen: HashMap<NodeId, Instant>,
    stale: HashSet<NodeId>,
    finished: HashSet<NodeId>,
}

impl Scheduler {
    /// Creates a new `Scheduler`.
    ///
    /// # Arguments
    /// * `spec` - The specification of the cluster.
    /// * `outbox` - The sending half of the scheduler's transport.
    pub fn new(spec: ClusterSpec, outbox: Outbox) -> Self {
        let now = Instant::now();
        let last_seen = spec
            .server_ids()
            .into_iter()
            .chain(spec.worker_ids())
            .map(|id| (id, now))
            .collect();

        Self {
            spec,
            outbox,
            barriers: HashMap::new(),
            last_seen,
            stale: HashSet::new(),
            finished: HashSet::new(),
        }
    }

    /// The members of `group` in this cluster.
    fn members(&self, group: BarrierGroup) -> Vec<NodeId> {
        match group {
            BarrierGroup::Workers => self.spec.worker_ids(),
            BarrierGroup::Servers => self.spec.server_ids(),
            BarrierGroup::All => {
                let mut members = self.spec.server_ids();
                members.extend(self.spec.worker_ids());
                members
            }
        }
    }

    /// Coordinates the cluster until every worker is done, then sends
    /// `Shutdown` to every server and worker.
    ///
    /// # Arguments
    /// * `inbox` - The receiving half of the scheduler's transport.
    pub async fn coordinate(&mut self, inbox: &mut Inbox) -> Result<()> {
        let heartbeat = self.spec.timeouts.heartbeat().max(Duration::from_millis(1));
        let mut ticker = time::interval(heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(workers = self.spec.num_workers(), servers = self.spec.num_servers(); "coordinating");

        while !self.all_finished() {
            tokio::select! {
                event = inbox.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
                _ = ticker.tick() => self.check_heartbeats(heartbeat * MISSED_HEARTBEATS),
            }
        }

        self.shutdown()
    }

    fn all_finished(&self) -> bool {
        self.finished.len() == self.spec.num_workers()
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Message(Envelope { source, msg }) => {
                self.last_seen.insert(source, Instant::now());
                if self.stale.remove(&source) {
                    info!(node = source; "node is alive again");
                }

                match msg {
                    Msg::Heartbeat => {}
                    Msg::Barrier(group) => self.on_barrier(source, group),
                    Msg::Finalize if self.is_worker(source) => {
                        self.finished.insert(source);
                        info!(worker = source, done = self.finished.len(); "worker finalized");
                    }
                    msg => warn!(peer = source, kind = msg.kind_name(); "unexpected message"),
                }
            }
            Event::LinkDown { peer, reason } => {
                if self.is_worker(peer) && self.finished.insert(peer) {
                    warn!(worker = peer; "lost a worker before it finalized: {reason}");
                } else if !self.is_worker(peer) {
                    warn!(server = peer; "lost a server: {reason}");
                }
            }
        }
    }

    fn on_barrier(&mut self, source: NodeId, group: BarrierGroup) {
        let Some((role, _)) = self.spec.role_of(source) else {
            return;
        };

        if !group.includes(role) {
            warn!(peer = source; "{role} entered the {group:?} barrier it isn't part of");
            return;
        }

        let members = self.members(group);
        let entered = self.barriers.entry(group).or_default();
        entered.insert(source);
        debug!(peer = source, entered = entered.len(); "entered {group:?} barrier");

        if entered.len() < members.len() {
            return;
        }

        entered.clear();
        if let Err(e) = self.outbox.broadcast(&members, &Msg::BarrierRelease(group)) {
            warn!("failed to release the {group:?} barrier: {e}");
        }

        info!(members = members.len(); "released {group:?} barrier");
    }

    fn check_heartbeats(&mut self, limit: Duration) {
        let now = Instant::now();

        for (&id, &seen) in &self.last_seen {
            if self.finished.contains(&id) || now.duration_since(seen) < limit {
                continue;
            }

            if self.stale.insert(id) {
                warn!(node = id; "no heartbeat for {:?}", now.duration_since(seen));
            }
        }
    }

    fn shutdown(&self) -> Result<()> {
        let nodes = self.members(BarrierGroup::All);
        let connected: Vec<_> = nodes
            .into_iter()
            .filter(|&id| self.outbox.is_connected(id))
            .collect();

        info!(nodes = connected.len(); "shutting the cluster down");
        self.outbox.broadcast(&connected, &Msg::Shutdown)
    }

    fn is_worker(&self, id: NodeId) -> bool {
        matches!(self.spec.role_of(id), Some((NodeRole::Worker, _)))
    }
}
