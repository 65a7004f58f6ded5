use std::{collections::BTreeMap, time::Duration};

use comms::{
    Key, MAX_PAYLOAD, PsError, Result,
    msg::{BarrierGroup, Msg, PullRequest, PushRequest, RequestId},
    node::{NodeId, SCHEDULER_ID},
    partition::Partitioner,
    specs::cluster::ClusterSpec,
    transport::{Envelope, Event, Inbox, Outbox},
};
use futures::future;
use log::{debug, info, warn};
use rand::Rng;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time,
};

use crate::{
    dispatcher,
    pending::{Pending, Reply},
};

/// A request sent to one server, kept until it's answered.
struct Call {
    server: NodeId,
    request_id: RequestId,
    msg: Msg,
    reply: oneshot::Receiver<Result<Reply>>,
    attempts: u32,
    /// An answer taken off `reply` before anyone awaited it.
    early: Option<Result<Reply>>,
}

impl Call {
    /// Whether the server already acknowledged this call.
    fn acked(&mut self) -> bool {
        if self.early.is_none() {
            match self.reply.try_recv() {
                Ok(reply) => self.early = Some(reply),
                Err(_) => return false,
            }
        }

        matches!(self.early, Some(Ok(Reply::Ack)))
    }
}

/// The worker side of the push/pull protocol.
///
/// It splits every request by owning server, sends the parts concurrently and
/// merges the answers back into the caller's key order.
pub struct KvWorker {
    id: NodeId,
    outbox: Outbox,
    partitioner: Partitioner,
    value_len: usize,
    tracks_clocks: bool,
    retries: u32,
    backoff: Duration,
    request_timeout: Duration,
    clock: u64,
    next_request: RequestId,
    pending: Pending,
    in_flight: BTreeMap<RequestId, Vec<Call>>,
    control: mpsc::UnboundedReceiver<Event>,
    dispatcher: JoinHandle<()>,
}

impl KvWorker {
    /// Creates a new `KvWorker` and spawns the task dispatching its inbox.
    ///
    /// # Arguments
    /// * `spec` - The specification of the cluster.
    /// * `outbox` - The sending half of the worker's transport.
    /// * `inbox` - The receiving half of the worker's transport.
    pub fn new(spec: &ClusterSpec, outbox: Outbox, inbox: Inbox) -> Self {
        let id = outbox.local();
        let pending = Pending::default();
        let (control_tx, control) = mpsc::unbounded_channel();

        let dispatcher = tokio::spawn(dispatcher::dispatch(id, inbox, pending.clone(), control_tx));

        Self {
            id,
            outbox,
            partitioner: spec.partitioner(),
            value_len: spec.value_len.get(),
            tracks_clocks: spec.consistency.tracks_clocks(),
            retries: spec.retries,
            backoff: spec.timeouts.backoff(),
            request_timeout: spec.timeouts.request(),
            clock: 0,
            next_request: 0,
            pending,
            in_flight: BTreeMap::new(),
            control,
            dispatcher,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The amount of pushes issued so far.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// The requests sent and not answered yet, across every server.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// The pushes some server didn't acknowledge yet.
    pub fn in_flight(&mut self) -> usize {
        self.prune_acked();
        self.in_flight.len()
    }

    /// Forgets the calls, and the pushes, every server already acknowledged.
    fn prune_acked(&mut self) {
        self.in_flight.retain(|_, calls| {
            calls.retain_mut(|call| !call.acked());
            !calls.is_empty()
        });
    }

    /// Sends `deltas` to the servers owning `keys`, without waiting for them
    /// to be applied.
    ///
    /// # Arguments
    /// * `keys` - The keys to update.
    /// * `deltas` - One delta of `value_len` values per key.
    ///
    /// # Returns
    /// The id to pass to `KvWorker::wait`.
    pub async fn push(&mut self, keys: &[Key], deltas: &[Vec<f32>]) -> Result<RequestId> {
        self.prune_acked();
        self.check_deltas(keys, deltas)?;
        let groups = self.partitioner.slice(keys)?;

        for (_, positions) in &groups {
            check_frame(Msg::push_len(positions.len(), self.value_len))?;
        }

        let targets: Vec<(usize, Vec<usize>)> = if self.tracks_clocks {
            let mut groups = groups.into_iter().peekable();

            (0..self.partitioner.servers())
                .map(|rank| match groups.next_if(|(owner, _)| *owner == rank) {
                    Some(group) => group,
                    None => (rank, Vec::new()),
                })
                .collect()
        } else {
            groups
        };

        self.clock += 1;
        let clock = self.clock;
        let request_id = self.next_request_id();

        let mut calls = Vec::with_capacity(targets.len());

        for (rank, positions) in targets {
            let msg = Msg::Push(PushRequest {
                request_id,
                clock,
                keys: positions.iter().map(|&i| keys[i]).collect(),
                values: positions.iter().map(|&i| deltas[i].clone()).collect(),
            });

            match self.start(server_id(rank), request_id, msg).await {
                Ok(call) => calls.push(call),
                Err(e) => {
                    calls
                        .iter()
                        .for_each(|call| self.pending.remove(call.server, call.request_id));
                    return Err(e);
                }
            }
        }

        debug!(worker = self.id, request_id = request_id, clock = clock, servers = calls.len(); "push sent");
        self.in_flight.insert(request_id, calls);
        Ok(request_id)
    }

    /// Waits until every server applied the push `request_id`.
    ///
    /// Waiting twice on the same push, or on an unknown id, returns at once.
    pub async fn wait(&mut self, request_id: RequestId) -> Result<()> {
        let Some(calls) = self.in_flight.remove(&request_id) else {
            return Ok(());
        };

        let replies = self.finish_all(calls).await?;

        for reply in replies {
            if !matches!(reply, Reply::Ack) {
                return Err(PsError::Protocol(format!(
                    "expected an acknowledgement for push {request_id}, got {reply:?}"
                )));
            }
        }

        Ok(())
    }

    /// Waits for the acknowledgement of every push in flight.
    pub async fn drain(&mut self) -> Result<()> {
        while let Some(&request_id) = self.in_flight.keys().next() {
            self.wait(request_id).await?;
        }

        Ok(())
    }

    /// Fetches the current values of `keys`.
    ///
    /// # Arguments
    /// * `keys` - The keys to read, duplicates are allowed.
    ///
    /// # Returns
    /// One value per key, in the order of `keys`.
    pub async fn pull(&mut self, keys: &[Key]) -> Result<Vec<Vec<f32>>> {
        self.prune_acked();
        let groups = self.partitioner.slice(keys)?;

        for (_, positions) in &groups {
            check_frame(Msg::response_len(positions.len(), self.value_len))?;
        }

        let request_id = self.next_request_id();
        let clock = self.clock;

        let mut calls = Vec::with_capacity(groups.len());

        for (rank, positions) in &groups {
            let msg = Msg::Pull(PullRequest {
                request_id,
                clock,
                keys: positions.iter().map(|&i| keys[i]).collect(),
            });

            match self.start(server_id(*rank), request_id, msg).await {
                Ok(call) => calls.push(call),
                Err(e) => {
                    calls
                        .iter()
                        .for_each(|call| self.pending.remove(call.server, call.request_id));
                    return Err(e);
                }
            }
        }

        let replies = self.finish_all(calls).await?;

        let mut values = vec![Vec::new(); keys.len()];

        for ((rank, positions), reply) in groups.into_iter().zip(replies) {
            let server = server_id(rank);

            let Reply::Values(response) = reply else {
                return Err(PsError::Protocol(format!(
                    "server {server} acknowledged pull {request_id} instead of answering it"
                )));
            };

            let expected = positions.iter().map(|&i| keys[i]);
            if response.values.len() != positions.len()
                || !response.keys.iter().copied().eq(expected)
            {
                return Err(PsError::Protocol(format!(
                    "server {server} answered pull {request_id} with other keys"
                )));
            }

            for (&pos, value) in positions.iter().zip(response.values) {
                if value.len() != self.value_len {
                    return Err(PsError::SizeMismatch {
                        key: keys[pos],
                        got: value.len(),
                        expected: self.value_len,
                    });
                }

                values[pos] = value;
            }
        }

        Ok(values)
    }

    /// Pushes `deltas` and pulls the resulting values of the same keys.
    ///
    /// The pull travels behind the push on every link, so it observes it.
    pub async fn push_pull(&mut self, keys: &[Key], deltas: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let request_id = self.push(keys, deltas).await?;
        let values = self.pull(keys).await?;
        self.wait(request_id).await?;
        Ok(values)
    }

    /// Blocks until every worker entered the worker barrier.
    pub async fn barrier(&mut self) -> Result<()> {
        self.barrier_on(BarrierGroup::Workers).await
    }

    /// Enters a barrier coordinated by the scheduler and waits for its release.
    ///
    /// # Arguments
    /// * `group` - The nodes taking part in the barrier.
    pub async fn barrier_on(&mut self, group: BarrierGroup) -> Result<()> {
        self.outbox.send(SCHEDULER_ID, Msg::Barrier(group))?;

        self.wait_scheduler(|msg| *msg == Msg::BarrierRelease(group))
            .await?;

        debug!(worker = self.id; "barrier {group:?} released");
        Ok(())
    }

    /// Waits for the in-flight pushes, tells the scheduler this worker is done
    /// and waits until it shuts the cluster down.
    ///
    /// # Arguments
    /// * `timeout` - How long to wait for the scheduler's `Shutdown`.
    pub async fn finalize(mut self, timeout: Duration) -> Result<()> {
        let drained = self.drain().await;

        let res = match drained {
            Ok(()) => self.shutdown_handshake(timeout).await,
            Err(e) => Err(e),
        };

        self.outbox.close().await;
        self.dispatcher.abort();

        info!(worker = self.id, clock = self.clock; "worker finalized");
        res
    }

    async fn shutdown_handshake(&mut self, timeout: Duration) -> Result<()> {
        self.outbox.send(SCHEDULER_ID, Msg::Finalize)?;

        time::timeout(timeout, self.wait_scheduler(|msg| *msg == Msg::Shutdown))
            .await
            .map_err(|_| PsError::Timeout(timeout))?
    }

    /// Waits for a message from the scheduler accepted by `wanted`.
    async fn wait_scheduler<F>(&mut self, wanted: F) -> Result<()>
    where
        F: Fn(&Msg) -> bool,
    {
        loop {
            match self.control.recv().await {
                Some(Event::Message(Envelope { msg, .. })) if wanted(&msg) => return Ok(()),
                Some(Event::Message(Envelope { msg, .. })) => {
                    debug!(worker = self.id, kind = msg.kind_name(); "ignoring scheduler message");
                }
                Some(Event::LinkDown { peer, reason }) => return Err(PsError::link(peer, reason)),
                None => return Err(PsError::link(SCHEDULER_ID, "dispatcher stopped")),
            }
        }
    }

    /// Sends the first attempt of a request.
    async fn start(&self, server: NodeId, request_id: RequestId, msg: Msg) -> Result<Call> {
        let mut attempts = 0;
        let reply = self.send(server, request_id, &msg, &mut attempts).await?;

        Ok(Call {
            server,
            request_id,
            msg,
            reply,
            attempts,
            early: None,
        })
    }

    /// Waits for the answers to every call of a fan-out.
    ///
    /// On failure the slots of the calls still waiting are released too.
    async fn finish_all(&self, calls: Vec<Call>) -> Result<Vec<Reply>> {
        let slots: Vec<_> = calls.iter().map(|call| (call.server, call.request_id)).collect();

        let res = future::try_join_all(calls.into_iter().map(|call| self.finish(call))).await;

        if res.is_err() {
            for (server, request_id) in slots {
                self.pending.remove(server, request_id);
            }
        }

        res
    }

    /// Waits for the answer to `call`, resending it after link failures.
    async fn finish(&self, call: Call) -> Result<Reply> {
        let Call {
            server,
            request_id,
            msg,
            mut reply,
            mut attempts,
            mut early,
        } = call;

        loop {
            let answer = match early.take() {
                Some(answer) => Ok(Ok(answer)),
                None => time::timeout(self.request_timeout, &mut reply).await,
            };

            let err = match answer {
                Ok(Ok(Ok(reply))) => return Ok(reply),
                Ok(Ok(Err(e))) => e,
                Ok(Err(_)) => PsError::link(server, "dispatcher stopped"),
                Err(_) => {
                    self.pending.remove(server, request_id);
                    warn!(worker = self.id, server = server, request_id = request_id; "request timed out");
                    return Err(PsError::Timeout(self.request_timeout));
                }
            };

            self.back_off(server, &mut attempts, err).await?;
            reply = self.send(server, request_id, &msg, &mut attempts).await?;
        }
    }

    /// Registers and enqueues `msg`, retrying while the link is down.
    async fn send(
        &self,
        server: NodeId,
        request_id: RequestId,
        msg: &Msg,
        attempts: &mut u32,
    ) -> Result<oneshot::Receiver<Result<Reply>>> {
        loop {
            let reply = self.pending.register(server, request_id);

            match self.outbox.send(server, msg.clone()) {
                Ok(()) => return Ok(reply),
                Err(e) => {
                    self.pending.remove(server, request_id);
                    self.back_off(server, attempts, e).await?;
                }
            }
        }
    }

    /// Sleeps before the next attempt, if `err` is transient and the retry
    /// budget allows it.
    async fn back_off(&self, server: NodeId, attempts: &mut u32, err: PsError) -> Result<()> {
        if !err.is_transient() {
            return Err(err);
        }

        if *attempts >= self.retries {
            warn!(worker = self.id, server = server, attempts = *attempts; "giving up: {err}");
            return Err(PsError::UnreachableServer(server));
        }

        *attempts += 1;

        let base = self.backoff * *attempts;
        let jitter = rand::rng().random_range(0..=base.as_millis() as u64 / 2);
        let delay = base + Duration::from_millis(jitter);

        debug!(worker = self.id, server = server, attempt = *attempts; "retrying in {delay:?}: {err}");
        time::sleep(delay).await;
        Ok(())
    }

    fn check_deltas(&self, keys: &[Key], deltas: &[Vec<f32>]) -> Result<()> {
        if keys.len() != deltas.len() {
            return Err(PsError::Protocol(format!(
                "{} keys but {} deltas",
                keys.len(),
                deltas.len()
            )));
        }

        for (&key, delta) in keys.iter().zip(deltas) {
            if delta.len() != self.value_len {
                return Err(PsError::SizeMismatch {
                    key,
                    got: delta.len(),
                    expected: self.value_len,
                });
            }
        }

        Ok(())
    }

    fn next_request_id(&mut self) -> RequestId {
        self.next_request += 1;
        self.next_request
    }
}

impl Drop for KvWorker {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn server_id(rank: usize) -> NodeId {
    1 + rank as NodeId
}

/// Refuses requests whose frame, or whose answer's frame, can't be sent.
fn check_frame(len: usize) -> Result<()> {
    if len > MAX_PAYLOAD {
        return Err(PsError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD,
        });
    }

    Ok(())
}
