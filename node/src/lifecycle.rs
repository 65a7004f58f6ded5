use std::{fmt, sync::Arc, time::Duration};

use comms::{
    Key, PsError, Result,
    msg::{BarrierGroup, Msg, RequestId},
    node::{NodeId, NodeInfo, NodeRole, SCHEDULER_ID},
    specs::cluster::{ClusterSpec, ConsistencySpec},
    transport::{self, Envelope, Event, Inbox, Outbox},
};
use log::{info, warn};
use parameter_server::{Server, ServerBuilder};
use tokio::{net::TcpListener, task::JoinHandle, time};
use worker::KvWorker;

use crate::{
    bootstrap,
    identity::{self, RoleAssignment},
    scheduler::Scheduler,
};

/// The stages a node goes through during a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Running,
    Finalizing,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The role specific half of a running node.
enum Runtime {
    Scheduler { scheduler: Scheduler, inbox: Inbox },
    Server { server: Box<dyn Server>, inbox: Inbox },
    Worker(KvWorker),
}

/// A process taking part in a job, whatever its role.
pub struct Node {
    spec: Arc<ClusterSpec>,
    info: NodeInfo,
    state: LifecycleState,
    listener: Option<TcpListener>,
    outbox: Option<Outbox>,
    runtime: Option<Runtime>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Creates a new `Node`, resolving its identity.
    ///
    /// # Arguments
    /// * `spec` - The specification of the cluster.
    /// * `role` - The role of this process.
    /// * `rank` - The rank of this process within its role.
    ///
    /// # Returns
    /// A new `Node` or a `PsError::Config` if the identity can't be resolved.
    pub fn new(spec: ClusterSpec, role: NodeRole, rank: usize) -> Result<Self> {
        let info = identity::resolve(&spec, role, rank)?;

        Ok(Self {
            spec: Arc::new(spec),
            info,
            state: LifecycleState::Uninitialized,
            listener: None,
            outbox: None,
            runtime: None,
            tasks: Vec::new(),
        })
    }

    /// Creates a new `Node` from the `PS_CONFIG`, `PS_ROLE` and `PS_RANK`
    /// environment variables.
    pub fn from_env() -> Result<Self> {
        let spec = ClusterSpec::from_env()?;
        let RoleAssignment { role, rank } = RoleAssignment::from_env()?;
        Self::new(spec, role, rank)
    }

    /// Uses an already bound listener instead of binding the declared address.
    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_scheduler(&self) -> bool {
        self.info.is_scheduler()
    }

    pub fn is_server(&self) -> bool {
        self.info.is_server()
    }

    pub fn is_worker(&self) -> bool {
        self.info.is_worker()
    }

    /// The peers this node currently has a live link with.
    pub fn peers(&self) -> Vec<NodeId> {
        self.outbox.as_ref().map(Outbox::peers).unwrap_or_default()
    }

    /// Connects this node to the cluster.
    ///
    /// Calling it again on a running node does nothing.
    ///
    /// # Returns
    /// A `PsError::Bootstrap` if the cluster didn't come up in time, in
    /// which case the node is terminated.
    pub async fn init(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Uninitialized => {}
            LifecycleState::Running => return Ok(()),
            state => {
                return Err(PsError::Lifecycle(format!("cannot init a node in state {state}")));
            }
        }

        self.state = LifecycleState::Initializing;
        info!(node = self.info.id; "initializing {}", self.info);

        match self.bootstrap().await {
            Ok(()) => {
                self.state = LifecycleState::Running;
                info!(node = self.info.id; "running");
                Ok(())
            }
            Err(e) => {
                warn!(node = self.info.id; "bootstrap failed: {e}");
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn bootstrap(&mut self) -> Result<()> {
        let (outbox, mut inbox) = transport::transport(self.info.id);
        self.outbox = Some(outbox.clone());

        if matches!(self.info.role, NodeRole::Scheduler | NodeRole::Server) {
            let listener = match self.listener.take() {
                Some(listener) => listener,
                None => bootstrap::bind(&self.info.addr).await?,
            };

            let acceptor = bootstrap::spawn_acceptor(
                listener,
                Arc::clone(&self.spec),
                self.info.clone(),
                outbox.clone(),
            );
            self.tasks.push(acceptor);
        }

        bootstrap::connect(&self.spec, &self.info, &outbox).await?;

        let sequential = self.spec.consistency == ConsistencySpec::Sequential;

        let runtime = match self.info.role {
            NodeRole::Scheduler => {
                let scheduler = Scheduler::new(ClusterSpec::clone(&self.spec), outbox);
                Runtime::Scheduler { scheduler, inbox }
            }
            NodeRole::Server => {
                let server =
                    ServerBuilder::new().build(&self.spec, self.info.rank, outbox.clone())?;

                if sequential {
                    initial_barrier(&outbox, &mut inbox, self.spec.timeouts.bootstrap()).await?;
                }

                self.tasks.push(spawn_heartbeat(outbox, self.spec.timeouts.heartbeat()));
                Runtime::Server { server, inbox }
            }
            NodeRole::Worker => {
                let mut worker = KvWorker::new(&self.spec, outbox.clone(), inbox);

                if sequential {
                    let timeout = self.spec.timeouts.bootstrap();
                    time::timeout(timeout, worker.barrier_on(BarrierGroup::All))
                        .await
                        .map_err(|_| never_released())??;
                }

                self.tasks.push(spawn_heartbeat(outbox, self.spec.timeouts.heartbeat()));
                Runtime::Worker(worker)
            }
        };

        self.runtime = Some(runtime);
        Ok(())
    }

    /// Serves requests until the scheduler shuts the cluster down.
    pub async fn serve(&mut self) -> Result<()> {
        self.ensure_running("serve")?;

        match &mut self.runtime {
            Some(Runtime::Server { server, inbox }) => server.serve(inbox).await,
            _ => Err(PsError::Lifecycle(format!("a {} cannot serve", self.info.role))),
        }
    }

    /// Coordinates the cluster until every worker finalized.
    pub async fn coordinate(&mut self) -> Result<()> {
        self.ensure_running("coordinate")?;

        match &mut self.runtime {
            Some(Runtime::Scheduler { scheduler, inbox }) => scheduler.coordinate(inbox).await,
            _ => Err(PsError::Lifecycle(format!("a {} cannot coordinate", self.info.role))),
        }
    }

    /// See `KvWorker::push`.
    pub async fn push(&mut self, keys: &[Key], deltas: &[Vec<f32>]) -> Result<RequestId> {
        self.worker("push")?.push(keys, deltas).await
    }

    /// See `KvWorker::pull`.
    pub async fn pull(&mut self, keys: &[Key]) -> Result<Vec<Vec<f32>>> {
        self.worker("pull")?.pull(keys).await
    }

    /// See `KvWorker::push_pull`.
    pub async fn push_pull(&mut self, keys: &[Key], deltas: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        self.worker("push_pull")?.push_pull(keys, deltas).await
    }

    /// See `KvWorker::wait`.
    pub async fn wait(&mut self, request_id: RequestId) -> Result<()> {
        self.worker("wait")?.wait(request_id).await
    }

    /// See `KvWorker::barrier`.
    pub async fn barrier(&mut self) -> Result<()> {
        self.worker("barrier")?.barrier().await
    }

    /// Leaves the cluster and releases every resource of this node.
    ///
    /// A worker first waits for its pushes and for the scheduler's shutdown.
    /// Calling it again does nothing.
    pub async fn finalize(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Terminated => return Ok(()),
            LifecycleState::Uninitialized => {
                self.state = LifecycleState::Terminated;
                return Ok(());
            }
            _ => {}
        }

        self.state = LifecycleState::Finalizing;
        info!(node = self.info.id; "finalizing");

        let res = match self.runtime.take() {
            Some(Runtime::Worker(worker)) => worker.finalize(self.spec.timeouts.finalize()).await,
            Some(Runtime::Server { server, .. }) if server.deferred() > 0 => {
                warn!(node = self.info.id, deferred = server.deferred(); "dropping deferred pulls");
                Ok(())
            }
            _ => Ok(()),
        };

        self.teardown().await;
        info!(node = self.info.id; "terminated");
        res
    }

    /// Stops every background task and closes every link.
    async fn teardown(&mut self) {
        self.runtime = None;
        self.tasks.drain(..).for_each(|task| task.abort());

        if let Some(outbox) = self.outbox.take() {
            outbox.close().await;
        }

        self.state = LifecycleState::Terminated;
    }

    fn ensure_running(&self, op: &str) -> Result<()> {
        if self.state != LifecycleState::Running {
            return Err(PsError::Lifecycle(format!(
                "cannot {op} on a node in state {}",
                self.state
            )));
        }

        Ok(())
    }

    fn worker(&mut self, op: &str) -> Result<&mut KvWorker> {
        self.ensure_running(op)?;

        match &mut self.runtime {
            Some(Runtime::Worker(worker)) => Ok(worker),
            _ => Err(PsError::Lifecycle(format!("a {} cannot {op}", self.info.role))),
        }
    }
}

/// Waits, on a server, until every server and worker joined.
///
/// Requests arriving early stay in the inbox for `Node::serve`.
async fn initial_barrier(outbox: &Outbox, inbox: &mut Inbox, timeout: Duration) -> Result<()> {
    outbox.send(SCHEDULER_ID, Msg::Barrier(BarrierGroup::All))?;

    let released = |event: &Event| {
        matches!(
            event,
            Event::Message(Envelope {
                source: SCHEDULER_ID,
                msg: Msg::BarrierRelease(BarrierGroup::All),
            }) | Event::LinkDown {
                peer: SCHEDULER_ID,
                ..
            }
        )
    };

    let event = time::timeout(timeout, inbox.wait_for(released))
        .await
        .map_err(|_| never_released())?;

    match event {
        Some(Event::Message(_)) => Ok(()),
        Some(Event::LinkDown { peer, reason }) => Err(PsError::link(peer, reason)),
        None => Err(PsError::Bootstrap("transport closed during the initial barrier".into())),
    }
}

fn never_released() -> PsError {
    PsError::Bootstrap("the initial barrier was never released".into())
}

/// Periodically tells the scheduler this node is alive.
fn spawn_heartbeat(outbox: Outbox, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(every.max(Duration::from_millis(1)));

        loop {
            ticker.tick().await;

            if outbox.send(SCHEDULER_ID, Msg::Heartbeat).is_err() {
                break;
            }
        }
    })
}
