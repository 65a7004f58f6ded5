//! Connection establishment between the nodes of a cluster.
//!
//! Servers dial the scheduler, workers dial the scheduler and every server.
//! Every connection starts with a `Hello` exchange announcing both roles.

use std::sync::Arc;

use comms::{
    PsError, Result,
    msg::Msg,
    node::{NodeId, NodeInfo, NodeRole, SCHEDULER_ID},
    specs::cluster::ClusterSpec,
    transport::Outbox,
};
use futures::future;
use log::{debug, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{self, Instant},
};

/// Binds the listener of a scheduler or server.
///
/// # Arguments
/// * `addr` - The declared address of the node.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| PsError::Bootstrap(format!("cannot listen at {addr}: {e}")))
}

/// Whether a node of role `local` accepts connections from nodes of role `remote`.
pub fn accepts(local: NodeRole, remote: NodeRole) -> bool {
    matches!(
        (local, remote),
        (NodeRole::Scheduler, NodeRole::Server | NodeRole::Worker)
            | (NodeRole::Server, NodeRole::Worker)
    )
}

/// The peers a node of `role` is responsible for dialing.
pub fn dial_targets(spec: &ClusterSpec, role: NodeRole) -> Vec<NodeId> {
    match role {
        NodeRole::Scheduler => Vec::new(),
        NodeRole::Server => vec![SCHEDULER_ID],
        NodeRole::Worker => {
            let mut targets = vec![SCHEDULER_ID];
            targets.extend(spec.server_ids());
            targets
        }
    }
}

/// Connects a node to every peer it expects.
///
/// # Arguments
/// * `spec` - The specification of the cluster.
/// * `info` - The identity of the local node.
/// * `outbox` - Where the established links are attached.
///
/// # Returns
/// A `PsError::Bootstrap` if some peer didn't join within the bootstrap timeout.
pub async fn connect(spec: &ClusterSpec, info: &NodeInfo, outbox: &Outbox) -> Result<()> {
    let timeout = spec.timeouts.bootstrap();
    let deadline = Instant::now() + timeout;

    let targets = dial_targets(spec, info.role);
    let dials = targets.iter().map(|&peer| dial(spec, info, outbox, peer, deadline));
    future::try_join_all(dials).await?;

    let expected = spec.expected_peers(info.role);
    let remaining = deadline.saturating_duration_since(Instant::now());
    outbox.wait_for(&expected, remaining).await?;

    info!(node = info.id, peers = expected.len(); "bootstrap complete");
    Ok(())
}

/// Opens a link to `peer`, retrying until its listener is up.
///
/// # Arguments
/// * `spec` - The specification of the cluster.
/// * `info` - The identity of the local node.
/// * `outbox` - Where the link is attached.
/// * `peer` - The node to dial.
/// * `deadline` - When to give up.
pub async fn dial(
    spec: &ClusterSpec,
    info: &NodeInfo,
    outbox: &Outbox,
    peer: NodeId,
    deadline: Instant,
) -> Result<()> {
    let (Some(addr), Some((role, _))) = (spec.addr_of(peer), spec.role_of(peer)) else {
        return Err(PsError::Config(format!("node {peer} is not declared")));
    };

    let retry = spec.timeouts.backoff();

    let stream = loop {
        let err = match time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => break stream,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connection timed out".to_string(),
        };

        if Instant::now() + retry >= deadline {
            return Err(PsError::Bootstrap(format!(
                "cannot reach {role} {peer} at {addr}: {err}"
            )));
        }

        debug!(node = info.id, peer = peer; "dial failed, retrying: {err}");
        time::sleep(retry).await;
    };

    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = comms::channel(rx, tx, info.id);

    tx.send(&Msg::Hello(info.role)).await?;

    let (source, msg) = time::timeout_at(deadline, rx.recv::<Msg>())
        .await
        .map_err(|_| PsError::Bootstrap(format!("{role} {peer} never answered the hello")))??;

    if source != peer || msg != Msg::Hello(role) {
        return Err(PsError::Protocol(format!(
            "expected a hello from {role} {peer}, got {} from node {source}",
            msg.kind_name()
        )));
    }

    if !outbox.attach(peer, rx, tx) {
        warn!(node = info.id, peer = peer; "already connected, dropping the new link");
    }

    debug!(node = info.id, peer = peer; "connected to {role} at {addr}");
    Ok(())
}

/// Spawns the task accepting links from the peers that dial this node.
///
/// Connections from undeclared nodes, from roles this node doesn't accept or
/// from already connected peers are dropped.
///
/// # Arguments
/// * `listener` - The bound listener of the node.
/// * `spec` - The specification of the cluster.
/// * `info` - The identity of the local node.
/// * `outbox` - Where the accepted links are attached.
pub fn spawn_acceptor(
    listener: TcpListener,
    spec: Arc<ClusterSpec>,
    info: NodeInfo,
    outbox: Outbox,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(node = info.id; "failed to accept a connection: {e}");
                    continue;
                }
            };

            let spec = Arc::clone(&spec);
            let outbox = outbox.clone();
            let role = info.role;

            tokio::spawn(async move {
                match accept(stream, &spec, role, &outbox).await {
                    Ok(peer) => debug!(node = outbox.local(), peer = peer; "accepted link from {addr}"),
                    Err(e) => warn!(node = outbox.local(); "refused connection from {addr}: {e}"),
                }
            });
        }
    })
}

/// Runs the accepting side of the hello exchange.
///
/// # Returns
/// The id of the connected peer.
async fn accept(
    stream: TcpStream,
    spec: &ClusterSpec,
    local: NodeRole,
    outbox: &Outbox,
) -> Result<NodeId> {
    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = comms::channel(rx, tx, outbox.local());

    let (source, msg) = time::timeout(spec.timeouts.bootstrap(), rx.recv::<Msg>())
        .await
        .map_err(|_| PsError::Bootstrap("the peer never sent its hello".into()))??;

    let Msg::Hello(role) = msg else {
        return Err(PsError::Protocol(format!(
            "expected a hello, got {}",
            msg.kind_name()
        )));
    };

    match spec.role_of(source) {
        Some((declared, _)) if declared == role && accepts(local, role) => {}
        _ => {
            return Err(PsError::Protocol(format!(
                "node {source} announced itself as {role}, which a {local} doesn't accept"
            )));
        }
    }

    tx.send(&Msg::Hello(local)).await?;

    if !outbox.attach(source, rx, tx) {
        return Err(PsError::Protocol(format!("node {source} is already connected")));
    }

    Ok(source)
}
