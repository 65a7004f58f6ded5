use comms::{
    msg::Msg,
    node::{NodeId, SCHEDULER_ID},
    transport::{Envelope, Event, Inbox},
};
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::pending::{Pending, Reply};

/// Consumes the worker's inbox, resolving pending requests.
///
/// Everything coming from the scheduler, including the loss of its link, is
/// forwarded to `control`.
///
/// # Arguments
/// * `id` - The id of the worker.
/// * `inbox` - The receiving half of the worker's transport.
/// * `pending` - The requests waiting for an answer.
/// * `control` - Where scheduler events are forwarded.
pub(crate) async fn dispatch(
    id: NodeId,
    mut inbox: Inbox,
    pending: Pending,
    control: mpsc::UnboundedSender<Event>,
) {
    while let Some(event) = inbox.recv().await {
        match event {
            Event::Message(Envelope {
                source: SCHEDULER_ID,
                ..
            })
            | Event::LinkDown {
                peer: SCHEDULER_ID,
                ..
            } => {
                let _ = control.send(event);
            }
            Event::Message(Envelope { source, msg }) => on_server_msg(id, &pending, source, msg),
            Event::LinkDown { peer, reason } => {
                let failed = pending.fail_server(peer, &reason);
                warn!(worker = id, server = peer, failed = failed; "link down: {reason}");
            }
        }
    }

    debug!(worker = id; "inbox closed, dropping {} pending requests", pending.len());
    pending.clear();
}

fn on_server_msg(id: NodeId, pending: &Pending, server: NodeId, msg: Msg) {
    let (request_id, reply) = match msg {
        Msg::PushAck(request_id) => (request_id, Ok(Reply::Ack)),
        Msg::PullResponse(response) => (response.request_id, Ok(Reply::Values(response))),
        Msg::Err(rejection) => (rejection.request_id, Err(rejection.into_error())),
        Msg::Heartbeat => return,
        msg => {
            warn!(worker = id, server = server, kind = msg.kind_name(); "unexpected message");
            return;
        }
    };

    if !pending.resolve(server, request_id, reply) {
        debug!(worker = id, server = server, request_id = request_id; "dropping late reply");
    }
}
