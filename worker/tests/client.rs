use std::{num::NonZeroUsize, time::Duration};

use comms::{
    Key, MAX_PAYLOAD, OnoReceiver, OnoSender, PsError,
    msg::{BarrierGroup, ErrorCode, Msg, PullRequest, PullResponse, PushRequest, Rejection},
    node::{NodeId, SCHEDULER_ID},
    specs::cluster::ClusterSpec,
    transport::{self, Outbox},
};
use tokio::{
    io::{self, DuplexStream, ReadHalf, WriteHalf},
    time,
};
use worker::KvWorker;

const WORKER_ID: NodeId = 3;

/// A scripted node on the other end of one of the worker's links.
struct MockPeer {
    rx: OnoReceiver<ReadHalf<DuplexStream>>,
    tx: OnoSender<WriteHalf<DuplexStream>>,
}

impl MockPeer {
    fn connect(outbox: &Outbox, id: NodeId) -> Self {
        let (ours, theirs) = io::duplex(1 << 16);

        let (rx, tx) = io::split(ours);
        let (rx, tx) = comms::channel(rx, tx, outbox.local());
        assert!(outbox.attach(id, rx, tx));

        let (rx, tx) = io::split(theirs);
        let (rx, tx) = comms::channel(rx, tx, id);
        Self { rx, tx }
    }

    async fn recv(&mut self) -> Msg {
        let (source, msg) = time::timeout(Duration::from_secs(2), self.rx.recv::<Msg>())
            .await
            .expect("the worker sent nothing")
            .unwrap();

        assert_eq!(source, WORKER_ID);
        msg
    }

    async fn send(&mut self, msg: Msg) {
        self.tx.send(&msg).await.unwrap();
    }

    async fn recv_push(&mut self) -> PushRequest {
        match self.recv().await {
            Msg::Push(request) => request,
            other => panic!("expected a push, got {other:?}"),
        }
    }

    async fn recv_pull(&mut self) -> PullRequest {
        match self.recv().await {
            Msg::Pull(request) => request,
            other => panic!("expected a pull, got {other:?}"),
        }
    }

    /// Answers the next pull with `value(key)` for every requested key.
    async fn answer_pull<F: Fn(Key) -> f32>(&mut self, value: F) -> PullRequest {
        let request = self.recv_pull().await;

        self.send(Msg::PullResponse(PullResponse {
            request_id: request.request_id,
            keys: request.keys.clone(),
            values: request.keys.iter().map(|&k| vec![value(k)]).collect(),
        }))
        .await;

        request
    }

    async fn ack_push(&mut self) -> PushRequest {
        let request = self.recv_push().await;
        self.send(Msg::PushAck(request.request_id)).await;
        request
    }
}

fn spec(consistency: &str) -> ClusterSpec {
    let json = format!(
        r#"{{
            "scheduler": "127.0.0.1:1",
            "servers": ["127.0.0.1:2", "127.0.0.1:3"],
            "workers": ["127.0.0.1:4"],
            "key_space": 20,
            "consistency": {{ "policy": "{consistency}" }},
            "retries": 2,
            "timeouts": {{ "request_ms": 200, "backoff_ms": 5 }}
        }}"#
    );

    ClusterSpec::from_json(&json).unwrap()
}

/// Creates the worker with a scripted scheduler and two scripted servers.
fn start(consistency: &str) -> (KvWorker, MockPeer, Vec<MockPeer>) {
    start_with(spec(consistency))
}

fn start_with(spec: ClusterSpec) -> (KvWorker, MockPeer, Vec<MockPeer>) {
    let (outbox, inbox) = transport::transport(WORKER_ID);

    let scheduler = MockPeer::connect(&outbox, SCHEDULER_ID);
    let servers = spec
        .server_ids()
        .into_iter()
        .map(|id| MockPeer::connect(&outbox, id))
        .collect();

    (KvWorker::new(&spec, outbox, inbox), scheduler, servers)
}

#[tokio::test]
async fn pull_merges_answers_in_caller_order() {
    let (mut worker, _scheduler, mut servers) = start("eventual");
    let (first, second) = servers.split_at_mut(1);

    let (values, low, high) = tokio::join!(
        worker.pull(&[15, 3, 12, 3]),
        first[0].answer_pull(|k| k as f32 * 10.0),
        second[0].answer_pull(|k| k as f32 * 10.0),
    );

    assert_eq!(
        values.unwrap(),
        vec![vec![150.0], vec![30.0], vec![120.0], vec![30.0]]
    );
    assert_eq!(low.keys, vec![3, 3]);
    assert_eq!(high.keys, vec![15, 12]);
    assert_eq!(low.request_id, high.request_id);
    assert_eq!(low.clock, 0);
}

#[tokio::test]
async fn push_is_split_by_owner_and_wait_awaits_every_ack() {
    let (mut worker, _scheduler, mut servers) = start("eventual");

    let id = worker
        .push(&[3, 15, 4], &[vec![1.0], vec![2.0], vec![3.0]])
        .await
        .unwrap();
    assert_eq!(worker.in_flight(), 1);
    assert_eq!(worker.clock(), 1);

    let (first, second) = servers.split_at_mut(1);
    let (waited, low, high) = tokio::join!(
        worker.wait(id),
        first[0].ack_push(),
        second[0].ack_push()
    );

    waited.unwrap();
    assert_eq!(low.keys, vec![3, 4]);
    assert_eq!(low.values, vec![vec![1.0], vec![3.0]]);
    assert_eq!(high.keys, vec![15]);
    assert_eq!((low.clock, high.clock), (1, 1));
    assert_eq!(worker.in_flight(), 0);

    worker.wait(id).await.unwrap();
}

#[tokio::test]
async fn eventual_pushes_skip_servers_without_keys() {
    let (mut worker, _scheduler, mut servers) = start("eventual");

    let id = worker.push(&[3], &[vec![1.0]]).await.unwrap();
    let (waited, _) = tokio::join!(worker.wait(id), servers[0].ack_push());
    waited.unwrap();

    let id = worker.push(&[16], &[vec![1.0]]).await.unwrap();
    let (waited, request) = tokio::join!(worker.wait(id), servers[1].ack_push());
    waited.unwrap();

    assert_eq!(request.clock, 2);
    assert_eq!(request.keys, vec![16]);
}

#[tokio::test]
async fn clocked_pushes_tick_every_server() {
    let (mut worker, _scheduler, mut servers) = start("sequential");

    let id = worker.push(&[3], &[vec![1.0]]).await.unwrap();

    let (first, second) = servers.split_at_mut(1);
    let (waited, low, high) = tokio::join!(
        worker.wait(id),
        first[0].ack_push(),
        second[0].ack_push()
    );

    waited.unwrap();
    assert_eq!(low.keys, vec![3]);
    assert!(high.keys.is_empty());
    assert_eq!((low.clock, high.clock), (1, 1));
}

#[tokio::test]
async fn server_rejections_surface_as_unknown_key() {
    let (mut worker, _scheduler, mut servers) = start("eventual");

    let reject = async {
        let request = servers[0].recv_pull().await;
        servers[0]
            .send(Msg::Err(Rejection {
                request_id: request.request_id,
                code: ErrorCode::UnknownKey,
                key: 3,
                detail: "not mine".into(),
            }))
            .await;
    };

    let (pulled, ()) = tokio::join!(worker.pull(&[3]), reject);
    assert!(matches!(pulled, Err(PsError::UnknownKey { key: 3, .. })));
}

#[tokio::test]
async fn invalid_requests_fail_before_sending() {
    let (mut worker, _scheduler, _servers) = start("eventual");

    assert!(matches!(
        worker.pull(&[1, 25]).await,
        Err(PsError::UnknownKey { key: 25, .. })
    ));
    assert!(matches!(
        worker.push(&[1], &[vec![1.0, 2.0]]).await,
        Err(PsError::SizeMismatch { key: 1, got: 2, expected: 1 })
    ));
    assert!(matches!(
        worker.push(&[1, 2], &[vec![1.0]]).await,
        Err(PsError::Protocol(_))
    ));

    assert_eq!(worker.clock(), 0);
    assert_eq!(worker.in_flight(), 0);
}

#[tokio::test]
async fn pull_times_out_and_late_answers_are_dropped() {
    let (mut worker, _scheduler, mut servers) = start("eventual");

    let err = worker.pull(&[3]).await.unwrap_err();
    assert!(matches!(err, PsError::Timeout(_)), "{err:?}");

    // the first answer arrives too late and must not leak into the next pull
    let stale = servers[0].answer_pull(|_| -1.0).await;

    let (values, fresh) = tokio::join!(worker.pull(&[3]), servers[0].answer_pull(|_| 7.0));
    assert_eq!(values.unwrap(), vec![vec![7.0]]);
    assert_ne!(stale.request_id, fresh.request_id);
}

#[tokio::test]
async fn dead_servers_become_unreachable_after_the_retries() {
    let (mut worker, _scheduler, mut servers) = start("eventual");
    drop(servers.pop());

    let err = worker.pull(&[15]).await.unwrap_err();
    assert!(matches!(err, PsError::UnreachableServer(2)), "{err:?}");

    let (values, _) = tokio::join!(worker.pull(&[2]), servers[0].answer_pull(|_| 1.0));
    assert_eq!(values.unwrap(), vec![vec![1.0]]);
}

#[tokio::test]
async fn push_pull_observes_its_own_push() {
    let (mut worker, _scheduler, mut servers) = start("eventual");

    let serve = async {
        let push = servers[0].ack_push().await;
        let pull = servers[0].answer_pull(|_| 5.0).await;
        (push, pull)
    };

    let deltas = [vec![5.0]];
    let (values, (push, pull)) = tokio::join!(worker.push_pull(&[3], &deltas), serve);

    assert_eq!(values.unwrap(), vec![vec![5.0]]);
    assert_eq!(push.keys, pull.keys);
    assert_eq!(pull.clock, 1);
}

#[tokio::test]
async fn barrier_waits_for_the_release() {
    let (mut worker, mut scheduler, _servers) = start("eventual");

    let release = async {
        assert_eq!(scheduler.recv().await, Msg::Barrier(BarrierGroup::Workers));
        scheduler.send(Msg::Heartbeat).await;
        scheduler
            .send(Msg::BarrierRelease(BarrierGroup::Workers))
            .await;
    };

    let (res, ()) = tokio::join!(worker.barrier(), release);
    res.unwrap();
}

#[tokio::test]
async fn finalize_drains_and_waits_for_shutdown() {
    let (mut worker, mut scheduler, mut servers) = start("eventual");

    worker.push(&[3], &[vec![1.0]]).await.unwrap();

    let cluster = async {
        servers[0].ack_push().await;
        assert_eq!(scheduler.recv().await, Msg::Finalize);
        scheduler.send(Msg::Shutdown).await;
    };

    let (res, ()) = tokio::join!(worker.finalize(Duration::from_secs(1)), cluster);
    res.unwrap();
}

#[tokio::test]
async fn acknowledged_pushes_are_forgotten_without_waiting() {
    let (mut worker, _scheduler, mut servers) = start("eventual");
    let mut ids = Vec::new();

    for _ in 0..50 {
        ids.push(worker.push(&[1], &[vec![1.0]]).await.unwrap());
        servers[0].ack_push().await;
    }

    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(worker.in_flight(), 0);
    assert_eq!(worker.outstanding(), 0);

    for id in ids {
        worker.wait(id).await.unwrap();
    }
}

#[tokio::test]
async fn unanswered_pushes_stay_in_flight() {
    let (mut worker, _scheduler, mut servers) = start("eventual");

    let acked = worker.push(&[1], &[vec![1.0]]).await.unwrap();
    servers[0].ack_push().await;
    let silent = worker.push(&[2], &[vec![1.0]]).await.unwrap();
    servers[0].recv_push().await;

    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(worker.in_flight(), 1);

    worker.wait(acked).await.unwrap();
    assert!(matches!(worker.wait(silent).await, Err(PsError::Timeout(_))));
    assert_eq!(worker.in_flight(), 0);
}

#[tokio::test]
async fn failed_fan_outs_release_every_slot() {
    let (mut worker, _scheduler, mut servers) = start("eventual");

    for _ in 0..3 {
        let err = worker.pull(&[1, 15]).await.unwrap_err();
        assert!(matches!(err, PsError::Timeout(_)), "{err:?}");
        assert_eq!(worker.outstanding(), 0);

        servers[0].recv_pull().await;
        servers[1].recv_pull().await;
    }

    let reject = async {
        let request = servers[0].recv_pull().await;
        servers[0]
            .send(Msg::Err(Rejection {
                request_id: request.request_id,
                code: ErrorCode::UnknownKey,
                key: 1,
                detail: "not mine".into(),
            }))
            .await;
    };

    let (pulled, ()) = tokio::join!(worker.pull(&[1, 15]), reject);
    assert!(matches!(pulled, Err(PsError::UnknownKey { key: 1, .. })));
    assert_eq!(worker.outstanding(), 0);
}

#[tokio::test]
async fn oversized_requests_are_refused_before_sending() {
    let mut spec = spec("eventual");
    spec.value_len = NonZeroUsize::new(MAX_PAYLOAD / size_of::<f32>()).unwrap();
    let (mut worker, _scheduler, mut servers) = start_with(spec.clone());

    let err = worker.pull(&[3]).await.unwrap_err();
    assert!(matches!(err, PsError::PayloadTooLarge { max: MAX_PAYLOAD, .. }), "{err:?}");
    assert!(!err.is_transient());

    let deltas = [vec![0.0; spec.value_len.get()]];
    let err = worker.push(&[3], &deltas).await.unwrap_err();
    assert!(matches!(err, PsError::PayloadTooLarge { .. }), "{err:?}");

    assert_eq!(worker.clock(), 0);
    assert_eq!(worker.outstanding(), 0);
    assert!(
        time::timeout(Duration::from_millis(50), servers[0].rx.recv::<Msg>())
            .await
            .is_err()
    );
}
