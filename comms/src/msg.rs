use std::io;

use bytes::{Buf, BufMut};

use crate::{Deserialize, Key, PsError, Serialize, node::NodeRole};

/// Identifies a request across the per-server messages it fans out into.
pub type RequestId = u64;

const HELLO: u8 = 0;
const PUSH: u8 = 1;
const PUSH_ACK: u8 = 2;
const PULL: u8 = 3;
const PULL_RESPONSE: u8 = 4;
const BARRIER: u8 = 5;
const BARRIER_RELEASE: u8 = 6;
const HEARTBEAT: u8 = 7;
const FINALIZE: u8 = 8;
const SHUTDOWN: u8 = 9;
const ERR: u8 = 10;

/// A batch of deltas for keys owned by the receiving server.
#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    pub request_id: RequestId,
    pub clock: u64,
    pub keys: Vec<Key>,
    pub values: Vec<Vec<f32>>,
}

/// Asks the receiving server for the current values of `keys`.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub request_id: RequestId,
    pub clock: u64,
    pub keys: Vec<Key>,
}

/// The answer to a `PullRequest`, `values[i]` belongs to `keys[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PullResponse {
    pub request_id: RequestId,
    pub keys: Vec<Key>,
    pub values: Vec<Vec<f32>>,
}

/// The set of nodes taking part in a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierGroup {
    Workers,
    Servers,
    All,
}

impl BarrierGroup {
    fn as_byte(self) -> u8 {
        match self {
            Self::Workers => 0,
            Self::Servers => 1,
            Self::All => 2,
        }
    }

    fn from_byte(byte: u8) -> io::Result<Self> {
        match byte {
            0 => Ok(Self::Workers),
            1 => Ok(Self::Servers),
            2 => Ok(Self::All),
            byte => Err(invalid(format!("invalid barrier group byte {byte}"))),
        }
    }

    /// Whether a node of `role` belongs to this group.
    pub fn includes(self, role: NodeRole) -> bool {
        match self {
            Self::Workers => role == NodeRole::Worker,
            Self::Servers => role == NodeRole::Server,
            Self::All => role != NodeRole::Scheduler,
        }
    }
}

/// Why a server refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownKey,
    SizeMismatch,
    Protocol,
}

impl ErrorCode {
    fn as_byte(self) -> u8 {
        match self {
            Self::UnknownKey => 0,
            Self::SizeMismatch => 1,
            Self::Protocol => 2,
        }
    }

    fn from_byte(byte: u8) -> io::Result<Self> {
        match byte {
            0 => Ok(Self::UnknownKey),
            1 => Ok(Self::SizeMismatch),
            2 => Ok(Self::Protocol),
            byte => Err(invalid(format!("invalid error code byte {byte}"))),
        }
    }
}

/// A server side rejection of a push or a pull.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub request_id: RequestId,
    pub code: ErrorCode,
    pub key: Key,
    pub detail: String,
}

impl Rejection {
    /// Describes `err` so that it can be sent back to the requester.
    pub fn from_error(request_id: RequestId, err: &PsError) -> Self {
        let (code, key) = match err {
            PsError::UnknownKey { key, .. } => (ErrorCode::UnknownKey, *key),
            PsError::SizeMismatch { key, .. } => (ErrorCode::SizeMismatch, *key),
            _ => (ErrorCode::Protocol, 0),
        };

        Self {
            request_id,
            code,
            key,
            detail: err.to_string(),
        }
    }

    /// The error the requester surfaces to its caller.
    pub fn into_error(self) -> PsError {
        match self.code {
            ErrorCode::UnknownKey => PsError::UnknownKey {
                key: self.key,
                detail: self.detail,
            },
            ErrorCode::SizeMismatch | ErrorCode::Protocol => {
                PsError::Protocol(format!(
                    "server rejected request {}: {}",
                    self.request_id, self.detail
                ))
            }
        }
    }
}

/// The application layer message for the entire system.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    /// First frame on every connection, announces the sender's role.
    Hello(NodeRole),
    Push(PushRequest),
    PushAck(RequestId),
    Pull(PullRequest),
    PullResponse(PullResponse),
    /// The sender entered a barrier.
    Barrier(BarrierGroup),
    /// Every member of the group entered the barrier.
    BarrierRelease(BarrierGroup),
    Heartbeat,
    /// A worker is done and waits for the cluster to shut down.
    Finalize,
    Shutdown,
    Err(Rejection),
}

impl Msg {
    /// A short human readable name of the kind of this message.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Push(_) => "push",
            Self::PushAck(_) => "push_ack",
            Self::Pull(_) => "pull",
            Self::PullResponse(_) => "pull_response",
            Self::Barrier(_) => "barrier",
            Self::BarrierRelease(_) => "barrier_release",
            Self::Heartbeat => "heartbeat",
            Self::Finalize => "finalize",
            Self::Shutdown => "shutdown",
            Self::Err(_) => "err",
        }
    }

    /// The size of the encoded payload, without the envelope.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Hello(_) | Self::Barrier(_) | Self::BarrierRelease(_) => 1,
            Self::Push(req) => 16 + pairs_len(req.values.iter().map(Vec::len)),
            Self::PushAck(_) => 8,
            Self::Pull(req) => 20 + req.keys.len() * size_of::<Key>(),
            Self::PullResponse(res) => 8 + pairs_len(res.values.iter().map(Vec::len)),
            Self::Heartbeat | Self::Finalize | Self::Shutdown => 0,
            Self::Err(rejection) => 21 + rejection.detail.len(),
        }
    }

    /// The payload size of a `PushRequest` carrying `keys` deltas of
    /// `value_len` floats each.
    pub fn push_len(keys: usize, value_len: usize) -> usize {
        16 + pairs_len(std::iter::repeat_n(value_len, keys))
    }

    /// The payload size of a `PullResponse` carrying `keys` values of
    /// `value_len` floats each.
    pub fn response_len(keys: usize, value_len: usize) -> usize {
        8 + pairs_len(std::iter::repeat_n(value_len, keys))
    }
}

/// Count prefix, then key, length and floats per pair.
fn pairs_len(lens: impl Iterator<Item = usize>) -> usize {
    4 + lens.map(|len| 12 + len * size_of::<f32>()).sum::<usize>()
}

impl Serialize for Msg {
    fn kind(&self) -> u8 {
        match self {
            Self::Hello(_) => HELLO,
            Self::Push(_) => PUSH,
            Self::PushAck(_) => PUSH_ACK,
            Self::Pull(_) => PULL,
            Self::PullResponse(_) => PULL_RESPONSE,
            Self::Barrier(_) => BARRIER,
            Self::BarrierRelease(_) => BARRIER_RELEASE,
            Self::Heartbeat => HEARTBEAT,
            Self::Finalize => FINALIZE,
            Self::Shutdown => SHUTDOWN,
            Self::Err(_) => ERR,
        }
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::Hello(role) => buf.put_u8(role.as_byte()),
            Self::Push(req) => {
                buf.put_u64(req.request_id);
                buf.put_u64(req.clock);
                put_pairs(buf, &req.keys, &req.values);
            }
            Self::PushAck(request_id) => buf.put_u64(*request_id),
            Self::Pull(req) => {
                buf.put_u64(req.request_id);
                buf.put_u64(req.clock);
                buf.put_u32(req.keys.len() as u32);
                req.keys.iter().for_each(|&key| buf.put_u64(key));
            }
            Self::PullResponse(res) => {
                buf.put_u64(res.request_id);
                put_pairs(buf, &res.keys, &res.values);
            }
            Self::Barrier(group) | Self::BarrierRelease(group) => buf.put_u8(group.as_byte()),
            Self::Heartbeat | Self::Finalize | Self::Shutdown => {}
            Self::Err(rejection) => {
                buf.put_u64(rejection.request_id);
                buf.put_u8(rejection.code.as_byte());
                buf.put_u64(rejection.key);
                buf.put_u32(rejection.detail.len() as u32);
                buf.put_slice(rejection.detail.as_bytes());
            }
        }
    }
}

impl Deserialize for Msg {
    fn deserialize(kind: u8, mut buf: &[u8]) -> io::Result<Self> {
        let buf = &mut buf;

        let msg = match kind {
            HELLO => {
                let byte = get_u8(buf)?;
                let role = NodeRole::from_byte(byte)
                    .ok_or_else(|| invalid(format!("invalid role byte {byte}")))?;

                Self::Hello(role)
            }
            PUSH => {
                let request_id = get_u64(buf)?;
                let clock = get_u64(buf)?;
                let (keys, values) = get_pairs(buf)?;

                Self::Push(PushRequest {
                    request_id,
                    clock,
                    keys,
                    values,
                })
            }
            PUSH_ACK => Self::PushAck(get_u64(buf)?),
            PULL => {
                let request_id = get_u64(buf)?;
                let clock = get_u64(buf)?;
                let n = get_u32(buf)? as usize;
                ensure(buf, n * size_of::<Key>())?;
                let keys = (0..n).map(|_| buf.get_u64()).collect();

                Self::Pull(PullRequest {
                    request_id,
                    clock,
                    keys,
                })
            }
            PULL_RESPONSE => {
                let request_id = get_u64(buf)?;
                let (keys, values) = get_pairs(buf)?;

                Self::PullResponse(PullResponse {
                    request_id,
                    keys,
                    values,
                })
            }
            BARRIER => Self::Barrier(BarrierGroup::from_byte(get_u8(buf)?)?),
            BARRIER_RELEASE => Self::BarrierRelease(BarrierGroup::from_byte(get_u8(buf)?)?),
            HEARTBEAT => Self::Heartbeat,
            FINALIZE => Self::Finalize,
            SHUTDOWN => Self::Shutdown,
            ERR => {
                let request_id = get_u64(buf)?;
                let code = ErrorCode::from_byte(get_u8(buf)?)?;
                let key = get_u64(buf)?;
                let len = get_u32(buf)? as usize;
                ensure(buf, len)?;
                let detail = String::from_utf8(buf[..len].to_vec()).map_err(invalid)?;
                buf.advance(len);

                Self::Err(Rejection {
                    request_id,
                    code,
                    key,
                    detail,
                })
            }
            byte => return Err(invalid(format!("received an invalid kind byte {byte}"))),
        };

        if buf.has_remaining() {
            return Err(invalid(format!(
                "{} trailing bytes after a {} payload",
                buf.remaining(),
                msg.kind_name()
            )));
        }

        Ok(msg)
    }
}

fn put_pairs<B: BufMut>(buf: &mut B, keys: &[Key], values: &[Vec<f32>]) {
    debug_assert_eq!(keys.len(), values.len(), "every key needs exactly one value");
    buf.put_u32(keys.len() as u32);

    for (&key, value) in keys.iter().zip(values) {
        buf.put_u64(key);
        buf.put_u32(value.len() as u32);
        value.iter().for_each(|&v| buf.put_f32(v));
    }
}

fn get_pairs(buf: &mut &[u8]) -> io::Result<(Vec<Key>, Vec<Vec<f32>>)> {
    let n = get_u32(buf)? as usize;
    let mut keys = Vec::with_capacity(n.min(buf.remaining()));
    let mut values = Vec::with_capacity(n.min(buf.remaining()));

    for _ in 0..n {
        keys.push(get_u64(buf)?);
        let len = get_u32(buf)? as usize;
        ensure(buf, len * size_of::<f32>())?;
        values.push((0..len).map(|_| buf.get_f32()).collect());
    }

    Ok((keys, values))
}

fn ensure(buf: &&[u8], needed: usize) -> io::Result<()> {
    if buf.remaining() < needed {
        return Err(invalid(format!(
            "the given buffer is too small {}, must at least be {needed} bytes",
            buf.remaining()
        )));
    }

    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> io::Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> io::Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8]) -> io::Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn invalid<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &Msg) -> Msg {
        let mut buf = Vec::new();
        msg.serialize(&mut buf);
        Msg::deserialize(msg.kind(), &buf).unwrap()
    }

    #[test]
    fn push_request_round_trip() {
        let msg = Msg::Push(PushRequest {
            request_id: 42,
            clock: 7,
            keys: vec![3, 15, 1 << 40],
            values: vec![vec![5.0], vec![2.0, -1.5], vec![]],
        });

        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn pull_response_round_trip() {
        let msg = Msg::PullResponse(PullResponse {
            request_id: 9,
            keys: vec![0, 19],
            values: vec![vec![6.0, 0.25], vec![f32::MAX, f32::MIN_POSITIVE]],
        });

        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn rejection_round_trip() {
        let err = PsError::UnknownKey {
            key: 12,
            detail: "outside of shard [0, 10)".into(),
        };
        let msg = Msg::Err(Rejection::from_error(3, &err));

        let Msg::Err(rejection) = round_trip(&msg) else {
            panic!("expected a rejection");
        };

        assert_eq!(rejection.code, ErrorCode::UnknownKey);
        assert!(matches!(rejection.into_error(), PsError::UnknownKey { key: 12, .. }));
    }

    #[test]
    fn truncated_payload_is_invalid_data() {
        let msg = Msg::Push(PushRequest {
            request_id: 1,
            clock: 1,
            keys: vec![1, 2],
            values: vec![vec![1.0, 2.0], vec![3.0]],
        });

        let mut buf = Vec::new();
        msg.serialize(&mut buf);
        buf.truncate(buf.len() - 2);

        let err = Msg::deserialize(msg.kind(), &buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn trailing_bytes_are_invalid_data() {
        let err = Msg::deserialize(HEARTBEAT, &[0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unknown_kind_is_invalid_data() {
        let err = Msg::deserialize(200, &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn payload_len_matches_the_encoding() {
        let rejection = Rejection::from_error(1, &PsError::Protocol("clock went back".into()));
        let msgs = [
            Msg::Hello(NodeRole::Worker),
            Msg::Push(PushRequest {
                request_id: 4,
                clock: 2,
                keys: vec![1, 9],
                values: vec![vec![1.0, 2.0], vec![]],
            }),
            Msg::PushAck(4),
            Msg::Pull(PullRequest {
                request_id: 5,
                clock: 2,
                keys: vec![1, 2, 3],
            }),
            Msg::PullResponse(PullResponse {
                request_id: 5,
                keys: vec![1, 2, 3],
                values: vec![vec![0.5; 4]; 3],
            }),
            Msg::BarrierRelease(BarrierGroup::All),
            Msg::Shutdown,
            Msg::Err(rejection),
        ];

        for msg in &msgs {
            let mut buf = Vec::new();
            msg.serialize(&mut buf);
            assert_eq!(msg.payload_len(), buf.len(), "{}", msg.kind_name());
        }

        assert_eq!(Msg::response_len(3, 4), msgs[4].payload_len());

        let push = Msg::Push(PushRequest {
            request_id: 6,
            clock: 3,
            keys: vec![1, 9],
            values: vec![vec![1.0, 2.0]; 2],
        });
        assert_eq!(Msg::push_len(2, 2), push.payload_len());
    }

    #[test]
    #[should_panic(expected = "every key needs exactly one value")]
    #[cfg(debug_assertions)]
    fn mismatched_pairs_are_caught_while_encoding() {
        let msg = Msg::Push(PushRequest {
            request_id: 1,
            clock: 1,
            keys: vec![1, 2],
            values: vec![vec![1.0]],
        });

        msg.serialize(&mut Vec::new());
    }

    #[test]
    fn barrier_membership() {
        assert!(BarrierGroup::All.includes(NodeRole::Server));
        assert!(BarrierGroup::All.includes(NodeRole::Worker));
        assert!(!BarrierGroup::All.includes(NodeRole::Scheduler));
        assert!(!BarrierGroup::Workers.includes(NodeRole::Server));
    }
}
