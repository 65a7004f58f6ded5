use std::{io, time::Duration};

use thiserror::Error;

use crate::{Key, node::NodeId};

/// The result type shared by every layer of the runtime.
pub type Result<T> = std::result::Result<T, PsError>;

/// Every failure the runtime can surface at its call boundaries.
#[derive(Debug, Error)]
pub enum PsError {
    /// Malformed or incomplete cluster configuration.
    #[error("config error: {0}")]
    Config(String),

    /// A declared node did not join within the bootstrap timeout.
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    /// Transient transport failure towards `peer`.
    #[error("link to node {peer} failed: {reason}")]
    Link { peer: NodeId, reason: String },

    /// The retry budget towards a server ran out.
    #[error("server {0} is unreachable")]
    UnreachableServer(NodeId),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The partitioning agreement between nodes is broken.
    #[error("unknown key {key}: {detail}")]
    UnknownKey { key: Key, detail: String },

    /// Operation invoked outside of a valid lifecycle state.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("value length mismatch for key {key}: got {got}, expected {expected}")]
    SizeMismatch {
        key: Key,
        got: usize,
        expected: usize,
    },

    /// A request too large to fit in a single frame.
    #[error("payload of {len} bytes exceeds the {max} bytes limit")]
    PayloadTooLarge { len: usize, max: usize },

    /// The remote side sent something it shouldn't have.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl PsError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Link { .. })
    }

    /// Creates a `Link` error from anything printable.
    pub fn link(peer: NodeId, reason: impl ToString) -> Self {
        Self::Link {
            peer,
            reason: reason.to_string(),
        }
    }
}
