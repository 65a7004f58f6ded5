use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::PsError;

/// Unique identifier of a node inside a cluster.
pub type NodeId = u32;

/// The scheduler always takes the first id.
pub const SCHEDULER_ID: NodeId = 0;

/// The role a process plays for the whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Scheduler,
    Server,
    Worker,
}

impl NodeRole {
    /// The single byte used to carry the role on the wire.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Scheduler => 0,
            Self::Server => 1,
            Self::Worker => 2,
        }
    }

    /// Inverse of `NodeRole::as_byte`.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Scheduler),
            1 => Some(Self::Server),
            2 => Some(Self::Worker),
            _ => None,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scheduler => "scheduler",
            Self::Server => "server",
            Self::Worker => "worker",
        };

        f.write_str(name)
    }
}

impl FromStr for NodeRole {
    type Err = PsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduler" => Ok(Self::Scheduler),
            "server" => Ok(Self::Server),
            "worker" => Ok(Self::Worker),
            other => Err(PsError::Config(format!("unknown node role `{other}`"))),
        }
    }
}

/// The resolved identity of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub role: NodeRole,
    pub addr: String,
    pub rank: usize,
}

impl NodeInfo {
    pub fn is_scheduler(&self) -> bool {
        self.role == NodeRole::Scheduler
    }

    pub fn is_server(&self) -> bool {
        self.role == NodeRole::Server
    }

    pub fn is_worker(&self) -> bool {
        self.role == NodeRole::Worker
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} (node {}, {})", self.role, self.rank, self.id, self.addr)
    }
}
