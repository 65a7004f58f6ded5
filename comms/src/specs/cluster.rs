use std::{collections::HashSet, env, fs, num::NonZeroUsize, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    PsError, Result,
    node::{NodeId, NodeRole, SCHEDULER_ID},
    partition::Partitioner,
};

/// Environment variable naming the cluster spec file.
pub const CONFIG_ENV: &str = "PS_CONFIG";

/// How the key space is split among the servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionSpec {
    #[default]
    Range,
    Hash,
}

/// The synchronization model enforced by the servers for the whole job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ConsistencySpec {
    #[default]
    Eventual,
    BoundedDelay {
        staleness: u64,
    },
    Sequential,
}

impl ConsistencySpec {
    /// Whether servers need to observe every worker clock tick.
    pub fn tracks_clocks(&self) -> bool {
        !matches!(self, Self::Eventual)
    }
}

/// How a pushed delta is folded into the stored value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineSpec {
    #[default]
    Add,
    Replace,
}

/// Every timeout in the runtime, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSpec {
    pub bootstrap_ms: u64,
    pub request_ms: u64,
    pub finalize_ms: u64,
    pub heartbeat_ms: u64,
    pub backoff_ms: u64,
}

impl Default for TimeoutSpec {
    fn default() -> Self {
        Self {
            bootstrap_ms: 10_000,
            request_ms: 5_000,
            finalize_ms: 5_000,
            heartbeat_ms: 1_000,
            backoff_ms: 50,
        }
    }
}

impl TimeoutSpec {
    pub fn bootstrap(&self) -> Duration {
        Duration::from_millis(self.bootstrap_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn finalize(&self) -> Duration {
        Duration::from_millis(self.finalize_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn default_value_len() -> NonZeroUsize {
    NonZeroUsize::MIN
}

fn default_retries() -> u32 {
    3
}

/// The static description of a training job's cluster.
///
/// Node ids derive from the position of each address: the scheduler is `0`,
/// servers follow in rank order and workers come last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub scheduler: String,
    pub servers: Vec<String>,
    pub workers: Vec<String>,
    pub key_space: u64,
    #[serde(default = "default_value_len")]
    pub value_len: NonZeroUsize,
    #[serde(default)]
    pub partition: PartitionSpec,
    #[serde(default)]
    pub consistency: ConsistencySpec,
    #[serde(default)]
    pub combine: CombineSpec,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub timeouts: TimeoutSpec,
}

impl ClusterSpec {
    /// Parses and validates a spec from its JSON representation.
    ///
    /// # Arguments
    /// * `json` - The JSON document.
    ///
    /// # Returns
    /// A validated spec or a `PsError::Config`.
    pub fn from_json(json: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(json)
            .map_err(|e| PsError::Config(format!("invalid cluster spec: {e}")))?;

        spec.validate()?;
        Ok(spec)
    }

    /// Reads, parses and validates a spec file.
    ///
    /// # Arguments
    /// * `path` - The path of the JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| PsError::Config(format!("cannot read '{}': {e}", path.display())))?;

        Self::from_json(&content)
    }

    /// Loads the spec file named by the `PS_CONFIG` environment variable.
    pub fn from_env() -> Result<Self> {
        let path = env::var(CONFIG_ENV)
            .map_err(|_| PsError::Config(format!("{CONFIG_ENV} is not set")))?;

        Self::load(path)
    }

    /// Checks the role quotas and the key space declaration.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.trim().is_empty() {
            return Err(PsError::Config("the scheduler address is empty".into()));
        }

        if self.servers.is_empty() {
            return Err(PsError::Config("at least one server must be declared".into()));
        }

        if self.workers.is_empty() {
            return Err(PsError::Config("at least one worker must be declared".into()));
        }

        if self.key_space == 0 {
            return Err(PsError::Config("the key space must not be empty".into()));
        }

        if self.partition == PartitionSpec::Range && self.key_space < self.servers.len() as u64 {
            return Err(PsError::Config(format!(
                "range partitioning needs at least one key per server, got {} keys for {} servers",
                self.key_space,
                self.servers.len()
            )));
        }

        let mut listeners = HashSet::new();
        for addr in std::iter::once(&self.scheduler).chain(&self.servers) {
            if !listeners.insert(addr.as_str()) {
                return Err(PsError::Config(format!("address {addr} is declared twice")));
            }
        }

        Ok(())
    }

    pub fn num_servers(&self) -> usize {
        self.servers.len()
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// The node id of the server with the given rank.
    pub fn server_id(&self, rank: usize) -> NodeId {
        1 + rank as NodeId
    }

    /// The node id of the worker with the given rank.
    pub fn worker_id(&self, rank: usize) -> NodeId {
        1 + (self.num_servers() + rank) as NodeId
    }

    pub fn server_ids(&self) -> Vec<NodeId> {
        (0..self.num_servers()).map(|r| self.server_id(r)).collect()
    }

    pub fn worker_ids(&self) -> Vec<NodeId> {
        (0..self.num_workers()).map(|r| self.worker_id(r)).collect()
    }

    /// Finds the role and rank of a node id.
    ///
    /// # Returns
    /// `None` if the id is not declared in this spec.
    pub fn role_of(&self, id: NodeId) -> Option<(NodeRole, usize)> {
        let id = id as usize;
        let servers = self.num_servers();

        match id {
            0 => Some((NodeRole::Scheduler, 0)),
            id if id <= servers => Some((NodeRole::Server, id - 1)),
            id if id <= servers + self.num_workers() => Some((NodeRole::Worker, id - 1 - servers)),
            _ => None,
        }
    }

    /// The declared address of a node.
    pub fn addr_of(&self, id: NodeId) -> Option<&str> {
        match self.role_of(id)? {
            (NodeRole::Scheduler, _) => Some(&self.scheduler),
            (NodeRole::Server, rank) => self.servers.get(rank).map(String::as_str),
            (NodeRole::Worker, rank) => self.workers.get(rank).map(String::as_str),
        }
    }

    /// The ids a node of `role` must be connected to once bootstrapped.
    pub fn expected_peers(&self, role: NodeRole) -> Vec<NodeId> {
        match role {
            NodeRole::Scheduler => {
                let mut peers = self.server_ids();
                peers.extend(self.worker_ids());
                peers
            }
            NodeRole::Server => {
                let mut peers = vec![SCHEDULER_ID];
                peers.extend(self.worker_ids());
                peers
            }
            NodeRole::Worker => {
                let mut peers = vec![SCHEDULER_ID];
                peers.extend(self.server_ids());
                peers
            }
        }
    }

    /// Builds the key partitioner every node agrees on.
    pub fn partitioner(&self) -> Partitioner {
        Partitioner::new(self.partition, self.key_space, self.num_servers())
    }
}
