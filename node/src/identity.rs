use std::env;

use comms::{
    PsError, Result,
    node::{NodeInfo, NodeRole, SCHEDULER_ID},
    specs::cluster::ClusterSpec,
};

/// Environment variable holding the role of the process.
pub const ROLE_ENV: &str = "PS_ROLE";

/// Environment variable holding the rank of the process within its role.
pub const RANK_ENV: &str = "PS_RANK";

/// The role and rank a process was launched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleAssignment {
    pub role: NodeRole,
    pub rank: usize,
}

impl RoleAssignment {
    pub fn new(role: NodeRole, rank: usize) -> Self {
        Self { role, rank }
    }

    /// Reads `PS_ROLE` and `PS_RANK`, the rank defaults to `0`.
    pub fn from_env() -> Result<Self> {
        let role = env::var(ROLE_ENV)
            .map_err(|_| PsError::Config(format!("{ROLE_ENV} is not set")))?
            .parse()?;

        let rank = match env::var(RANK_ENV) {
            Ok(rank) => rank
                .trim()
                .parse::<usize>()
                .map_err(|e| PsError::Config(format!("invalid {RANK_ENV} `{rank}`: {e}")))?,
            Err(_) => 0,
        };

        Ok(Self { role, rank })
    }
}

/// Resolves the identity of this process within the cluster.
///
/// # Arguments
/// * `spec` - The specification of the cluster.
/// * `role` - The role this process plays.
/// * `rank` - The rank of this process within its role.
///
/// # Returns
/// The node info or a `PsError::Config` if the spec is incomplete or the
/// rank isn't declared for the role.
pub fn resolve(spec: &ClusterSpec, role: NodeRole, rank: usize) -> Result<NodeInfo> {
    spec.validate()?;

    let (id, addr) = match role {
        NodeRole::Scheduler if rank == 0 => (SCHEDULER_ID, &spec.scheduler),
        NodeRole::Scheduler => {
            return Err(PsError::Config(format!(
                "there is a single scheduler, got rank {rank}"
            )));
        }
        NodeRole::Server => match spec.servers.get(rank) {
            Some(addr) => (spec.server_id(rank), addr),
            None => return Err(out_of_range(role, rank, spec.num_servers())),
        },
        NodeRole::Worker => match spec.workers.get(rank) {
            Some(addr) => (spec.worker_id(rank), addr),
            None => return Err(out_of_range(role, rank, spec.num_workers())),
        },
    };

    Ok(NodeInfo {
        id,
        role,
        addr: addr.clone(),
        rank,
    })
}

fn out_of_range(role: NodeRole, rank: usize, declared: usize) -> PsError {
    PsError::Config(format!("{role} rank {rank} out of range, {declared} declared"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ClusterSpec {
        ClusterSpec::from_json(
            r#"{
                "scheduler": "10.0.0.1:7000",
                "servers": ["10.0.0.2:7000", "10.0.0.3:7000"],
                "workers": ["10.0.0.4:7000"],
                "key_space": 8
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn resolves_every_declared_node() {
        let spec = spec();

        let scheduler = resolve(&spec, NodeRole::Scheduler, 0).unwrap();
        assert_eq!((scheduler.id, scheduler.addr.as_str()), (0, "10.0.0.1:7000"));
        assert!(scheduler.is_scheduler());

        let server = resolve(&spec, NodeRole::Server, 1).unwrap();
        assert_eq!((server.id, server.addr.as_str()), (2, "10.0.0.3:7000"));
        assert!(server.is_server() && !server.is_worker());

        let worker = resolve(&spec, NodeRole::Worker, 0).unwrap();
        assert_eq!(worker.id, 3);
        assert!(worker.is_worker());
    }

    #[test]
    fn rejects_undeclared_ranks() {
        let spec = spec();

        for (role, rank) in [
            (NodeRole::Scheduler, 1),
            (NodeRole::Server, 2),
            (NodeRole::Worker, 1),
        ] {
            assert!(
                matches!(resolve(&spec, role, rank), Err(PsError::Config(_))),
                "{role} {rank}"
            );
        }
    }

    #[test]
    fn rejects_specs_without_workers() {
        let mut spec = spec();
        spec.workers.clear();

        assert!(matches!(
            resolve(&spec, NodeRole::Server, 0),
            Err(PsError::Config(_))
        ));
    }
}
