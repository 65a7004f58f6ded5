use comms::{
    PsError, Result,
    specs::cluster::{ClusterSpec, CombineSpec, ConsistencySpec},
    transport::Outbox,
};

use super::{ParameterServer, Server};
use crate::{
    storage::{Add, Combiner, ParameterShard, Replace, StoreHandle},
    synchronization::{BoundedDelaySync, ClockTable, EventualSync, SequentialSync, Synchronizer},
};

/// Builds `Server`s given a cluster specification.
#[derive(Debug, Default)]
pub struct ServerBuilder;

impl ServerBuilder {
    /// Creates a new `ServerBuilder`.
    pub fn new() -> Self {
        Self
    }

    /// Builds the server of the given rank.
    ///
    /// # Arguments
    /// * `spec` - The specification of the cluster.
    /// * `rank` - The rank of the server to build.
    /// * `outbox` - The sending half of the server's transport.
    ///
    /// # Returns
    /// A new `Server` or a `PsError::Config` if `rank` isn't declared.
    pub fn build(
        &self,
        spec: &ClusterSpec,
        rank: usize,
        outbox: Outbox,
    ) -> Result<Box<dyn Server>> {
        if rank >= spec.num_servers() {
            return Err(PsError::Config(format!(
                "server rank {rank} out of range, {} servers declared",
                spec.num_servers()
            )));
        }

        Ok(self.resolve_combiner(spec, rank, outbox))
    }

    /// Resolves the `Combiner` for this server.
    ///
    /// # Arguments
    /// * `spec` - The specification of the cluster.
    /// * `rank` - The rank of the server.
    /// * `outbox` - The sending half of the server's transport.
    ///
    /// # Returns
    /// A new server.
    fn resolve_combiner(&self, spec: &ClusterSpec, rank: usize, outbox: Outbox) -> Box<dyn Server> {
        match spec.combine {
            CombineSpec::Add => self.resolve_synchronizer(spec, rank, outbox, Add),
            CombineSpec::Replace => self.resolve_synchronizer(spec, rank, outbox, Replace),
        }
    }

    /// Resolves the `Synchronizer` for this server.
    ///
    /// # Arguments
    /// * `spec` - The specification of the cluster.
    /// * `rank` - The rank of the server.
    /// * `outbox` - The sending half of the server's transport.
    /// * `combiner` - A resolved combiner.
    ///
    /// # Returns
    /// A new server.
    fn resolve_synchronizer<C>(
        &self,
        spec: &ClusterSpec,
        rank: usize,
        outbox: Outbox,
        combiner: C,
    ) -> Box<dyn Server>
    where
        C: Combiner + 'static,
    {
        match spec.consistency {
            ConsistencySpec::Eventual => {
                self.terminate_build(spec, rank, outbox, combiner, EventualSync::new())
            }
            ConsistencySpec::BoundedDelay { staleness } => {
                let synchronizer = BoundedDelaySync::new(staleness);
                self.terminate_build(spec, rank, outbox, combiner, synchronizer)
            }
            ConsistencySpec::Sequential => {
                self.terminate_build(spec, rank, outbox, combiner, SequentialSync::new())
            }
        }
    }

    /// Terminates the build and finally instantiates all the entities.
    ///
    /// # Arguments
    /// * `spec` - The specification of the cluster.
    /// * `rank` - The rank of the server.
    /// * `outbox` - The sending half of the server's transport.
    /// * `combiner` - A resolved combiner.
    /// * `synchronizer` - A resolved synchronizer.
    ///
    /// # Returns
    /// A new server.
    fn terminate_build<C, S>(
        &self,
        spec: &ClusterSpec,
        rank: usize,
        outbox: Outbox,
        combiner: C,
        synchronizer: S,
    ) -> Box<dyn Server>
    where
        C: Combiner + 'static,
        S: Synchronizer + 'static,
    {
        let shard = ParameterShard::new(rank, spec.partitioner(), spec.value_len.get(), combiner);
        let clocks = ClockTable::new(&spec.worker_ids());
        let handle = StoreHandle::new(shard, clocks, synchronizer);

        Box::new(ParameterServer::new(handle, outbox))
    }
}
