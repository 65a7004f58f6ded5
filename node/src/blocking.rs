use comms::{Key, Result, msg::RequestId, node::NodeRole, specs::cluster::ClusterSpec};
use tokio::runtime::Runtime;

use crate::lifecycle::{LifecycleState, Node};

/// A `Node` driven from synchronous code.
///
/// Each call blocks the current thread on a runtime owned by this value, so
/// it must not be used from within an async context.
pub struct BlockingNode {
    runtime: Runtime,
    node: Node,
}

impl BlockingNode {
    /// Creates a new `BlockingNode` along with its runtime.
    pub fn new(spec: ClusterSpec, role: NodeRole, rank: usize) -> Result<Self> {
        let runtime = Runtime::new()?;
        let node = Node::new(spec, role, rank)?;
        Ok(Self { runtime, node })
    }

    /// Creates a new `BlockingNode` from the environment, see `Node::from_env`.
    pub fn from_env() -> Result<Self> {
        let runtime = Runtime::new()?;
        let node = Node::from_env()?;
        Ok(Self { runtime, node })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn state(&self) -> LifecycleState {
        self.node.state()
    }

    pub fn init(&mut self) -> Result<()> {
        self.runtime.block_on(self.node.init())
    }

    pub fn serve(&mut self) -> Result<()> {
        self.runtime.block_on(self.node.serve())
    }

    pub fn coordinate(&mut self) -> Result<()> {
        self.runtime.block_on(self.node.coordinate())
    }

    pub fn push(&mut self, keys: &[Key], deltas: &[Vec<f32>]) -> Result<RequestId> {
        self.runtime.block_on(self.node.push(keys, deltas))
    }

    pub fn pull(&mut self, keys: &[Key]) -> Result<Vec<Vec<f32>>> {
        self.runtime.block_on(self.node.pull(keys))
    }

    pub fn push_pull(&mut self, keys: &[Key], deltas: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        self.runtime.block_on(self.node.push_pull(keys, deltas))
    }

    pub fn wait(&mut self, request_id: RequestId) -> Result<()> {
        self.runtime.block_on(self.node.wait(request_id))
    }

    pub fn barrier(&mut self) -> Result<()> {
        self.runtime.block_on(self.node.barrier())
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.runtime.block_on(self.node.finalize())
    }
}

#[cfg(test)]
mod tests {
    use comms::PsError;

    use super::*;

    fn spec() -> ClusterSpec {
        ClusterSpec::from_json(
            r#"{
                "scheduler": "127.0.0.1:1",
                "servers": ["127.0.0.1:2"],
                "workers": ["127.0.0.1:0"],
                "key_space": 8
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn operations_before_init_are_rejected() {
        let mut node = BlockingNode::new(spec(), NodeRole::Worker, 0).unwrap();

        assert_eq!(node.state(), LifecycleState::Uninitialized);
        assert!(matches!(node.pull(&[1]), Err(PsError::Lifecycle(_))));
        assert!(matches!(node.barrier(), Err(PsError::Lifecycle(_))));
    }

    #[test]
    fn finalize_without_init_terminates() {
        let mut node = BlockingNode::new(spec(), NodeRole::Server, 0).unwrap();

        node.finalize().unwrap();
        assert_eq!(node.state(), LifecycleState::Terminated);

        node.finalize().unwrap();
        assert!(matches!(node.init(), Err(PsError::Lifecycle(_))));
    }
}
