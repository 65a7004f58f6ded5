pub mod blocking;
pub mod bootstrap;
pub mod identity;
mod lifecycle;
pub mod scheduler;

pub use blocking::BlockingNode;
pub use lifecycle::{LifecycleState, Node};
