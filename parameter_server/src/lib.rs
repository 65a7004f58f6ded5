pub mod service;
pub mod storage;
pub mod synchronization;

pub use service::{ParameterServer, Server, ServerBuilder};
