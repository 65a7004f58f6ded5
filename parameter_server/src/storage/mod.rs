mod combine;
mod handle;
mod shard;

pub use combine::{Add, Combiner, Replace};
pub use handle::StoreHandle;
pub use shard::ParameterShard;
