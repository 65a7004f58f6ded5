mod bounded_delay;
mod clock;
mod eventual;
mod sequential;
mod synchronizer;

pub use bounded_delay::BoundedDelaySync;
pub use clock::{ClockState, ClockTable};
pub use eventual::EventualSync;
pub use sequential::SequentialSync;
pub use synchronizer::{Admission, Synchronizer};
