mod deserialize;
mod error;
pub mod msg;
pub mod node;
pub mod partition;
mod receiver;
mod sender;
mod serialize;
mod sink;
mod source;
pub mod specs;
pub mod transport;

use tokio::io::{AsyncRead, AsyncWrite};

pub use deserialize::Deserialize;
pub use error::{PsError, Result};
pub use receiver::OnoReceiver;
pub use sender::OnoSender;
pub use serialize::Serialize;

use node::NodeId;

/// A parameter key, globally meaningful across the cluster.
pub type Key = u64;

/// Magic `0xB` in the high nibble, protocol version `1` in the low one.
const PREAMBLE: u8 = 0xB1;

/// Preamble, kind, source id and payload length.
const ENVELOPE_SIZE: usize = 1 + 1 + size_of::<NodeId>() + size_of::<u32>();

/// The largest payload a frame may carry.
pub const MAX_PAYLOAD: usize = 256 << 20;

/// Creates both `OnoReceiver` and `OnoSender` network channel parts.
///
/// Given a writer and reader creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
/// * `source` - The id of the local node, stamped on every outgoing frame.
///
/// # Returns
/// A communication stream in the form of an ono receiver and sender.
pub fn channel<R, W>(rx: R, tx: W, source: NodeId) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (OnoReceiver::new(rx), OnoSender::new(tx, source))
}
