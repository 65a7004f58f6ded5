//! The implementation of the sending end of the application layer protocol.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{ENVELOPE_SIZE, MAX_PAYLOAD, PREAMBLE, Serialize, node::NodeId};

/// The sending end handle of the communication.
pub struct OnoSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    source: NodeId,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    /// Creates a new `OnoSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    /// * `source` - The node id stamped on every sent frame.
    pub(super) fn new(tx: W, source: NodeId) -> Self {
        Self {
            tx,
            source,
            buf: Vec::new(),
        }
    }

    /// Sends `msg` through the inner sender.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Returns
    /// A result object that returns `io::Error` on failure.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> io::Result<()> {
        let Self { tx, source, buf } = self;

        buf.clear();
        buf.resize(ENVELOPE_SIZE, 0);
        msg.serialize(buf);

        let len = buf.len() - ENVELOPE_SIZE;
        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {len} bytes exceeds the {MAX_PAYLOAD} bytes limit"),
            ));
        }

        buf[0] = PREAMBLE;
        buf[1] = msg.kind();
        buf[2..6].copy_from_slice(&source.to_be_bytes());
        buf[6..ENVELOPE_SIZE].copy_from_slice(&(len as u32).to_be_bytes());

        tx.write_all(buf).await?;
        tx.flush().await
    }

    /// Shuts down the write half of the underlying writer.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}
