use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Deserialize, ENVELOPE_SIZE, MAX_PAYLOAD, PREAMBLE, node::NodeId};

/// The receiving end handle of the communication.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    /// Creates a new `OnoReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self { rx, buf: Vec::new() }
    }

    /// Waits to receive a new message from the inner receiver.
    ///
    /// # Returns
    /// The node id of the sender and the decoded message, or an `io::Error`
    /// if the reader failed or the frame was malformed.
    pub async fn recv<T: Deserialize>(&mut self) -> io::Result<(NodeId, T)> {
        let (kind, source, payload) = self.recv_frame().await?;
        let msg = T::deserialize(kind, payload)?;
        Ok((source, msg))
    }

    /// Waits for the next whole frame without decoding its payload.
    ///
    /// An error here means the stream can no longer be trusted, whereas a
    /// payload that fails to decode leaves the stream aligned.
    ///
    /// # Returns
    /// The message kind, the node id of the sender and the raw payload.
    pub async fn recv_frame(&mut self) -> io::Result<(u8, NodeId, &[u8])> {
        let mut header = [0; ENVELOPE_SIZE];
        self.rx.read_exact(&mut header).await?;

        if header[0] != PREAMBLE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "invalid frame preamble {:#04x}, expected {PREAMBLE:#04x}",
                    header[0]
                ),
            ));
        }

        let kind = header[1];
        let [_, _, a, b, c, d, e, f, g, h] = header;
        let source = NodeId::from_be_bytes([a, b, c, d]);
        let len = u32::from_be_bytes([e, f, g, h]) as usize;

        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("announced payload of {len} bytes exceeds the {MAX_PAYLOAD} bytes limit"),
            ));
        }

        self.buf.resize(len, 0);
        self.rx.read_exact(&mut self.buf).await?;

        Ok((kind, source, &self.buf))
    }
}
