use bytes::BufMut;

/// Encodes a message payload for the framing layer.
pub trait Serialize {
    /// The kind byte written in the frame envelope.
    fn kind(&self) -> u8;

    /// Writes the payload, without any envelope, into `buf`.
    fn serialize<B: BufMut>(&self, buf: &mut B);
}
