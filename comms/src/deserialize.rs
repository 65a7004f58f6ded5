use std::io;

/// Decodes a message payload handed over by the framing layer.
pub trait Deserialize: Sized {
    /// # Arguments
    /// * `kind` - The kind byte read from the frame envelope.
    /// * `buf` - The payload bytes.
    fn deserialize(kind: u8, buf: &[u8]) -> io::Result<Self>;
}
