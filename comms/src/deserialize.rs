use std::io;

/// A message that can be decoded from a whole frame, borrowing from it.
pub trait Deserialize<'a>: Sized {
    /// # Returns
    /// The decoded message or an `InvalidData` error.
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
