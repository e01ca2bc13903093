use std::io;

pub trait Serialize<'a> {
    /// Writes `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer to write the copied part of the message into.
    ///
    /// # Returns
    /// An optional trailing slice that should be sent right after `buf` without copying it.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
