use std::io::Cursor;

use bytes::{Bytes, BytesMut};

use crate::net::mux::FrameError;

/// Trait for writing static frames to the network.
pub trait Serialize<T> {
    /// Returns the bytes representation of the frame.
    fn serialize(&self) -> Bytes;
}

/// Trait for reading static frames from the network.
pub trait Deserialize<T> {
    /// Returns a parsed frame, `None` if it was incomplete, or an error if the
    /// buffered bytes can never form a valid frame.
    fn deserialize(src: &mut Cursor<&BytesMut>) -> Result<Option<T>, FrameError>;
}
