//! Application messages carried in data frames.

use crate::frame::{Frame, OpCode};
use bytes::{Bytes, BytesMut};

/// A decoded application message.
///
/// `id` is empty when produced by the codec; the server stamps a fresh
/// snowflake id before handing the message to its handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub data: Bytes,
}

impl Message {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            id: String::new(),
            data: data.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Encodes the payload as a single unmasked Binary frame.
    pub fn to_binary_frame(&self) -> BytesMut {
        Frame::new(OpCode::Binary, self.data.clone()).encode()
    }
}
