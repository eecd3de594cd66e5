//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or message assembly.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: {len} bytes, need at least 2")]
    FrameTooShort { len: usize },

    #[error("unsupported opcode: {0:#x}")]
    UnsupportedOpcode(u8),

    #[error("reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    #[error("reserved bits set: {0:#05b}")]
    ReservedBits(u8),

    #[error("frame too short for extended payload length: need {needed} bytes, have {available}")]
    TruncatedLength { needed: usize, available: usize },

    #[error("frame too short for mask key: need {needed} bytes, have {available}")]
    TruncatedMaskKey { needed: usize, available: usize },

    #[error("frame too short for payload: declared {expected} bytes, have {available}")]
    TruncatedPayload { expected: u64, available: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("invalid control frame: {0}")]
    InvalidControlFrame(&'static str),

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("new data frame while a fragmented message is in progress")]
    InterleavedMessage,

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl ProtocolError {
    /// Returns whether more input could turn this error into a valid frame.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooShort { .. }
                | ProtocolError::TruncatedLength { .. }
                | ProtocolError::TruncatedMaskKey { .. }
                | ProtocolError::TruncatedPayload { .. }
        )
    }
}
