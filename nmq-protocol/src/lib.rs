//! # nmq-protocol
//!
//! Wire protocol for nmq connections.
//!
//! This crate provides:
//! - RFC 6455 style binary framing with 7/16/64-bit lengths and XOR masking
//! - A strict one-shot decoder for single data frames
//! - A streaming decoder and a fragment assembler for socket reads
//! - Control frame helpers (close, ping, pong)

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, MessageAssembler};
pub use error::ProtocolError;
pub use frame::{
    apply_mask, binary_frame, close_frame, decode_message, encode, encode_masked, ping_frame,
    pong_frame, text_frame, Frame, FrameHeader, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE,
};
pub use message::Message;

/// Default port for the nmq server.
pub const DEFAULT_PORT: u16 = 7450;

/// Largest frame payload accepted by [`Decoder`] by default (4 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Largest assembled message accepted by default (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
