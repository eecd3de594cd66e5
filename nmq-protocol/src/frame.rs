//! Binary frame format.
//!
//! Frame layout (2 byte base header, optional extended length and mask key):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! All multi-byte fields are big-endian. A length field of 126 or 127 is always
//! an escape marker, even for payloads that would fit in 7 bits.

use crate::error::ProtocolError;
use crate::message::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Size of the base header (byte 0 and byte 1).
pub const BASE_HEADER_SIZE: usize = 2;

/// Largest possible header: base + 64-bit length + mask key.
pub const MAX_HEADER_SIZE: usize = BASE_HEADER_SIZE + 8 + 4;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN7_BITS: u8 = 0x7F;
const LEN16_MARKER: u8 = 126;
const LEN64_MARKER: u8 = 127;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Parses an opcode nibble; reserved codes yield `None`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        self.as_u8() >= 0x8
    }

    /// Text and Binary; Continuation belongs to whichever data frame it extends.
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpCode::Continuation => "continuation",
            OpCode::Text => "text",
            OpCode::Binary => "binary",
            OpCode::Close => "close",
            OpCode::Ping => "ping",
            OpCode::Pong => "pong",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_u8(byte).ok_or(ProtocolError::ReservedOpcode(byte))
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// XORs `buf` with the repeating mask key.
///
/// `offset` is the position of `buf[0]` within the whole payload, so a payload
/// can be unmasked in pieces. Applying the same key twice restores the input.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4], offset: usize) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= key[(offset + i) & 3];
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Last fragment of a message.
    pub fin: bool,
    /// RSV1-3 as a 3-bit value; always zero on frames built here.
    pub rsv: u8,
    pub opcode: OpCode,
    /// Mask key, present when the MASK bit is set.
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Number of bytes this header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        let ext = match self.payload_len {
            n if n < LEN16_MARKER as u64 => 0,
            n if n <= u16::MAX as u64 => 2,
            _ => 8,
        };
        let mask = if self.mask.is_some() { 4 } else { 0 };
        BASE_HEADER_SIZE + ext + mask
    }

    /// Writes the header into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let fin = if self.fin { FIN_BIT } else { 0 };
        dst.put_u8(fin | ((self.rsv << 4) & RSV_BITS) | self.opcode.as_u8());

        let mask_bit = if self.mask.is_some() { MASK_BIT } else { 0 };
        if self.payload_len < LEN16_MARKER as u64 {
            dst.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= u16::MAX as u64 {
            dst.put_u8(mask_bit | LEN16_MARKER);
            dst.put_u16(self.payload_len as u16);
        } else {
            dst.put_u8(mask_bit | LEN64_MARKER);
            dst.put_u64(self.payload_len);
        }

        if let Some(key) = self.mask {
            dst.put_slice(&key);
        }
    }

    /// Parses a header from the front of `buf`.
    ///
    /// Returns the header and its encoded size. Short input fails with one of
    /// the truncation errors (see [`ProtocolError::is_incomplete`]).
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if buf.len() < BASE_HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort { len: buf.len() });
        }

        let b0 = buf[0];
        let b1 = buf[1];
        let opcode = OpCode::try_from(b0 & OPCODE_BITS)?;

        let mut pos = BASE_HEADER_SIZE;
        let payload_len = match b1 & LEN7_BITS {
            LEN16_MARKER => {
                let needed = pos + 2;
                if buf.len() < needed {
                    return Err(ProtocolError::TruncatedLength {
                        needed,
                        available: buf.len(),
                    });
                }
                let len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as u64;
                pos = needed;
                len
            }
            LEN64_MARKER => {
                let needed = pos + 8;
                if buf.len() < needed {
                    return Err(ProtocolError::TruncatedLength {
                        needed,
                        available: buf.len(),
                    });
                }
                let mut ext = [0u8; 8];
                ext.copy_from_slice(&buf[pos..needed]);
                pos = needed;
                u64::from_be_bytes(ext)
            }
            n => n as u64,
        };

        let mask = if b1 & MASK_BIT != 0 {
            let needed = pos + 4;
            if buf.len() < needed {
                return Err(ProtocolError::TruncatedMaskKey {
                    needed,
                    available: buf.len(),
                });
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[pos..needed]);
            pos = needed;
            Some(key)
        } else {
            None
        };

        Ok((
            Self {
                fin: b0 & FIN_BIT != 0,
                rsv: (b0 & RSV_BITS) >> 4,
                opcode,
                mask,
                payload_len,
            },
            pos,
        ))
    }
}

/// A complete frame.
///
/// # Invariants
///
/// - `payload` is always the unmasked application data.
/// - `payload.len() == header.payload_len`; constructors keep them in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Creates a final, unmasked frame.
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            header: FrameHeader {
                fin: true,
                rsv: 0,
                opcode,
                mask: None,
                payload_len: payload.len() as u64,
            },
            payload,
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(OpCode::Text, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data)
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data)
    }

    /// Zero-length close frame.
    pub fn close() -> Self {
        Self::new(OpCode::Close, Bytes::new())
    }

    /// Masks the payload on the wire with `key`.
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.header.mask = Some(key);
        self
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.header.fin = fin;
        self
    }

    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    pub fn is_final(&self) -> bool {
        self.header.fin
    }

    /// Encodes the frame into a new buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.header.encoded_len() + self.payload.len());
        self.encode_into(&mut buf);
        buf
    }

    /// Appends the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        self.header.encode(dst);
        let start = dst.len();
        dst.put_slice(&self.payload);
        if let Some(key) = self.header.mask {
            apply_mask(&mut dst[start..], key, 0);
        }
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` and consumes its bytes if a complete frame
    /// is buffered, `Ok(None)` if more data is needed, or `Err` on protocol
    /// errors. No size limit is applied; see [`crate::Decoder`].
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let (header, header_len) = match FrameHeader::parse(buf) {
            Ok(parsed) => parsed,
            Err(e) if e.is_incomplete() => return Ok(None),
            Err(e) => return Err(e),
        };

        let payload_len = payload_len_usize(header.payload_len)?;
        if buf.len() - header_len < payload_len {
            return Ok(None);
        }

        buf.advance(header_len);
        let mut payload = buf.split_to(payload_len);
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key, 0);
        }

        Ok(Some(Self {
            header,
            payload: payload.freeze(),
        }))
    }
}

fn payload_len_usize(len: u64) -> Result<usize, ProtocolError> {
    usize::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        size: len,
        max: usize::MAX as u64,
    })
}

/// Encodes a final, unmasked frame (server-originated).
pub fn encode(opcode: OpCode, payload: &[u8]) -> BytesMut {
    Frame::new(opcode, Bytes::copy_from_slice(payload)).encode()
}

/// Encodes a final frame with its payload masked by `key` (client-originated).
pub fn encode_masked(opcode: OpCode, payload: &[u8], key: [u8; 4]) -> BytesMut {
    Frame::new(opcode, Bytes::copy_from_slice(payload))
        .with_mask(key)
        .encode()
}

pub fn text_frame(text: &str) -> BytesMut {
    encode(OpCode::Text, text.as_bytes())
}

pub fn binary_frame(data: &[u8]) -> BytesMut {
    encode(OpCode::Binary, data)
}

pub fn close_frame() -> BytesMut {
    encode(OpCode::Close, &[])
}

pub fn ping_frame(data: &[u8]) -> BytesMut {
    encode(OpCode::Ping, data)
}

pub fn pong_frame(data: &[u8]) -> BytesMut {
    encode(OpCode::Pong, data)
}

/// Decodes a single Text or Binary frame into a [`Message`].
///
/// Every truncation is a hard error; there is no partial result. Control
/// frames are rejected here: they belong to the connection's control path.
/// The message id is left empty.
pub fn decode_message(frame: &[u8]) -> Result<Message, ProtocolError> {
    if frame.len() < BASE_HEADER_SIZE {
        return Err(ProtocolError::FrameTooShort { len: frame.len() });
    }

    let opcode = frame[0] & OPCODE_BITS;
    if opcode != OpCode::Text.as_u8() && opcode != OpCode::Binary.as_u8() {
        return Err(ProtocolError::UnsupportedOpcode(opcode));
    }

    let (header, header_len) = FrameHeader::parse(frame)?;
    let available = frame.len() - header_len;
    if (available as u64) < header.payload_len {
        return Err(ProtocolError::TruncatedPayload {
            expected: header.payload_len,
            available,
        });
    }

    let end = header_len + header.payload_len as usize;
    let mut data = BytesMut::from(&frame[header_len..end]);
    if let Some(key) = header.mask {
        apply_mask(&mut data, key, 0);
    }

    Ok(Message::new(data.freeze()))
}
