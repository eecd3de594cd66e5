//! Streaming frame decoder and fragmented message assembly.

use crate::error::ProtocolError;
use crate::frame::{apply_mask, Frame, FrameHeader, OpCode, MAX_CONTROL_PAYLOAD};
use bytes::{Buf, Bytes, BytesMut};

/// Incremental frame decoder over a byte stream.
///
/// Bytes read from a socket are appended with [`Decoder::extend`]; complete
/// frames are pulled out with [`Decoder::decode_frame`]. Unlike
/// [`crate::decode_message`], short input is never an error here, it simply
/// yields `None` until more bytes arrive.
pub struct Decoder {
    buffer: BytesMut,
    max_frame_size: u64,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(crate::DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_size: max_frame_size as u64,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    ///
    /// Header checks (reserved bits, control frame rules, size limit) run as
    /// soon as the header is buffered, before the payload arrives.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let (header, header_len) = match FrameHeader::parse(&self.buffer) {
            Ok(parsed) => parsed,
            Err(e) if e.is_incomplete() => return Ok(None),
            Err(e) => return Err(e),
        };

        self.validate(&header)?;

        // validate() bounds payload_len by max_frame_size, which came from a usize
        let payload_len = header.payload_len as usize;
        if self.buffer.len() - header_len < payload_len {
            self.buffer.reserve(header_len + payload_len - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(header_len);
        let mut payload = self.buffer.split_to(payload_len);
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key, 0);
        }

        Ok(Some(Frame {
            header,
            payload: payload.freeze(),
        }))
    }

    fn validate(&self, header: &FrameHeader) -> Result<(), ProtocolError> {
        if header.rsv != 0 {
            return Err(ProtocolError::ReservedBits(header.rsv));
        }
        if header.opcode.is_control() {
            if !header.fin {
                return Err(ProtocolError::InvalidControlFrame("fragmented"));
            }
            if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(ProtocolError::InvalidControlFrame("payload exceeds 125 bytes"));
            }
        }
        if header.payload_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: header.payload_len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Joins fragmented data frames into whole messages.
///
/// A message starts with a Text or Binary frame and continues with
/// Continuation frames until one has FIN set. Control frames must be handled
/// by the caller and never reach the assembler.
pub struct MessageAssembler {
    max_message_size: usize,
    opcode: Option<OpCode>,
    buffer: BytesMut,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            opcode: None,
            buffer: BytesMut::new(),
        }
    }

    /// Feeds a data frame.
    ///
    /// Returns the opcode of the first fragment and the joined payload once
    /// the final fragment arrives.
    pub fn push(&mut self, frame: Frame) -> Result<Option<(OpCode, Bytes)>, ProtocolError> {
        let opcode = frame.opcode();
        match (opcode, self.opcode) {
            (OpCode::Continuation, None) => return Err(ProtocolError::UnexpectedContinuation),
            (OpCode::Text | OpCode::Binary, Some(_)) => {
                return Err(ProtocolError::InterleavedMessage)
            }
            (op, _) if op.is_control() => {
                return Err(ProtocolError::InvalidControlFrame("not a data frame"))
            }
            _ => {}
        }

        let size = self.buffer.len() + frame.payload.len();
        if size > self.max_message_size {
            self.reset();
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        if frame.is_final() {
            // single-frame messages skip the copy
            return Ok(Some(match self.opcode.take() {
                None => (opcode, frame.payload),
                Some(first) => {
                    self.buffer.extend_from_slice(&frame.payload);
                    (first, self.buffer.split().freeze())
                }
            }));
        }

        if self.opcode.is_none() {
            self.opcode = Some(opcode);
        }
        self.buffer.extend_from_slice(&frame.payload);
        Ok(None)
    }

    /// Returns whether a fragmented message is waiting for more frames.
    pub fn in_progress(&self) -> bool {
        self.opcode.is_some()
    }

    /// Drops any partially assembled message.
    pub fn reset(&mut self) {
        self.opcode = None;
        self.buffer.clear();
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_MESSAGE_SIZE)
    }
}
