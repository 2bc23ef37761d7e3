/// Length-prefixed frame encoding and decoding
///
/// Frame layout, all integers little-endian:
///
/// ```text
/// [total_length: i32][request_id: i32][opcode: i32][payload ...]
/// ```
///
/// `total_length` counts the 12 header bytes. Payloads are opaque to the codec.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 12;

/// Default ceiling on a single frame, header included (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    /// Server reply to any request
    Reply = 1,
    /// Connection handshake (capability/version negotiation)
    Handshake = 2004,
    /// Database command
    Command = 2013,
}

impl OpCode {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(OpCode::Reply),
            2004 => Some(OpCode::Handshake),
            2013 => Some(OpCode::Command),
            _ => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpCode::Reply => write!(f, "REPLY"),
            OpCode::Handshake => write!(f, "HANDSHAKE"),
            OpCode::Command => write!(f, "COMMAND"),
        }
    }
}

/// One frame's worth of content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Request id; a reply echoes the id of the request it answers
    pub request_id: i32,
    pub op_code: OpCode,
    pub payload: Bytes,
}

impl Message {
    pub fn new(request_id: i32, op_code: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            op_code,
            payload: payload.into(),
        }
    }

    /// Total encoded length of this message, header included
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Outcome of a decode attempt
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame(Message),
    /// The buffer holds only part of a frame; read more bytes and try again
    NeedMoreData,
}

/// Framing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Frame of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Invalid frame length: {0}")]
    InvalidLength(i32),
    #[error("Unknown opcode: {0}")]
    UnknownOpCode(i32),
}

/// Stateless frame codec bounded by a maximum frame size
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    max_frame_size: usize,
}

impl WireCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a message into a standalone frame
    pub fn encode(&self, message: &Message) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(message.frame_len());
        self.encode_into(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the frame for `message` to `buf`
    pub fn encode_into(&self, message: &Message, buf: &mut BytesMut) -> Result<(), CodecError> {
        let size = message.frame_len();
        if size > self.max_frame_size || size > i32::MAX as usize {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        buf.reserve(size);
        buf.put_i32_le(size as i32);
        buf.put_i32_le(message.request_id);
        buf.put_i32_le(message.op_code as i32);
        buf.put_slice(&message.payload);
        Ok(())
    }

    /// Decode one frame from the front of `buf`
    ///
    /// On success the frame's bytes are consumed. With `NeedMoreData` the
    /// buffer is left untouched.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Decoded, CodecError> {
        if buf.len() < 4 {
            return Ok(Decoded::NeedMoreData);
        }

        let declared = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if declared < HEADER_LEN as i32 {
            return Err(CodecError::InvalidLength(declared));
        }

        let size = declared as usize;
        if size > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        if buf.len() < size {
            buf.reserve(size - buf.len());
            return Ok(Decoded::NeedMoreData);
        }

        let op_code_raw = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let op_code = OpCode::from_i32(op_code_raw).ok_or(CodecError::UnknownOpCode(op_code_raw))?;

        let mut frame = buf.split_to(size);
        frame.advance(4);
        let request_id = frame.get_i32_le();
        frame.advance(4);

        Ok(Decoded::Frame(Message {
            request_id,
            op_code,
            payload: frame.freeze(),
        }))
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
