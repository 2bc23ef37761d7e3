/// Wire protocol: frame codec and handshake documents
pub mod codec;
pub mod handshake;

pub use codec::{
    CodecError, Decoded, Message, OpCode, WireCodec, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN,
};
pub use handshake::{HelloCommand, HelloReply};
