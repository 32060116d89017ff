// Message module: the envelope and its wire representation

pub mod codec;
pub mod envelope;
pub mod frame;

pub use codec::{decode_envelope, encode_envelope, WIRE_VERSION};
pub use envelope::{Envelope, EnvelopeBuilder, MessageIdGenerator};
pub use frame::{
    encode_frame, read_frame, write_frame, write_frame_limited, FrameRead, FrameWriteError, DEFAULT_MAX_FRAME_LEN,
};

use thiserror::Error;

/// Wire format errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Buffer too short: need {need} bytes, got {got}")]
    BufferTooShort { need: usize, got: usize },

    #[error("Invalid wire version: {0}")]
    InvalidVersion(u8),

    #[error("Field {field} too long: {len} bytes")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("Field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Empty frame")]
    EmptyFrame,

    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
}
