//! Wire protocol between the controller and the worker process.
//!
//! # Architecture
//!
//! - **value**: Type tags and the tagged value encoding (`encode`/`decode`)
//! - **message**: Request/Response shapes and their encodings
//! - **codec**: Length-delimited framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod message;
pub mod value;

pub use codec::{FrameError, WireCodec};
pub use message::{
    Failure, FailureKind, LIBRARY_PATH, PING, RESERVED_OPERATIONS, Request, Response, SHUTDOWN,
    WIRE_VERSION, decode_request, decode_response, encode_request, encode_response,
};
pub use value::{Element, FromValue, Matrix, NumericArray, ScalarKind, TypeTag, Value, decode, encode};

/// A message that cannot be encoded or decoded.
///
/// Always a programming or version-mismatch bug on one side of the bridge;
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported type tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("value of type {found} does not match declared tag {expected}")]
    TagMismatch { expected: TypeTag, found: TypeTag },

    #[error("expected {expected}, found {found}")]
    Expected {
        expected: &'static str,
        found: TypeTag,
    },

    #[error("truncated message: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("invalid boolean byte 0x{0:02x}")]
    InvalidBool(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("length {0} does not fit the 32-bit length field")]
    TooLong(usize),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("matrix row {row} has {found} columns, expected {expected}")]
    NonRectangular {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("matrix shape {rows}x{cols} does not match {len} elements")]
    ShapeMismatch { rows: usize, cols: usize, len: usize },

    #[error("unsupported wire version {found} (expected {expected})")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("invalid response status 0x{0:02x}")]
    InvalidStatus(u8),

    #[error("invalid failure kind 0x{0:02x}")]
    InvalidFailureKind(u8),

    #[error("named argument `{0}` given more than once")]
    DuplicateNamedArgument(String),

    #[error("invalid startup report: {0}")]
    InvalidStartupReport(String),
}
