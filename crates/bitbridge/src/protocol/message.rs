//! Request and response messages.
//!
//! Layout (all lengths `u32` little-endian):
//!
//! ```text
//! request  = version operation:str argc:u32 (tag payload)* kwargc:u32 (name:str tag payload)*
//! response = version 0x00 tag payload
//!          | version 0x01 kind message:str has_detail:u8 [detail:str]
//! kind     = 0x00 protocol | 0x01 unknown-operation | 0x02 native-call native_kind:str
//! ```

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ProtocolError;
use super::value::{
    Value, get_len, get_string, get_tagged, need, put_bytes, put_len, put_tagged,
};

/// Bumped whenever the encoding changes incompatibly.
pub const WIRE_VERSION: u8 = 1;

/// Stops the worker after it acknowledges.
pub const SHUTDOWN: &str = "shutdown";
/// Liveness probe; acknowledges with `bool true`.
pub const PING: &str = "ping";
/// Absolute path of the hosted library, as text.
pub const LIBRARY_PATH: &str = "library_path";

/// Operation names the worker answers itself; adapters cannot shadow them.
pub const RESERVED_OPERATIONS: [&str; 3] = [SHUTDOWN, PING, LIBRARY_PATH];

const STATUS_SUCCESS: u8 = 0x00;
const STATUS_FAILURE: u8 = 0x01;

const KIND_PROTOCOL: u8 = 0x00;
const KIND_UNKNOWN_OPERATION: u8 = 0x01;
const KIND_NATIVE_CALL: u8 = 0x02;

/// One remote invocation. Built with the consuming builder methods, then
/// immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    operation: String,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
}

impl Request {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn shutdown() -> Self {
        Self::new(SHUTDOWN)
    }

    pub fn ping() -> Self {
        Self::new(PING)
    }

    pub fn library_path() -> Self {
        Self::new(LIBRARY_PATH)
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    /// Set a named argument, replacing an earlier one of the same name.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn positional(&self) -> &[Value] {
        &self.args
    }

    pub fn named(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED_OPERATIONS.contains(&self.operation.as_str())
    }
}

/// Category of a remote failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The worker could not decode the request.
    Protocol,
    /// The operation is not in the adapter's catalog.
    UnknownOperation,
    /// The hosted library failed; `kind` is the library's own error kind.
    NativeCall { kind: String },
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol => f.write_str("ProtocolError"),
            Self::UnknownOperation => f.write_str("UnknownOperationError"),
            Self::NativeCall { kind } => write!(f, "NativeCallError({kind})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Remote diagnostic, such as the signature of the failing operation.
    pub detail: Option<String>,
}

impl Failure {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Protocol,
            message: message.into(),
            detail: None,
        }
    }

    pub fn unknown_operation(operation: &str) -> Self {
        Self {
            kind: FailureKind::UnknownOperation,
            message: format!("unknown operation `{operation}`"),
            detail: None,
        }
    }

    pub fn native_call(
        kind: impl Into<String>,
        message: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            kind: FailureKind::NativeCall { kind: kind.into() },
            message: message.into(),
            detail,
        }
    }
}

/// Exactly one per request.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(Value),
    Failure(Failure),
}

impl Response {
    /// Acknowledgement for reserved operations.
    pub fn ack() -> Self {
        Self::Success(Value::Bool(true))
    }
}

pub fn encode_request(request: &Request) -> Result<Bytes, ProtocolError> {
    let mut dst = BytesMut::new();
    dst.put_u8(WIRE_VERSION);
    put_bytes(&mut dst, request.operation.as_bytes())?;
    put_len(&mut dst, request.args.len())?;
    for value in &request.args {
        put_tagged(&mut dst, value)?;
    }
    put_len(&mut dst, request.kwargs.len())?;
    for (name, value) in &request.kwargs {
        put_bytes(&mut dst, name.as_bytes())?;
        put_tagged(&mut dst, value)?;
    }
    Ok(dst.freeze())
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let mut src = bytes;
    check_version(&mut src)?;
    let operation = get_string(&mut src, "operation name")?;

    let argc = get_len(&mut src)?;
    // every argument takes at least one byte, so a bogus count cannot over-allocate
    let mut args = Vec::with_capacity(argc.min(src.remaining()));
    for _ in 0..argc {
        args.push(get_tagged(&mut src)?);
    }

    let kwargc = get_len(&mut src)?;
    let mut kwargs = BTreeMap::new();
    for _ in 0..kwargc {
        let name = get_string(&mut src, "argument name")?;
        let value = get_tagged(&mut src)?;
        if kwargs.contains_key(&name) {
            return Err(ProtocolError::DuplicateNamedArgument(name));
        }
        kwargs.insert(name, value);
    }

    finish(src)?;
    Ok(Request {
        operation,
        args,
        kwargs,
    })
}

pub fn encode_response(response: &Response) -> Result<Bytes, ProtocolError> {
    let mut dst = BytesMut::new();
    dst.put_u8(WIRE_VERSION);
    match response {
        Response::Success(value) => {
            dst.put_u8(STATUS_SUCCESS);
            put_tagged(&mut dst, value)?;
        }
        Response::Failure(failure) => {
            dst.put_u8(STATUS_FAILURE);
            match &failure.kind {
                FailureKind::Protocol => dst.put_u8(KIND_PROTOCOL),
                FailureKind::UnknownOperation => dst.put_u8(KIND_UNKNOWN_OPERATION),
                FailureKind::NativeCall { kind } => {
                    dst.put_u8(KIND_NATIVE_CALL);
                    put_bytes(&mut dst, kind.as_bytes())?;
                }
            }
            put_bytes(&mut dst, failure.message.as_bytes())?;
            match &failure.detail {
                Some(detail) => {
                    dst.put_u8(1);
                    put_bytes(&mut dst, detail.as_bytes())?;
                }
                None => dst.put_u8(0),
            }
        }
    }
    Ok(dst.freeze())
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, ProtocolError> {
    let mut src = bytes;
    check_version(&mut src)?;
    need(&src, 1)?;
    let response = match src.get_u8() {
        STATUS_SUCCESS => Response::Success(get_tagged(&mut src)?),
        STATUS_FAILURE => {
            need(&src, 1)?;
            let kind = match src.get_u8() {
                KIND_PROTOCOL => FailureKind::Protocol,
                KIND_UNKNOWN_OPERATION => FailureKind::UnknownOperation,
                KIND_NATIVE_CALL => FailureKind::NativeCall {
                    kind: get_string(&mut src, "error kind")?,
                },
                other => return Err(ProtocolError::InvalidFailureKind(other)),
            };
            let message = get_string(&mut src, "error message")?;
            need(&src, 1)?;
            let detail = match src.get_u8() {
                0 => None,
                1 => Some(get_string(&mut src, "error detail")?),
                other => return Err(ProtocolError::InvalidBool(other)),
            };
            Response::Failure(Failure {
                kind,
                message,
                detail,
            })
        }
        other => return Err(ProtocolError::InvalidStatus(other)),
    };
    finish(src)?;
    Ok(response)
}

fn check_version(src: &mut &[u8]) -> Result<(), ProtocolError> {
    need(src, 1)?;
    let found = src.get_u8();
    if found != WIRE_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: WIRE_VERSION,
            found,
        });
    }
    Ok(())
}

fn finish(src: &[u8]) -> Result<(), ProtocolError> {
    if src.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::TrailingBytes(src.len()))
    }
}
