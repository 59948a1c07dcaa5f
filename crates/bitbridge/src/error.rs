//! Caller-facing errors.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use crate::protocol::{Failure, FailureKind, FrameError, ProtocolError};

/// Every failure a session can report. None are retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A message could not be encoded or decoded, on either side.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    UnknownOperation(String),

    /// The hosted library reported a failure. `kind` is the library's own
    /// error kind.
    #[error("native call failed ({kind}): {message}")]
    NativeCall {
        kind: String,
        message: String,
        detail: Option<String>,
    },

    #[error("worker did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("worker exited unexpectedly ({status})")]
    WorkerExited { status: ExitStatus },

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("session is closed")]
    Closed,
}

impl BridgeError {
    /// Stable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "ProtocolError",
            Self::UnknownOperation(_) => "UnknownOperationError",
            Self::NativeCall { .. } => "NativeCallError",
            Self::StartupTimeout(_) => "StartupTimeoutError",
            Self::WorkerExited { .. } => "WorkerExitedError",
            Self::Spawn(_) => "SpawnError",
            Self::Transport(_) => "TransportError",
            Self::Closed => "ClosedError",
        }
    }

    pub(crate) fn transport(message: &str) -> Self {
        Self::Transport(io::Error::new(io::ErrorKind::UnexpectedEof, message.to_string()))
    }
}

impl From<ProtocolError> for BridgeError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<FrameError> for BridgeError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => Self::Transport(e),
            FrameError::Protocol(e) => e.into(),
        }
    }
}

impl From<Failure> for BridgeError {
    fn from(failure: Failure) -> Self {
        match failure.kind {
            FailureKind::Protocol => Self::Protocol(failure.message),
            FailureKind::UnknownOperation => Self::UnknownOperation(failure.message),
            FailureKind::NativeCall { kind } => Self::NativeCall {
                kind,
                message: failure.message,
                detail: failure.detail,
            },
        }
    }
}
