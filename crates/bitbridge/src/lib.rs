//! bitbridge: call into a library hosted by an architecture-matched worker
//! process over a loopback wire protocol.

pub mod adapter;
pub mod config;
mod error;
pub mod lifecycle;
pub mod logging;
pub mod protocol;
mod session;
pub mod transport;
pub mod worker;

pub use adapter::{Args, Catalog, HostedLibrary, LoadError, NativeError, Signature};
pub use config::{PortSelection, SessionConfig};
pub use error::BridgeError;
pub use lifecycle::{
    LifecycleManager, ProcessSpawner, ShutdownOutcome, WorkerHandle, WorkerLaunch, WorkerSpawner,
    WorkerState,
};
pub use protocol::{FromValue, Matrix, NumericArray, ProtocolError, Request, Response, TypeTag, Value};
pub use session::Session;
pub use worker::{StartupReport, Worker, WorkerConfig, WorkerError, WorkerExit, run_worker};
