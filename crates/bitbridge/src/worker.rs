//! Worker process side of the bridge.
//!
//! The worker owns the single loaded [`HostedLibrary`] instance, listens on a
//! loopback TCP endpoint and serves requests strictly one at a time.
//!
//! Startup order:
//! 1. Load the library (exit code 3 on failure, before anything is bound)
//! 2. Bind the listener (exit code 4 on failure)
//! 3. Print the [`StartupReport`] as one JSON line on stdout
//! 4. Accept connections sequentially until `shutdown` or parent loss

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::adapter::{Catalog, HostedLibrary, InvokeError, LoadError};
use crate::protocol::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::protocol::{
    Failure, FrameError, LIBRARY_PATH, PING, ProtocolError, RESERVED_OPERATIONS, Request,
    Response, SHUTDOWN, Value, WireCodec,
};

/// Process exit codes of the worker executable.
pub mod exit_code {
    pub const GRACEFUL: i32 = 0;
    pub const UNEXPECTED: i32 = 1;
    pub const LOAD_FAILED: i32 = 3;
    pub const BIND_FAILED: i32 = 4;
}

/// How long a rejected peer may keep sending before the connection is cut.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// First line a worker writes to stdout once it is listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupReport {
    pub port: u16,
    pub pid: u32,
    pub library: PathBuf,
}

impl StartupReport {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim())
            .map_err(|e| ProtocolError::InvalidStartupReport(e.to_string()))
    }

    fn write_to(&self, mut out: impl Write) -> io::Result<()> {
        let line = self.to_line().map_err(io::Error::other)?;
        writeln!(out, "{line}")?;
        out.flush()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub library: PathBuf,
    pub host: IpAddr,
    /// 0 binds an ephemeral port.
    pub port: u16,
    /// Exit when stdin reaches EOF.
    pub watch_parent: bool,
    pub max_frame_length: usize,
}

impl WorkerConfig {
    pub fn new(library: impl Into<PathBuf>) -> Self {
        Self {
            library: library.into(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            watch_parent: false,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_watch_parent(mut self, watch_parent: bool) -> Self {
        self.watch_parent = watch_parent;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to write startup report: {0}")]
    Report(#[source] io::Error),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

impl WorkerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Load(_) => exit_code::LOAD_FAILED,
            Self::Bind { .. } => exit_code::BIND_FAILED,
            Self::Report(_) | Self::Accept(_) => exit_code::UNEXPECTED,
        }
    }
}

/// Why the serve loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// A `shutdown` request was acknowledged.
    Shutdown,
    /// Stdin closed while watching the parent.
    ParentGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Dispatcher owning the loaded library and its catalog.
pub struct Worker<L: HostedLibrary> {
    library: L,
    catalog: Catalog<L>,
}

impl<L: HostedLibrary> Worker<L> {
    pub fn new(library: L) -> Self {
        let catalog = L::catalog();
        for name in RESERVED_OPERATIONS {
            if catalog.contains(name) {
                tracing::warn!(operation = name, "Catalog entry shadows a reserved operation, ignoring it");
            }
        }
        tracing::debug!(operations = catalog.len(), "Catalog built");
        Self { library, catalog }
    }

    pub fn library(&self) -> &L {
        &self.library
    }

    pub fn catalog(&self) -> &Catalog<L> {
        &self.catalog
    }

    /// Produce the response for one request. Never fails: every error
    /// becomes a failure response.
    pub fn handle(&mut self, request: &Request) -> (Response, Flow) {
        let operation = request.operation();
        match operation {
            SHUTDOWN => (Response::ack(), Flow::Shutdown),
            PING => (Response::ack(), Flow::Continue),
            LIBRARY_PATH => {
                let path = self.library.path().to_string_lossy().into_owned();
                (Response::Success(Value::Text(path)), Flow::Continue)
            }
            _ => {
                let response = match self.catalog.invoke(&mut self.library, request) {
                    Ok(value) => {
                        tracing::trace!(operation, "Operation succeeded");
                        Response::Success(value)
                    }
                    Err(InvokeError::UnknownOperation(_)) => {
                        tracing::warn!(operation, "Unknown operation");
                        Response::Failure(Failure::unknown_operation(operation))
                    }
                    Err(InvokeError::Native { error, signature }) => {
                        tracing::warn!(operation, kind = %error.kind, message = %error.message, "Native call failed");
                        let detail = match &error.location {
                            Some(location) => format!("{operation}{signature} at {location}"),
                            None => format!("{operation}{signature}"),
                        };
                        Response::Failure(Failure::native_call(error.kind, error.message, Some(detail)))
                    }
                };
                (response, Flow::Continue)
            }
        }
    }

    /// Serve requests from one connection until it closes, sends an
    /// undecodable frame, or asks for shutdown.
    pub async fn serve_connection<R, W>(
        &mut self,
        reader: R,
        writer: W,
        max_frame_length: usize,
    ) -> Result<Flow, FrameError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader =
            FramedRead::new(reader, WireCodec::<Request>::with_max_frame_length(max_frame_length));
        let mut writer = FramedWrite::new(
            writer,
            WireCodec::<Response>::with_max_frame_length(max_frame_length),
        );

        while let Some(frame) = reader.next().await {
            let request = match frame {
                Ok(request) => request,
                Err(FrameError::Protocol(e)) => {
                    tracing::warn!(error = %e, "Undecodable request, closing connection");
                    writer
                        .send(Response::Failure(Failure::protocol(e.to_string())))
                        .await?;
                    drain(reader.into_inner()).await;
                    return Ok(Flow::Continue);
                }
                Err(e) => return Err(e),
            };

            tracing::debug!(operation = request.operation(), "Request received");
            let (response, flow) = self.handle(&request);
            match writer.send(response).await {
                Ok(()) => {}
                Err(FrameError::Protocol(e)) => {
                    tracing::warn!(error = %e, "Response could not be encoded");
                    writer
                        .send(Response::Failure(Failure::protocol(format!(
                            "response could not be encoded: {e}"
                        ))))
                        .await?;
                }
                Err(e) => return Err(e),
            }
            if flow == Flow::Shutdown {
                return Ok(Flow::Shutdown);
            }
        }
        tracing::debug!("Connection closed by peer");
        Ok(Flow::Continue)
    }
}

/// Load the library, bind, report, and serve until shutdown.
pub async fn run_worker<L: HostedLibrary>(config: WorkerConfig) -> Result<WorkerExit, WorkerError> {
    let library = L::load(&config.library)?;
    tracing::info!(library = %library.path().display(), "Library loaded");
    let mut worker = Worker::new(library);

    let addr = SocketAddr::new(config.host, config.port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| WorkerError::Bind { addr, source })?;
    let local = listener
        .local_addr()
        .map_err(|source| WorkerError::Bind { addr, source })?;

    let report = StartupReport {
        port: local.port(),
        pid: std::process::id(),
        library: worker.library().path().to_path_buf(),
    };
    report
        .write_to(io::stdout().lock())
        .map_err(WorkerError::Report)?;
    tracing::info!(port = report.port, pid = report.pid, "Worker listening");

    let parent_gone = CancellationToken::new();
    if config.watch_parent {
        tokio::spawn(watch_parent(parent_gone.clone()));
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = parent_gone.cancelled() => return Ok(parent_exit()),
            accepted = listener.accept() => accepted.map_err(WorkerError::Accept)?,
        };
        tracing::debug!(%peer, "Connection accepted");
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();

        let flow = tokio::select! {
            _ = parent_gone.cancelled() => return Ok(parent_exit()),
            served = worker.serve_connection(read_half, write_half, config.max_frame_length) => {
                served.unwrap_or_else(|e| {
                    tracing::warn!(%peer, error = %e, "Connection ended with error");
                    Flow::Continue
                })
            }
        };

        if flow == Flow::Shutdown {
            tracing::info!("Shutdown requested");
            return Ok(WorkerExit::Shutdown);
        }
    }
}

/// Discard input until the peer hangs up, so the failure just sent is not
/// lost to a reset caused by unread bytes.
async fn drain(mut reader: impl AsyncRead + Unpin) {
    match timeout(DRAIN_TIMEOUT, tokio::io::copy(&mut reader, &mut tokio::io::sink())).await {
        Ok(Ok(discarded)) => tracing::debug!(discarded, "Drained rejected connection"),
        Ok(Err(e)) => tracing::debug!(error = %e, "Rejected connection failed while draining"),
        Err(_) => tracing::debug!("Peer kept sending after rejection, closing"),
    }
}

fn parent_exit() -> WorkerExit {
    tracing::info!("Stdin closed (parent died?), exiting");
    WorkerExit::ParentGone
}

async fn watch_parent(parent_gone: CancellationToken) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 256];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "Stdin read failed");
                break;
            }
        }
    }
    parent_gone.cancel();
}
