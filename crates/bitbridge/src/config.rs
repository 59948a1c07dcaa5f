//! Session configuration.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::lifecycle::{ProcessSpawner, WorkerSpawner};
use crate::protocol::codec::DEFAULT_MAX_FRAME_LENGTH;

/// Environment variable naming the worker executable.
pub const WORKER_PROGRAM_ENV: &str = "BITBRIDGE_WORKER";
/// File name of the worker executable, without platform suffix.
pub const WORKER_PROGRAM_NAME: &str = "bitbridge-worker";

/// How the worker's listening port is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortSelection {
    /// The worker binds port 0 and reports what it got.
    #[default]
    Ephemeral,
    /// The controller reserves a free port and hands it to the worker.
    Reserve,
    Fixed(u16),
}

impl PortSelection {
    /// Port number to pass to the worker.
    pub fn resolve(self, host: IpAddr) -> io::Result<u16> {
        match self {
            Self::Ephemeral => Ok(0),
            Self::Reserve => reserve_port(host),
            Self::Fixed(port) => Ok(port),
        }
    }
}

/// Ask the OS for a free port on `host`. The port is released before the
/// worker binds it, so another process can still win the race.
pub fn reserve_port(host: IpAddr) -> io::Result<u16> {
    let listener = TcpListener::bind(SocketAddr::new(host, 0))?;
    Ok(listener.local_addr()?.port())
}

pub struct SessionConfig {
    pub library: PathBuf,
    /// Worker executable; see [`SessionConfig::resolve_worker_program`].
    pub worker_program: Option<PathBuf>,
    pub host: IpAddr,
    pub port: PortSelection,
    /// Bound on launch plus readiness probing.
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    /// Time allowed for a voluntary exit after `shutdown`.
    pub shutdown_grace: Duration,
    /// Time allowed after SIGTERM before the worker is killed.
    pub terminate_grace: Duration,
    pub max_frame_length: usize,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl SessionConfig {
    pub fn new(library: impl Into<PathBuf>) -> Self {
        Self {
            library: library.into(),
            worker_program: None,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: PortSelection::default(),
            startup_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(5),
            terminate_grace: Duration::from_secs(2),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            spawner: Arc::new(ProcessSpawner),
        }
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_port(mut self, port: PortSelection) -> Self {
        self.port = port;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Worker executable to launch.
    ///
    /// Explicit configuration wins, then `BITBRIDGE_WORKER`, then a
    /// `bitbridge-worker` binary next to the current executable (or one
    /// directory up, when running from cargo's `deps/`).
    pub fn resolve_worker_program(&self) -> io::Result<PathBuf> {
        if let Some(program) = &self.worker_program {
            return Ok(program.clone());
        }
        if let Some(program) = std::env::var_os(WORKER_PROGRAM_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(program));
        }
        let exe = std::env::current_exe()?;
        let dir = exe.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "current executable has no parent directory")
        })?;
        Ok(sibling_worker(dir))
    }
}

fn sibling_worker(dir: &Path) -> PathBuf {
    let file_name = format!("{WORKER_PROGRAM_NAME}{}", std::env::consts::EXE_SUFFIX);
    let candidate = dir.join(&file_name);
    if candidate.is_file() {
        return candidate;
    }
    match dir.parent() {
        Some(parent) if dir.ends_with("deps") => {
            let up = parent.join(&file_name);
            if up.is_file() { up } else { candidate }
        }
        _ => candidate,
    }
}
