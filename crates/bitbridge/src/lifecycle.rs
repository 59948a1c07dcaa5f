//! Lifecycle manager - starts, probes and stops worker processes.
//!
//! Flow:
//! 1. Resolve library path, worker program and port
//! 2. Spawn the worker with `--library`, `--host`, `--port`, `--watch-parent`
//! 3. Read the startup report from the worker's stdout
//! 4. Poll `ping` until the endpoint answers (bounded by the startup timeout)
//! 5. On shutdown: send `shutdown`, wait for exit, then SIGTERM, then SIGKILL

use std::ffi::OsString;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::{Instant, timeout, timeout_at};

use crate::config::SessionConfig;
use crate::error::BridgeError;
use crate::protocol::{Request, Response, Value};
use crate::transport::Connection;
use crate::worker::StartupReport;

/// Everything a spawner needs to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub program: PathBuf,
    /// Absolute path of the library to host.
    pub library: PathBuf,
    pub host: IpAddr,
    /// 0 lets the worker pick an ephemeral port.
    pub port: u16,
    /// Frame limit the worker decodes with; matches the controller's.
    pub max_frame_length: usize,
}

impl WorkerLaunch {
    pub fn args(&self) -> Vec<OsString> {
        vec![
            "--library".into(),
            self.library.clone().into_os_string(),
            "--host".into(),
            self.host.to_string().into(),
            "--port".into(),
            self.port.to_string().into(),
            "--max-frame-length".into(),
            self.max_frame_length.to_string().into(),
            "--watch-parent".into(),
        ]
    }
}

/// Extension point for different worker launch strategies.
///
/// The returned child must have piped stdin and stdout.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &WorkerLaunch) -> io::Result<Child>;
}

/// Runs the worker program directly.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, launch: &WorkerLaunch) -> io::Result<Child> {
        Command::new(&launch.program)
            .args(launch.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    ShuttingDown,
    Terminated,
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Exited on its own within the shutdown grace period.
    Graceful(ExitStatus),
    /// Had to be signalled.
    Forced(ExitStatus),
    /// Was already terminated, or had exited on its own before shutdown was
    /// requested; see [`WorkerHandle::exit_status`]. Nothing was done.
    AlreadyTerminated,
}

/// A live (or formerly live) worker process.
///
/// Dropping a handle whose worker is still running kills the worker.
pub struct WorkerHandle {
    pid: u32,
    addr: SocketAddr,
    library: PathBuf,
    state: WorkerState,
    child: Child,
    // closing stdin tells a --watch-parent worker its controller is gone
    stdin: Option<ChildStdin>,
    _stdout: BufReader<ChildStdout>,
    exit_status: Option<ExitStatus>,
}

impl WorkerHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn library(&self) -> &Path {
        &self.library
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Non-blocking check for an exit that happened behind our back.
    pub fn try_exit_status(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.exit_status.is_none()
            && let Some(status) = self.child.try_wait()?
        {
            tracing::warn!(pid = self.pid, %status, "Worker exited unexpectedly");
            self.terminated(status);
        }
        Ok(self.exit_status)
    }

    fn terminated(&mut self, status: ExitStatus) {
        self.state = WorkerState::Terminated;
        self.exit_status = Some(status);
        self.stdin = None;
    }

    /// Wrap an already running child as a ready worker at `addr`.
    #[cfg(test)]
    pub(crate) fn attached(mut child: Child, addr: SocketAddr) -> Self {
        let stdout = child.stdout.take().expect("child stdout must be piped");
        Self {
            pid: child.id().unwrap_or_default(),
            addr,
            library: PathBuf::from("/opt/lib/example.so"),
            state: WorkerState::Ready,
            stdin: child.stdin.take(),
            _stdout: BufReader::new(stdout),
            child,
            exit_status: None,
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.state != WorkerState::Terminated {
            tracing::warn!(pid = self.pid, "Worker handle dropped without shutdown, killing worker");
            self.stdin = None;
            if let Err(e) = self.child.start_kill() {
                tracing::debug!(pid = self.pid, error = %e, "Failed to kill worker");
            }
        }
    }
}

/// Starts and stops worker processes for one session.
pub struct LifecycleManager {
    config: SessionConfig,
}

impl LifecycleManager {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Launch a worker and wait until it answers `ping`.
    ///
    /// Fails with [`BridgeError::StartupTimeout`] if the whole handshake takes
    /// longer than the startup timeout, or [`BridgeError::WorkerExited`] if
    /// the child dies first. The child is killed on either failure.
    pub async fn start(&self) -> Result<WorkerHandle, BridgeError> {
        let config = &self.config;
        let library = std::path::absolute(&config.library).map_err(BridgeError::Spawn)?;
        let program = config.resolve_worker_program().map_err(BridgeError::Spawn)?;
        let port = config.port.resolve(config.host).map_err(BridgeError::Spawn)?;
        let launch = WorkerLaunch {
            program,
            library,
            host: config.host,
            port,
            max_frame_length: config.max_frame_length,
        };

        tracing::info!(
            program = %launch.program.display(),
            library = %launch.library.display(),
            port,
            "Spawning worker"
        );
        let deadline = Instant::now() + config.startup_timeout;
        let mut child = config.spawner.spawn(&launch).map_err(BridgeError::Spawn)?;
        let pid = child.id().unwrap_or_default();

        let stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            abandon(&mut child).await;
            return Err(BridgeError::Spawn(io::Error::other(
                "worker stdout not captured",
            )));
        };
        let mut stdout = BufReader::new(stdout);

        match timeout_at(deadline, self.handshake(&mut child, &mut stdout)).await {
            Ok(Ok(report)) => {
                tracing::info!(pid, port = report.port, "Worker ready");
                Ok(WorkerHandle {
                    pid,
                    addr: SocketAddr::new(config.host, report.port),
                    library: launch.library,
                    state: WorkerState::Ready,
                    child,
                    stdin,
                    _stdout: stdout,
                    exit_status: None,
                })
            }
            Ok(Err(e)) => {
                tracing::error!(pid, error = %e, "Worker failed to start");
                abandon(&mut child).await;
                Err(e)
            }
            Err(_) => {
                tracing::error!(pid, timeout = ?config.startup_timeout, "Worker startup timed out");
                abandon(&mut child).await;
                Err(BridgeError::StartupTimeout(config.startup_timeout))
            }
        }
    }

    async fn handshake(
        &self,
        child: &mut Child,
        stdout: &mut BufReader<ChildStdout>,
    ) -> Result<StartupReport, BridgeError> {
        tracing::debug!("Waiting for startup report");
        let mut line = String::new();
        let read = tokio::select! {
            read = stdout.read_line(&mut line) => read.map_err(BridgeError::Transport)?,
            status = child.wait() => {
                let status = status.map_err(BridgeError::Transport)?;
                return Err(BridgeError::WorkerExited { status });
            }
        };
        if read == 0 {
            let status = child.wait().await.map_err(BridgeError::Transport)?;
            return Err(BridgeError::WorkerExited { status });
        }
        let report = StartupReport::parse(&line)?;
        tracing::debug!(port = report.port, pid = report.pid, "Startup report received");

        let addr = SocketAddr::new(self.config.host, report.port);
        let mut attempts = 0u32;
        loop {
            if let Some(status) = child.try_wait().map_err(BridgeError::Transport)? {
                return Err(BridgeError::WorkerExited { status });
            }
            attempts += 1;
            match probe(addr, self.config.max_frame_length).await {
                Ok(()) => {
                    tracing::debug!(attempts, "Worker answered ping");
                    return Ok(report);
                }
                Err(e) => tracing::trace!(attempts, error = %e, "Worker not reachable yet"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Stop the worker. Idempotent.
    ///
    /// `connection` is the session's open connection, if any; the worker only
    /// serves one connection at a time, so shutdown must go through it.
    pub async fn shutdown(
        &self,
        worker: &mut WorkerHandle,
        connection: Option<Connection>,
    ) -> Result<ShutdownOutcome, BridgeError> {
        if worker.state == WorkerState::Terminated {
            tracing::debug!(pid = worker.pid, "Worker already terminated");
            return Ok(ShutdownOutcome::AlreadyTerminated);
        }
        if let Some(status) = worker.try_exit_status().map_err(BridgeError::Transport)? {
            tracing::debug!(pid = worker.pid, %status, "Worker exited before shutdown");
            return Ok(ShutdownOutcome::AlreadyTerminated);
        }

        worker.state = WorkerState::ShuttingDown;
        tracing::info!(pid = worker.pid, port = worker.port(), "Shutting down worker");
        let grace = self.config.shutdown_grace;
        let deadline = Instant::now() + grace;

        match timeout_at(deadline, self.request_shutdown(worker.addr, connection)).await {
            Ok(Ok(())) => tracing::debug!(pid = worker.pid, "Shutdown acknowledged"),
            Ok(Err(e)) => tracing::warn!(pid = worker.pid, error = %e, "Shutdown request failed"),
            Err(_) => tracing::warn!(pid = worker.pid, "Shutdown acknowledgement timed out"),
        }
        worker.stdin = None;

        match timeout_at(deadline, worker.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid = worker.pid, %status, "Worker exited");
                worker.terminated(status);
                return Ok(ShutdownOutcome::Graceful(status));
            }
            Ok(Err(e)) => tracing::warn!(pid = worker.pid, error = %e, "Failed to wait for worker"),
            Err(_) => tracing::warn!(pid = worker.pid, ?grace, "Worker did not exit in time"),
        }

        self.force_terminate(worker).await
    }

    async fn request_shutdown(
        &self,
        addr: SocketAddr,
        connection: Option<Connection>,
    ) -> Result<(), BridgeError> {
        let mut connection = match connection {
            Some(connection) => connection,
            None => Connection::open(addr, self.config.max_frame_length).await?,
        };
        match connection.round_trip(Request::shutdown()).await? {
            Response::Success(_) => Ok(()),
            Response::Failure(failure) => Err(failure.into()),
        }
    }

    async fn force_terminate(&self, worker: &mut WorkerHandle) -> Result<ShutdownOutcome, BridgeError> {
        if let Some(status) = self.terminate(worker).await {
            worker.terminated(status);
            return Ok(ShutdownOutcome::Forced(status));
        }

        tracing::warn!(pid = worker.pid, "Killing worker");
        if let Err(e) = worker.child.start_kill() {
            tracing::debug!(pid = worker.pid, error = %e, "Kill failed, worker may have exited");
        }
        let status = worker.child.wait().await.map_err(BridgeError::Transport)?;
        worker.terminated(status);
        Ok(ShutdownOutcome::Forced(status))
    }

    /// SIGTERM, then wait up to the terminate grace.
    #[cfg(unix)]
    async fn terminate(&self, worker: &mut WorkerHandle) -> Option<ExitStatus> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = i32::try_from(worker.child.id()?).ok()?;
        tracing::warn!(pid, "Sending SIGTERM to worker");
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            tracing::debug!(pid, error = %e, "SIGTERM failed");
            return None;
        }
        match timeout(self.config.terminate_grace, worker.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => None,
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&self, _worker: &mut WorkerHandle) -> Option<ExitStatus> {
        None
    }
}

async fn probe(addr: SocketAddr, max_frame_length: usize) -> Result<(), BridgeError> {
    let mut connection = Connection::open(addr, max_frame_length).await?;
    match connection.round_trip(Request::ping()).await? {
        Response::Success(Value::Bool(true)) => Ok(()),
        Response::Success(other) => Err(BridgeError::Protocol(format!(
            "unexpected ping reply of type {}",
            other.tag()
        ))),
        Response::Failure(failure) => Err(failure.into()),
    }
}

async fn abandon(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Failed to kill abandoned worker");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    /// Launches `sh -c <script>` instead of the worker program.
    struct ShellSpawner(String);

    impl WorkerSpawner for ShellSpawner {
        fn spawn(&self, _launch: &WorkerLaunch) -> io::Result<Child> {
            Command::new("sh")
                .args(["-c", self.0.as_str()])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
        }
    }

    fn manager(script: impl Into<String>, startup_timeout: Duration) -> LifecycleManager {
        LifecycleManager::new(
            SessionConfig::new("/opt/lib/example.so")
                .with_worker_program("/bin/false")
                .with_startup_timeout(startup_timeout)
                .with_spawner(Arc::new(ShellSpawner(script.into()))),
        )
    }

    #[test]
    fn launch_arguments() {
        let launch = WorkerLaunch {
            program: PathBuf::from("/usr/bin/bitbridge-worker"),
            library: PathBuf::from("/opt/lib/example.so"),
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            max_frame_length: 4096,
        };
        let args: Vec<String> = launch
            .args()
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(
            args,
            [
                "--library",
                "/opt/lib/example.so",
                "--host",
                "127.0.0.1",
                "--port",
                "0",
                "--max-frame-length",
                "4096",
                "--watch-parent"
            ]
        );
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let started = Instant::now();
        let err = manager("sleep 30", Duration::from_millis(300))
            .start()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::StartupTimeout(t) if t == Duration::from_millis(300)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn worker_exiting_early_is_reported_with_its_status() {
        let err = manager("exit 3", Duration::from_secs(10))
            .start()
            .await
            .err()
            .unwrap();
        match err {
            BridgeError::WorkerExited { status } => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_startup_report_is_a_protocol_error() {
        let err = manager("echo hello; sleep 30", Duration::from_secs(10))
            .start()
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "ProtocolError");
    }

    #[tokio::test]
    async fn unreachable_reported_port_times_out() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let script = format!(r#"echo '{{"port":{port},"pid":1,"library":"/x"}}'; sleep 30"#);
        let err = manager(script, Duration::from_millis(400))
            .start()
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "StartupTimeoutError");
    }

    fn shell(script: &str) -> Child {
        Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    /// An address nothing listens on, so `shutdown` requests are refused.
    fn dead_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn quick_stop() -> LifecycleManager {
        LifecycleManager::new(
            SessionConfig::new("/opt/lib/example.so")
                .with_shutdown_grace(Duration::from_millis(300))
                .with_terminate_grace(Duration::from_millis(300)),
        )
    }

    fn assert_reaped(pid: u32) {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        assert_eq!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH));
    }

    #[tokio::test]
    async fn unresponsive_worker_is_terminated() {
        use std::os::unix::process::ExitStatusExt;

        let mut worker =
            WorkerHandle::attached(shell("while :; do sleep 0.1; done"), dead_addr());
        let pid = worker.pid();

        let outcome = quick_stop().shutdown(&mut worker, None).await.unwrap();
        match outcome {
            ShutdownOutcome::Forced(status) => assert_eq!(status.signal(), Some(15)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(worker.state(), WorkerState::Terminated);
        assert_reaped(pid);
    }

    #[tokio::test]
    async fn worker_ignoring_sigterm_is_killed() {
        use std::os::unix::process::ExitStatusExt;

        let mut worker = WorkerHandle::attached(
            shell("trap '' TERM; while :; do sleep 0.1; done"),
            dead_addr(),
        );
        let pid = worker.pid();
        // let the shell install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let outcome = quick_stop().shutdown(&mut worker, None).await.unwrap();
        match outcome {
            ShutdownOutcome::Forced(status) => assert_eq!(status.signal(), Some(9)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_reaped(pid);

        assert_eq!(
            quick_stop().shutdown(&mut worker, None).await.unwrap(),
            ShutdownOutcome::AlreadyTerminated
        );
    }

    #[tokio::test]
    async fn worker_that_already_exited_is_not_reported_as_graceful() {
        let mut worker = WorkerHandle::attached(shell("exit 7"), dead_addr());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let outcome = quick_stop().shutdown(&mut worker, None).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::AlreadyTerminated);
        assert_eq!(worker.exit_status().and_then(|s| s.code()), Some(7));
        assert_eq!(worker.state(), WorkerState::Terminated);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let manager = LifecycleManager::new(
            SessionConfig::new("/opt/lib/example.so")
                .with_worker_program("/nonexistent/bitbridge-worker"),
        );
        let err = manager.start().await.err().unwrap();
        assert_eq!(err.kind(), "SpawnError");
    }
}
