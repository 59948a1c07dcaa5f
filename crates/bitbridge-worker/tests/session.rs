//! End-to-end sessions against the real worker executable.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bitbridge::{
    BridgeError, Matrix, PortSelection, ProcessSpawner, Request, Session, SessionConfig,
    ShutdownOutcome, Value, WorkerLaunch, WorkerSpawner, WorkerState,
};
use tempfile::NamedTempFile;
use tokio::process::Child;

const WORKER: &str = env!("CARGO_BIN_EXE_bitbridge-worker");

fn library() -> NamedTempFile {
    tempfile::Builder::new()
        .prefix("example")
        .suffix(".so")
        .tempfile()
        .unwrap()
}

fn config(library: &Path) -> SessionConfig {
    SessionConfig::new(library)
        .with_worker_program(WORKER)
        .with_startup_timeout(Duration::from_secs(20))
}

async fn start(library: &Path) -> Session {
    Session::start(config(library)).await.unwrap()
}

#[tokio::test]
async fn literal_examples() {
    let lib = library();
    let mut session = start(lib.path()).await;

    assert_eq!(
        session
            .call("sum_32bit", [Value::I32(123_456_788), Value::I32(1)])
            .await
            .unwrap(),
        Value::I32(123_456_789)
    );
    assert_eq!(
        session
            .call(
                "add_or_subtract",
                [Value::I32(1000), Value::I32(2000), Value::Bool(true)]
            )
            .await
            .unwrap(),
        Value::I32(3000)
    );
    assert_eq!(
        session
            .call(
                "add_or_subtract",
                [Value::I32(1000), Value::I32(2000), Value::Bool(false)]
            )
            .await
            .unwrap(),
        Value::I32(-1000)
    );
    assert_eq!(
        session
            .call_as::<String>("reverse_string", [Value::from("hello world!")])
            .await
            .unwrap(),
        "!dlrow olleh"
    );

    let err = session.call("unknown_op", []).await.unwrap_err();
    assert_eq!(err.kind(), "UnknownOperationError");

    assert!(matches!(
        session.shutdown().await.unwrap(),
        ShutdownOutcome::Graceful(status) if status.success()
    ));
}

#[tokio::test]
async fn native_failure_does_not_kill_the_worker() {
    let lib = library();
    let mut session = start(lib.path()).await;

    let err = session.call("factorial", [Value::I8(-1)]).await.unwrap_err();
    match err {
        BridgeError::NativeCall {
            kind,
            message,
            detail,
        } => {
            assert_eq!(kind, "InvalidArgument");
            assert!(message.contains("0..=127"), "{message}");
            assert_eq!(detail.as_deref(), Some("factorial(n: i8) -> f64"));
        }
        other => panic!("unexpected {other:?}"),
    }

    // wrong argument type is rejected before the call
    let err = session.call("factorial", [Value::I32(5)]).await.unwrap_err();
    assert_eq!(err.kind(), "NativeCallError");

    assert_eq!(
        session.call("factorial", [Value::I8(5)]).await.unwrap(),
        Value::F64(120.0)
    );
    assert!(session.is_open());
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn named_arguments_and_sequences() {
    let lib = library();
    let mut session = start(lib.path()).await;

    let value = session
        .invoke(
            Request::new("add_or_subtract")
                .arg(7i32)
                .kwarg("do_addition", false)
                .kwarg("b", 10i32),
        )
        .await
        .unwrap();
    assert_eq!(value, Value::I32(-3));

    let sum: Vec<f64> = session
        .call_as(
            "add_1d_arrays",
            [Value::from(vec![1.0f64, 2.0]), Value::from(vec![0.5f64, 0.25])],
        )
        .await
        .unwrap();
    assert_eq!(sum, vec![1.5, 2.25]);

    let a1 = Value::matrix(vec![vec![1.0f64, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
    let a2 = Value::matrix(vec![vec![1.0f64, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
    let product: Vec<Vec<f64>> = session
        .call_as("matrix_multiply", [a1, a2])
        .await
        .unwrap();
    assert_eq!(product, vec![vec![22.0, 28.0], vec![49.0, 64.0]]);

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn reserved_operations() {
    let lib = library();
    let mut session = start(lib.path()).await;

    session.ping().await.unwrap();
    assert_eq!(session.library_path().await.unwrap(), lib.path());
    assert_eq!(session.worker().library(), lib.path());

    // shutdown through the generic call path still reaps the worker
    assert_eq!(
        session.invoke(Request::shutdown()).await.unwrap(),
        Value::Bool(true)
    );
    assert_eq!(session.worker().state(), WorkerState::Terminated);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let lib = library();
    let mut session = start(lib.path()).await;

    let first = session.shutdown().await.unwrap();
    assert!(matches!(first, ShutdownOutcome::Graceful(_)));
    assert_eq!(
        session.shutdown().await.unwrap(),
        ShutdownOutcome::AlreadyTerminated
    );
    assert!(!session.is_open());

    let err = session.call("sum_8bit", [Value::I8(1), Value::I8(1)]).await.unwrap_err();
    assert!(matches!(err, BridgeError::Closed));
}

#[tokio::test]
async fn sessions_are_isolated() {
    let lib = library();
    let mut first = start(lib.path()).await;
    let mut second = Session::start(config(lib.path()).with_port(PortSelection::Reserve))
        .await
        .unwrap();

    assert_ne!(first.worker().pid(), second.worker().pid());
    assert_ne!(first.worker().port(), second.worker().port());

    first.shutdown().await.unwrap();

    assert_eq!(
        second
            .call("sum_16bit", [Value::I16(i16::MAX), Value::I16(-1)])
            .await
            .unwrap(),
        Value::I16(32766)
    );
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_library_fails_startup_with_load_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let err = Session::start(config(&dir.path().join("missing.so")))
        .await
        .err()
        .unwrap();
    match err {
        BridgeError::WorkerExited { status } => assert_eq!(status.code(), Some(3)),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn worker_exits_when_parent_closes_stdin() {
    use std::io::{BufRead, BufReader};
    use std::process::{Command, Stdio};

    let lib = library();
    let mut child = Command::new(WORKER)
        .arg("--library")
        .arg(lib.path())
        .arg("--watch-parent")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let mut line = String::new();
    BufReader::new(child.stdout.take().unwrap())
        .read_line(&mut line)
        .unwrap();
    let report = bitbridge::StartupReport::parse(&line).unwrap();
    assert_eq!(report.pid, child.id());
    assert_ne!(report.port, 0);

    drop(child.stdin.take());
    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(0));
}

#[test]
fn usage_errors_exit_with_clap_code() {
    let status = std::process::Command::new(WORKER)
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}

#[tokio::test]
async fn huge_matrix_product_is_refused_without_killing_the_worker() {
    let lib = library();
    let mut session = start(lib.path()).await;

    let tall = Matrix::new(200_000, 0, Vec::<f64>::new()).unwrap();
    let wide = Matrix::new(0, 200_000, Vec::<f64>::new()).unwrap();
    let err = session
        .call("matrix_multiply", [tall.into(), wide.into()])
        .await
        .unwrap_err();
    match err {
        BridgeError::NativeCall { kind, .. } => assert_eq!(kind, "DimensionMismatch"),
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(
        session
            .call("sum_32bit", [Value::I32(123_456_788), Value::I32(1)])
            .await
            .unwrap(),
        Value::I32(123_456_789)
    );
    assert!(session.is_open());
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn frame_limit_applies_on_both_sides() {
    let lib = library();
    let mut session = Session::start(config(lib.path()).with_max_frame_length(4096))
        .await
        .unwrap();

    let err = session
        .call("reverse_string", [Value::from("x".repeat(8192))])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ProtocolError", "{err}");

    assert_eq!(
        session
            .call_as::<String>("reverse_string", [Value::from("y".repeat(2048) + "z")])
            .await
            .unwrap(),
        "z".to_string() + &"y".repeat(2048)
    );
    session.shutdown().await.unwrap();
}

/// Launches the worker with a smaller frame limit than the controller's.
struct TightWorker;

impl WorkerSpawner for TightWorker {
    fn spawn(&self, launch: &WorkerLaunch) -> io::Result<Child> {
        let mut launch = launch.clone();
        launch.max_frame_length = 4096;
        ProcessSpawner.spawn(&launch)
    }
}

#[tokio::test]
async fn worker_rejecting_a_frame_answers_and_session_recovers() {
    let lib = library();
    let mut session = Session::start(config(lib.path()).with_spawner(Arc::new(TightWorker)))
        .await
        .unwrap();

    let err = session
        .call("reverse_string", [Value::from("x".repeat(64 * 1024))])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ProtocolError", "{err}");
    assert!(err.to_string().contains("4096 byte limit"), "{err}");

    assert!(session.is_open());
    assert_eq!(
        session
            .call_as::<String>("reverse_string", [Value::from("abc")])
            .await
            .unwrap(),
        "cba"
    );
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn dropping_a_session_kills_its_worker() {
    let lib = library();
    let session = start(lib.path()).await;
    let addr = session.worker().addr();

    drop(session);

    // a killed worker stops listening
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::net::TcpStream::connect(addr).await.is_ok() {
        assert!(tokio::time::Instant::now() < deadline, "worker still listening");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(unix)]
#[tokio::test]
async fn worker_killed_mid_session_fails_calls_without_hanging() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use std::os::unix::process::ExitStatusExt;
    use tokio::time::timeout;

    let lib = library();
    let mut session = start(lib.path()).await;
    session.ping().await.unwrap();

    kill(Pid::from_raw(session.worker().pid() as i32), Signal::SIGKILL).unwrap();

    let limit = Duration::from_secs(10);
    let err = timeout(limit, session.call("sum_8bit", [Value::I8(1), Value::I8(2)]))
        .await
        .expect("call hung on a dead worker")
        .unwrap_err();
    assert!(
        matches!(err, BridgeError::Transport(_) | BridgeError::WorkerExited { .. }),
        "{err:?}"
    );

    let err = timeout(limit, session.call("sum_8bit", [Value::I8(1), Value::I8(2)]))
        .await
        .expect("call hung on a dead worker")
        .unwrap_err();
    assert!(
        matches!(
            err,
            BridgeError::Transport(_) | BridgeError::WorkerExited { .. } | BridgeError::Closed
        ),
        "{err:?}"
    );

    let outcome = timeout(limit, session.shutdown())
        .await
        .expect("shutdown hung")
        .unwrap();
    assert!(
        matches!(
            outcome,
            ShutdownOutcome::AlreadyTerminated | ShutdownOutcome::Graceful(_)
        ),
        "{outcome:?}"
    );
    assert_eq!(session.worker().state(), WorkerState::Terminated);
    assert_eq!(
        session.worker().exit_status().and_then(|s| s.signal()),
        Some(9)
    );
    assert!(!session.is_open());
}
