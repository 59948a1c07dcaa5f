//! Controller side of one bridge session.
//!
//! A [`Session`] pairs exactly one controller with exactly one worker process
//! for its lifetime. Calls are sequential: each one sends a request and waits
//! for its response, with no timeout.

use std::path::PathBuf;

use crate::config::SessionConfig;
use crate::error::BridgeError;
use crate::lifecycle::{LifecycleManager, ShutdownOutcome, WorkerHandle, WorkerState};
use crate::protocol::{FromValue, Request, Response, SHUTDOWN, Value};
use crate::transport::Connection;

pub struct Session {
    lifecycle: LifecycleManager,
    worker: WorkerHandle,
    connection: Option<Connection>,
}

impl Session {
    /// Launch a worker and connect to it. No session is returned unless the
    /// worker answered its readiness probe.
    pub async fn start(config: SessionConfig) -> Result<Self, BridgeError> {
        let lifecycle = LifecycleManager::new(config);
        let mut worker = lifecycle.start().await?;

        let connection =
            match Connection::open(worker.addr(), lifecycle.config().max_frame_length).await {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::error!(pid = worker.pid(), error = %e, "Failed to connect to worker");
                    if let Err(shutdown_err) = lifecycle.shutdown(&mut worker, None).await {
                        tracing::warn!(error = %shutdown_err, "Failed to stop worker");
                    }
                    return Err(e);
                }
            };

        tracing::info!(pid = worker.pid(), port = worker.port(), "Session started");
        Ok(Self {
            lifecycle,
            worker,
            connection: Some(connection),
        })
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    /// True until the session is shut down or its worker dies.
    ///
    /// Checks the worker process without blocking, so a crash is noticed
    /// here even before the next call.
    pub fn is_open(&mut self) -> bool {
        if self.worker.state() != WorkerState::Ready {
            return false;
        }
        match self.worker.try_exit_status() {
            Ok(None) => true,
            Ok(Some(_)) => {
                self.connection = None;
                false
            }
            Err(e) => {
                tracing::warn!(pid = self.worker.pid(), error = %e, "Failed to poll worker");
                false
            }
        }
    }

    /// Invoke `operation` with positional arguments.
    pub async fn call(
        &mut self,
        operation: &str,
        args: impl IntoIterator<Item = Value>,
    ) -> Result<Value, BridgeError> {
        self.invoke(Request::new(operation).with_args(args)).await
    }

    /// Like [`Session::call`], extracting the result as `T`.
    pub async fn call_as<T: FromValue>(
        &mut self,
        operation: &str,
        args: impl IntoIterator<Item = Value>,
    ) -> Result<T, BridgeError> {
        Ok(self.call(operation, args).await?.into_typed()?)
    }

    /// Send one request and wait for its response.
    ///
    /// A `shutdown` request goes through [`Session::shutdown`] so the worker
    /// process is reaped.
    pub async fn invoke(&mut self, request: Request) -> Result<Value, BridgeError> {
        if request.operation() == SHUTDOWN {
            self.shutdown().await?;
            return Ok(Value::Bool(true));
        }

        let operation = request.operation().to_string();
        let connection = self.connection().await?;
        tracing::debug!(operation = %operation, "Calling worker");
        match connection.round_trip(request).await {
            Ok(Response::Success(value)) => Ok(value),
            Ok(Response::Failure(failure)) => {
                tracing::debug!(operation = %operation, kind = %failure.kind, "Call failed remotely");
                let err = BridgeError::from(failure);
                // the worker hangs up after a protocol failure
                if matches!(err, BridgeError::Protocol(_)) {
                    self.connection = None;
                }
                Err(err)
            }
            Err(e @ (BridgeError::Transport(_) | BridgeError::Protocol(_))) => {
                tracing::warn!(operation = %operation, error = %e, "Dropping connection to worker");
                self.connection = None;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn ping(&mut self) -> Result<(), BridgeError> {
        self.invoke(Request::ping()).await.map(drop)
    }

    /// Absolute path of the library the worker hosts.
    pub async fn library_path(&mut self) -> Result<PathBuf, BridgeError> {
        let path: String = self.invoke(Request::library_path()).await?.into_typed()?;
        Ok(PathBuf::from(path))
    }

    /// Stop the worker. Calling it again returns
    /// [`ShutdownOutcome::AlreadyTerminated`].
    pub async fn shutdown(&mut self) -> Result<ShutdownOutcome, BridgeError> {
        let connection = self.connection.take();
        self.lifecycle.shutdown(&mut self.worker, connection).await
    }

    /// The open connection, reconnecting if an earlier one was lost.
    async fn connection(&mut self) -> Result<&mut Connection, BridgeError> {
        if self.worker.state() != WorkerState::Ready {
            return Err(BridgeError::Closed);
        }
        if self.connection.is_none() {
            if let Some(status) = self
                .worker
                .try_exit_status()
                .map_err(BridgeError::Transport)?
            {
                return Err(BridgeError::WorkerExited { status });
            }
            tracing::debug!(pid = self.worker.pid(), "Reconnecting to worker");
            let connection =
                Connection::open(self.worker.addr(), self.lifecycle.config().max_frame_length)
                    .await?;
            self.connection = Some(connection);
        }
        self.connection.as_mut().ok_or(BridgeError::Closed)
    }
}
