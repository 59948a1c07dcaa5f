//! bitbridge-worker: hosts a library and serves bitbridge requests over
//! loopback TCP.

mod example;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use anyhow::Context;
use bitbridge::protocol::codec::DEFAULT_MAX_FRAME_LENGTH;
use bitbridge::worker::{WorkerConfig, WorkerError, WorkerExit, exit_code, run_worker};
use clap::Parser;

use crate::example::ExampleLibrary;

#[derive(Debug, Parser)]
#[command(name = "bitbridge-worker", version, about)]
struct Cli {
    /// Path of the library to host.
    #[arg(long)]
    library: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,

    /// Port to listen on; 0 picks an ephemeral port.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Largest frame accepted or sent, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LENGTH)]
    max_frame_length: usize,

    /// Exit when stdin is closed.
    #[arg(long)]
    watch_parent: bool,
}

fn main() {
    bitbridge::logging::init_tracing();
    let cli = Cli::parse();

    let code = match run(cli) {
        Ok(WorkerExit::Shutdown) | Ok(WorkerExit::ParentGone) => exit_code::GRACEFUL,
        Err(e) => {
            tracing::error!(error = ?e, "Worker failed");
            e.downcast_ref::<WorkerError>()
                .map_or(exit_code::UNEXPECTED, WorkerError::exit_code)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<WorkerExit> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let config = WorkerConfig::new(cli.library)
        .with_host(cli.host)
        .with_port(cli.port)
        .with_max_frame_length(cli.max_frame_length)
        .with_watch_parent(cli.watch_parent);
    let result = runtime.block_on(run_worker::<ExampleLibrary>(config));

    // a blocked stdin reader must not hold up exit
    runtime.shutdown_background();
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["bitbridge-worker", "--library", "/opt/lib/example.so"])
            .unwrap();
        assert_eq!(cli.library, PathBuf::from("/opt/lib/example.so"));
        assert_eq!(cli.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(cli.port, 0);
        assert_eq!(cli.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
        assert!(!cli.watch_parent);
    }

    #[test]
    fn cli_full() {
        let cli = Cli::try_parse_from([
            "bitbridge-worker",
            "--library",
            "lib.so",
            "--host",
            "::1",
            "--port",
            "4001",
            "--max-frame-length",
            "4096",
            "--watch-parent",
        ])
        .unwrap();
        assert_eq!(cli.host, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(cli.port, 4001);
        assert_eq!(cli.max_frame_length, 4096);
        assert!(cli.watch_parent);
    }

    #[test]
    fn controller_launch_arguments_parse() {
        let launch = bitbridge::WorkerLaunch {
            program: PathBuf::from("bitbridge-worker"),
            library: PathBuf::from("/opt/lib/example.so"),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 4001,
            max_frame_length: 1 << 20,
        };
        let argv = std::iter::once("bitbridge-worker".into()).chain(launch.args());
        let cli = Cli::try_parse_from(argv).unwrap();
        assert_eq!(cli.library, launch.library);
        assert_eq!(cli.port, 4001);
        assert_eq!(cli.max_frame_length, 1 << 20);
        assert!(cli.watch_parent);
    }

    #[test]
    fn library_is_required() {
        assert!(Cli::try_parse_from(["bitbridge-worker"]).is_err());
    }

    #[test]
    fn worker_errors_keep_their_exit_code_through_anyhow() {
        let err = anyhow::Error::from(WorkerError::Load(bitbridge::LoadError::new(
            "/missing.so",
            "no such file",
        )));
        assert_eq!(
            err.downcast_ref::<WorkerError>().map(WorkerError::exit_code),
            Some(exit_code::LOAD_FAILED)
        );
    }
}
