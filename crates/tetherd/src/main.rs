use std::{
    fs, io,
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use clap::Parser;
use tether_core::{PROTOCOL_VERSION, default_socket_path};
use tether_ipc::{IpcError, Relay, serve_unix};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tetherd", about = "Tether relay daemon")]
struct Args {
    /// Listening socket; defaults to $TETHER_SOCKET, then $XDG_RUNTIME_DIR/tetherd.sock.
    #[arg(long, default_value_os_t = default_socket_path())]
    socket: PathBuf,
}

#[derive(Debug, Error)]
enum DaemonError {
    #[error("socket path: {0}")]
    SocketPath(#[from] io::Error),
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("tetherd error: {err}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<(), DaemonError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    prepare_socket_path(&args.socket)?;

    info!(
        socket = %args.socket.display(),
        daemon = env!("CARGO_PKG_VERSION"),
        protocol = PROTOCOL_VERSION,
        "starting tetherd"
    );

    let relay = Arc::new(Relay::new());
    let result = tokio::select! {
        served = serve_unix(&args.socket, relay) => served.map_err(DaemonError::from),
        signal = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            signal.map_err(DaemonError::from)
        }
    };

    if let Err(err) = fs::remove_file(&args.socket) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::warn!(error = %err, socket = %args.socket.display(), "failed to remove socket");
        }
    }
    result
}

/// Removes a stale socket left by an earlier run. Anything else at `path`
/// is an error.
fn prepare_socket_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_socket() {
                fs::remove_file(path)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                ))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            Ok(())
        }
        Err(err) => Err(err),
    }
}
