use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};

use clap::{Parser, Subcommand};
use serde_json::Value as Json;
use tether_core::{EndpointId, default_socket_path};
use tether_ipc::UnixTransport;
use tether_rpc::{ChannelState, Hub, ReadChannel, TetherError, WriteChannel};
use thiserror::Error;
use tokio::{sync::mpsc, time::sleep};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tether", about = "Tether channel client")]
struct Cli {
    /// Relay socket; defaults to $TETHER_SOCKET, then $XDG_RUNTIME_DIR/tetherd.sock.
    #[arg(long, default_value_os_t = default_socket_path())]
    socket: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a fresh endpoint id.
    Id,
    #[command(flatten)]
    Channel(ChannelCommand),
}

/// Commands that talk to the relay.
#[derive(Debug, Subcommand)]
enum ChannelCommand {
    /// Send one JSON message to an endpoint.
    Send { endpoint: String, json: String },
    /// Print messages arriving on an endpoint, one JSON document per line.
    Listen {
        endpoint: String,
        /// Exit after this many messages.
        #[arg(long)]
        count: Option<usize>,
    },
    /// Disconnect the endpoint's reader; later messages queue.
    Pause { endpoint: String },
    /// Discard messages queued for the endpoint.
    Delete { endpoint: String },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Tether(#[from] TetherError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON message: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Id => {
            println!("{}", EndpointId::generate());
            Ok(())
        }
        Command::Channel(command) => {
            let hub = Hub::with_transport(UnixTransport::new(&cli.socket));
            let result = run_channel(&hub, command).await;
            hub.shutdown().await;
            result
        }
    }
}

async fn run_channel(hub: &Hub, command: ChannelCommand) -> Result<(), CliError> {
    match command {
        ChannelCommand::Send { endpoint, json } => {
            let message: Json = serde_json::from_str(&json)?;
            let channel = WriteChannel::new(hub, EndpointId::from(endpoint));
            let sent = channel.send_message(&message).await;
            channel.close().await;
            sent.map_err(CliError::from)
        }
        ChannelCommand::Listen { endpoint, count } => {
            listen(hub, EndpointId::from(endpoint), count).await
        }
        ChannelCommand::Pause { endpoint } => {
            let channel = WriteChannel::new(hub, EndpointId::from(endpoint));
            let paused = channel.pause().await;
            channel.close().await;
            paused.map_err(CliError::from)
        }
        ChannelCommand::Delete { endpoint } => {
            let channel = WriteChannel::new(hub, EndpointId::from(endpoint));
            let deleted = channel.delete().await;
            channel.close().await;
            deleted.map_err(CliError::from)
        }
    }
}

/// Prints messages until `count` is reached, the reader is paused, or the
/// user interrupts.
async fn listen(hub: &Hub, endpoint: EndpointId, count: Option<usize>) -> Result<(), CliError> {
    let channel = ReadChannel::new(hub, endpoint)?;
    let (messages_tx, mut messages_rx) = mpsc::unbounded_channel();
    channel.add_listener(move |message| {
        let _ = messages_tx.send(message.clone());
    });
    channel.connect().await?;

    let mut printed = 0_usize;
    let result = loop {
        if count.is_some_and(|count| printed >= count) {
            break Ok(());
        }

        tokio::select! {
            message = messages_rx.recv() => {
                let Some(message) = message else {
                    break Ok(());
                };
                let mut stdout = io::stdout().lock();
                if let Err(err) = writeln!(stdout, "{message}").and_then(|()| stdout.flush()) {
                    break Err(CliError::Io(err));
                }
                printed += 1;
            }
            _ = sleep(Duration::from_millis(250)) => {
                if channel.state().await != ChannelState::Connected {
                    eprintln!("reader disconnected");
                    break Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    channel.close().await;
    result
}
