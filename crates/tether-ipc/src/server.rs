use std::{path::Path, sync::Arc};

use tether_core::{Direction, EndpointId, INVALID_FRAME, NORMAL_CLOSURE, PROTOCOL_VERSION};
use tokio::{
    io::AsyncWriteExt,
    net::{UnixListener, UnixStream},
    sync::mpsc,
    time::timeout,
};

use crate::{
    IpcError,
    codec::decode,
    framing::read_frame_or_eof,
    link::{CLOSE_TIMEOUT, LinkFrame, RejectReason, pump_frames, send_link},
    relay::{ReaderEvent, Relay},
};

/// Accepts relay links on a UNIX socket until the listener fails.
pub async fn serve_unix(path: &Path, relay: Arc<Relay>) -> Result<(), IpcError> {
    let listener = UnixListener::bind(path)?;

    loop {
        let (stream, _) = listener.accept().await?;
        let relay = Arc::clone(&relay);

        tokio::spawn(async move {
            if let Err(err) = handle_link(stream, relay).await {
                tracing::debug!(error = %err, "link handler exited with error");
            }
        });
    }
}

async fn handle_link(mut stream: UnixStream, relay: Arc<Relay>) -> Result<(), IpcError> {
    let Some(frame) = read_frame_or_eof(&mut stream).await? else {
        return Ok(());
    };

    let (endpoint, direction) = match decode::<LinkFrame>(&frame)? {
        LinkFrame::Hello {
            protocol,
            endpoint,
            direction,
        } if protocol == PROTOCOL_VERSION => (endpoint, direction),
        LinkFrame::Hello { protocol, .. } => {
            let err = IpcError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                actual: protocol,
            };
            reject(&mut stream, &err).await;
            return Err(err);
        }
        other => {
            let err = IpcError::UnexpectedFrame(format!("{other:?}"));
            reject(&mut stream, &err).await;
            return Err(err);
        }
    };

    tracing::debug!(endpoint = %endpoint, direction = %direction, "link accepted");
    match direction {
        Direction::Write => serve_writer(stream, relay, endpoint).await,
        Direction::Read => serve_reader(stream, relay, endpoint).await,
    }
}

async fn serve_writer(
    mut stream: UnixStream,
    relay: Arc<Relay>,
    endpoint: EndpointId,
) -> Result<(), IpcError> {
    send_link(&mut stream, &LinkFrame::Ready {}).await?;

    loop {
        let Some(frame) = read_frame_or_eof(&mut stream).await? else {
            return Ok(());
        };
        match decode::<LinkFrame>(&frame)? {
            LinkFrame::Text { text } => {
                if let Err(err) = relay.deliver(&endpoint, &text) {
                    tracing::warn!(error = %err, endpoint = %endpoint, "closing write link on undecodable frame");
                    let _ = send_link(&mut stream, &LinkFrame::Close { code: INVALID_FRAME }).await;
                    let _ = stream.shutdown().await;
                    return Err(err);
                }
            }
            LinkFrame::Close { code } => {
                send_link(&mut stream, &LinkFrame::Close { code }).await?;
                stream.shutdown().await?;
                return Ok(());
            }
            other => {
                tracing::warn!(endpoint = %endpoint, frame = ?other, "unexpected frame on write link");
            }
        }
    }
}

/// How a reader link ended.
enum ReaderExit {
    /// Client asked to close.
    ClientClosed(u16),
    /// Relay paused the reader.
    Paused,
    /// Stream failed or ended without a handshake.
    Dropped,
}

async fn serve_reader(
    mut stream: UnixStream,
    relay: Arc<Relay>,
    endpoint: EndpointId,
) -> Result<(), IpcError> {
    let mut lease = match relay.attach_reader(&endpoint) {
        Ok(lease) => lease,
        Err(err) => {
            reject(&mut stream, &err).await;
            return Err(err);
        }
    };

    let (read_half, mut write_half) = stream.into_split();
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let pump = tokio::spawn(pump_frames(read_half, inbound_tx));
    let mut unsent = Vec::new();

    let exit = match send_link(&mut write_half, &LinkFrame::Ready {}).await {
        Err(_) => ReaderExit::Dropped,
        Ok(()) => loop {
            tokio::select! {
                biased;
                frame = inbound.recv() => match frame {
                    Some(LinkFrame::Close { code }) => break ReaderExit::ClientClosed(code),
                    Some(other) => {
                        tracing::warn!(endpoint = %endpoint, frame = ?other, "unexpected frame on read link");
                    }
                    None => break ReaderExit::Dropped,
                },
                event = lease.events.recv() => match event {
                    Some(ReaderEvent::Message(text)) => {
                        if send_link(&mut write_half, &LinkFrame::Text { text: text.clone() }).await.is_err() {
                            unsent.push(text);
                            break ReaderExit::Dropped;
                        }
                    }
                    Some(ReaderEvent::Disconnect) | None => break ReaderExit::Paused,
                },
            }
        },
    };

    // Detach before acknowledging so an immediate reconnect finds the slot free.
    unsent.extend(lease.take_unread());
    relay.detach_reader(&endpoint, lease.token, unsent);

    match exit {
        ReaderExit::ClientClosed(code) => {
            let _ = send_link(&mut write_half, &LinkFrame::Close { code }).await;
            let _ = write_half.shutdown().await;
        }
        ReaderExit::Paused => {
            let _ = send_link(
                &mut write_half,
                &LinkFrame::Close {
                    code: NORMAL_CLOSURE,
                },
            )
            .await;
            let _ = write_half.shutdown().await;
            let _ = timeout(CLOSE_TIMEOUT, async {
                while inbound.recv().await.is_some() {}
            })
            .await;
        }
        ReaderExit::Dropped => {}
    }

    pump.abort();
    Ok(())
}

async fn reject(stream: &mut UnixStream, err: &IpcError) {
    let reason = match err {
        IpcError::DuplicateReader { .. } => RejectReason::DuplicateReader,
        IpcError::ProtocolMismatch { .. } => RejectReason::ProtocolMismatch,
        _ => RejectReason::BadHandshake,
    };
    let _ = send_link(
        stream,
        &LinkFrame::Rejected {
            reason,
            message: err.to_string(),
        },
    )
    .await;
    let _ = stream.shutdown().await;
}
