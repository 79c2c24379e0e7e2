//! Socket transport over UNIX streams to a relay daemon.
//!
//! Every link starts with `hello` -> `ready` (or `rejected`), then carries
//! `text` frames in the link's direction. Either side ends the link with a
//! `close` frame followed by EOF; the other side answers with its own
//! `close` and EOF.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tether_core::{Direction, EndpointId, NORMAL_CLOSURE, PROTOCOL_VERSION};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::UnixStream,
    sync::mpsc,
    time::timeout,
};

use crate::{
    IpcError, MessageHandler, Outbound, Socket, SocketDriver, Transport,
    codec::{decode, encode},
    framing::{read_frame, read_frame_or_eof, write_frame},
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a closing side waits for the peer's EOF.
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames exchanged between a socket and the relay daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkFrame {
    /// Opens a link for one endpoint and direction.
    Hello {
        /// Link protocol version of the client.
        protocol: u32,
        /// Endpoint the link serves.
        endpoint: EndpointId,
        /// Which half of the endpoint the link serves.
        direction: Direction,
    },
    /// Link accepted.
    Ready {},
    /// Link refused.
    Rejected {
        reason: RejectReason,
        /// Human-readable detail.
        message: String,
    },
    /// One channel text frame.
    Text {
        /// JSON text.
        text: String,
    },
    /// Graceful shutdown.
    Close {
        /// Close code.
        code: u16,
    },
}

/// Why the relay refused a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    DuplicateReader,
    ProtocolMismatch,
    BadHandshake,
}

/// Transport connecting to a relay daemon listening on a UNIX socket.
#[derive(Debug, Clone)]
pub struct UnixTransport {
    path: PathBuf,
}

impl UnixTransport {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn open(
        &self,
        endpoint: &EndpointId,
        direction: Direction,
        on_message: Option<MessageHandler>,
    ) -> Result<Socket, IpcError> {
        let mut stream = UnixStream::connect(&self.path).await?;
        let hello = LinkFrame::Hello {
            protocol: PROTOCOL_VERSION,
            endpoint: endpoint.clone(),
            direction,
        };

        let reply = timeout(HANDSHAKE_TIMEOUT, async {
            send_link(&mut stream, &hello).await?;
            let frame = read_frame(&mut stream).await?;
            decode::<LinkFrame>(&frame)
        })
        .await
        .map_err(|_| IpcError::Timeout)??;

        match reply {
            LinkFrame::Ready {} => {}
            LinkFrame::Rejected {
                reason: RejectReason::DuplicateReader,
                ..
            } => {
                return Err(IpcError::DuplicateReader {
                    endpoint: endpoint.clone(),
                });
            }
            LinkFrame::Rejected { message, .. } => return Err(IpcError::Rejected(message)),
            other => return Err(IpcError::UnexpectedFrame(format!("{other:?}"))),
        }

        let (socket, driver) = Socket::pair(endpoint.clone(), direction);
        driver.mark_open();
        tokio::spawn(drive_link(stream, driver, on_message));
        tracing::debug!(
            endpoint = %endpoint,
            direction = %direction,
            path = %self.path.display(),
            "link socket open"
        );
        Ok(socket)
    }
}

async fn drive_link(stream: UnixStream, mut driver: SocketDriver, on_message: Option<MessageHandler>) {
    let (read_half, mut write_half) = stream.into_split();
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let pump = tokio::spawn(pump_frames(read_half, inbound_tx));

    loop {
        tokio::select! {
            biased;
            outbound = driver.next_outbound() => {
                let code = match outbound {
                    Some(Outbound::Text(text)) => {
                        if let Err(err) = send_link(&mut write_half, &LinkFrame::Text { text }).await {
                            tracing::debug!(error = %err, endpoint = %driver.endpoint(), "link write failed");
                            break;
                        }
                        continue;
                    }
                    Some(Outbound::Close(code)) => code,
                    None => NORMAL_CLOSURE,
                };
                driver.mark_closing();
                let _ = send_link(&mut write_half, &LinkFrame::Close { code }).await;
                let _ = write_half.shutdown().await;
                let _ = timeout(CLOSE_TIMEOUT, async {
                    while inbound.recv().await.is_some() {}
                })
                .await;
                break;
            }
            frame = inbound.recv() => match frame {
                Some(LinkFrame::Text { text }) => {
                    if let Some(handler) = &on_message {
                        handler(text);
                    }
                }
                Some(LinkFrame::Close { code }) => {
                    if code == NORMAL_CLOSURE {
                        tracing::debug!(endpoint = %driver.endpoint(), code, "relay closed link");
                    } else {
                        tracing::warn!(endpoint = %driver.endpoint(), code, "relay closed link abnormally");
                    }
                    driver.mark_closing();
                    let _ = send_link(&mut write_half, &LinkFrame::Close { code }).await;
                    let _ = write_half.shutdown().await;
                    break;
                }
                Some(other) => {
                    tracing::warn!(endpoint = %driver.endpoint(), frame = ?other, "unexpected link frame");
                }
                None => break,
            },
        }
    }

    pump.abort();
}

/// Encodes and writes one link frame.
pub(crate) async fn send_link<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &LinkFrame,
) -> Result<(), IpcError> {
    let payload = encode(frame)?;
    write_frame(writer, &payload).await
}

/// Reads link frames into `frames` until EOF or a read/decode failure.
///
/// Runs on its own task so consumers can `select!` on the receiving end
/// without cancelling a half-read frame.
pub(crate) async fn pump_frames<R: AsyncRead + Unpin>(
    mut reader: R,
    frames: mpsc::UnboundedSender<LinkFrame>,
) {
    loop {
        match read_frame_or_eof(&mut reader).await {
            Ok(Some(payload)) => match decode::<LinkFrame>(&payload) {
                Ok(frame) => {
                    if frames.send(frame).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "undecodable link frame");
                    return;
                }
            },
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(error = %err, "link read ended");
                return;
            }
        }
    }
}
