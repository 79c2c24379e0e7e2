//! Per-endpoint mailboxes behind every transport.
//!
//! A writer's `message` frames go straight to the endpoint's attached reader,
//! or wait in a FIFO queue until one attaches. `pause` detaches the reader so
//! later messages queue up again; `delete` drops whatever is queued.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tether_core::{ControlFrame, EndpointId};
use tokio::sync::mpsc::{self, error::SendError};

use crate::{IpcError, codec::decode_text};

/// Event sent to an attached reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// JSON text of one message body.
    Message(String),
    /// The reader was paused and must reconnect to receive again.
    Disconnect,
}

/// Attachment of one reader to an endpoint mailbox.
#[derive(Debug)]
pub struct ReaderLease {
    /// Identifies this attachment when detaching.
    pub token: u64,
    /// Queued and live events, in delivery order.
    pub events: mpsc::UnboundedReceiver<ReaderEvent>,
}

impl ReaderLease {
    /// Drains messages that were handed to this lease but never consumed.
    pub fn take_unread(&mut self) -> Vec<String> {
        let mut unread = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let ReaderEvent::Message(text) = event {
                unread.push(text);
            }
        }
        unread
    }
}

#[derive(Debug, Default)]
struct Mailbox {
    queue: VecDeque<String>,
    reader: Option<AttachedReader>,
}

#[derive(Debug)]
struct AttachedReader {
    token: u64,
    events: mpsc::UnboundedSender<ReaderEvent>,
}

impl Mailbox {
    fn has_live_reader(&self) -> bool {
        self.reader
            .as_ref()
            .is_some_and(|reader| !reader.events.is_closed())
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.reader.is_none()
    }
}

/// Mailboxes keyed by endpoint id.
#[derive(Debug, Default)]
pub struct Relay {
    mailboxes: Mutex<HashMap<EndpointId, Mailbox>>,
    next_token: AtomicU64,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the single reader of an endpoint and flushes its queue to it.
    pub fn attach_reader(&self, endpoint: &EndpointId) -> Result<ReaderLease, IpcError> {
        let mut mailboxes = self.mailboxes();
        let mailbox = mailboxes.entry(endpoint.clone()).or_default();
        if mailbox.has_live_reader() {
            return Err(IpcError::DuplicateReader {
                endpoint: endpoint.clone(),
            });
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let flushed = mailbox.queue.len();
        for text in mailbox.queue.drain(..) {
            // The receiver is alive until this function returns.
            let _ = events_tx.send(ReaderEvent::Message(text));
        }
        mailbox.reader = Some(AttachedReader {
            token,
            events: events_tx,
        });

        tracing::debug!(endpoint = %endpoint, token, flushed, "reader attached");
        Ok(ReaderLease {
            token,
            events: events_rx,
        })
    }

    /// Detaches a reader. Messages it never consumed go back to the front of
    /// the queue, or to whichever reader has attached since.
    pub fn detach_reader(&self, endpoint: &EndpointId, token: u64, unread: Vec<String>) {
        let mut mailboxes = self.mailboxes();
        let Some(mailbox) = mailboxes.get_mut(endpoint) else {
            return;
        };

        if mailbox
            .reader
            .as_ref()
            .is_some_and(|reader| reader.token == token)
        {
            mailbox.reader = None;
        }

        let requeued = unread.len();
        match &mailbox.reader {
            Some(reader) => {
                for text in unread {
                    let _ = reader.events.send(ReaderEvent::Message(text));
                }
            }
            None => {
                for text in unread.into_iter().rev() {
                    mailbox.queue.push_front(text);
                }
            }
        }

        if mailbox.is_idle() {
            mailboxes.remove(endpoint);
        }
        tracing::debug!(endpoint = %endpoint, token, requeued, "reader detached");
    }

    /// Applies one JSON control frame written to `endpoint`. Message bodies
    /// are forwarded as the exact text the writer sent.
    pub fn deliver(&self, endpoint: &EndpointId, text: &str) -> Result<(), IpcError> {
        let frame: ControlFrame = decode_text(text)?;
        self.apply(endpoint, frame);
        Ok(())
    }

    pub fn apply(&self, endpoint: &EndpointId, frame: ControlFrame) {
        let mut mailboxes = self.mailboxes();
        match frame {
            ControlFrame::Message(body) => {
                let mailbox = mailboxes.entry(endpoint.clone()).or_default();
                let mut text = body.get().to_owned();
                if let Some(reader) = &mailbox.reader {
                    match reader.events.send(ReaderEvent::Message(text)) {
                        Ok(()) => return,
                        Err(SendError(event)) => {
                            mailbox.reader = None;
                            let ReaderEvent::Message(unsent) = event else {
                                return;
                            };
                            text = unsent;
                        }
                    }
                }
                mailbox.queue.push_back(text);
            }
            ControlFrame::Pause => {
                let Some(mailbox) = mailboxes.get_mut(endpoint) else {
                    return;
                };
                if let Some(reader) = mailbox.reader.take() {
                    let _ = reader.events.send(ReaderEvent::Disconnect);
                    tracing::debug!(endpoint = %endpoint, token = reader.token, "reader paused");
                }
                if mailbox.is_idle() {
                    mailboxes.remove(endpoint);
                }
            }
            ControlFrame::Delete => {
                let Some(mailbox) = mailboxes.get_mut(endpoint) else {
                    return;
                };
                let dropped = mailbox.queue.len();
                mailbox.queue.clear();
                if mailbox.is_idle() {
                    mailboxes.remove(endpoint);
                }
                tracing::debug!(endpoint = %endpoint, dropped, "mailbox deleted");
            }
        }
    }

    /// Number of messages waiting for a reader on `endpoint`.
    pub fn queued(&self, endpoint: &EndpointId) -> usize {
        self.mailboxes()
            .get(endpoint)
            .map(|mailbox| mailbox.queue.len())
            .unwrap_or(0)
    }

    /// True if a live reader is attached to `endpoint`.
    pub fn has_reader(&self, endpoint: &EndpointId) -> bool {
        self.mailboxes()
            .get(endpoint)
            .is_some_and(Mailbox::has_live_reader)
    }

    fn mailboxes(&self) -> MutexGuard<'_, HashMap<EndpointId, Mailbox>> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
