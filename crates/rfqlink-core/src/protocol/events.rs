//! Link events
//!
//! The complete observable surface of a link session. The reader thread
//! feeds one bounded, ordered queue and the manager merges its own events
//! into that stream, so a consumer sees lifecycle changes and frames in the
//! order they happened.
//!
//! Overflow policy: producers never drop on a full queue straight away.
//! They retry every poll interval until the consumer makes room. A frame
//! still waiting when the reader is told to stop is dropped; the reader's
//! lifecycle events wait up to half the close timeout before being dropped
//! with a warning. The manager drains the queue while it waits for a reader
//! to stop, so in practice they always get through.

use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread;
use std::time::{Duration, Instant};

use super::{Frame, PortDescriptor};

/// Event raised by a link session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LinkEvent {
    /// The background reader is running
    ReaderStarted,
    /// The background reader has exited
    ReaderStopped,
    /// A complete frame arrived
    FrameReceived(Frame),
    /// Reading from the handle failed; the reader is terminating
    ReaderError(String),
    /// Opening the port failed
    ConnectError(String),
    /// The port is open and the link is usable
    ConnectSucceeded(PortDescriptor),
    /// The link has been closed and the handle released
    Disconnected(PortDescriptor),
}

impl LinkEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            LinkEvent::ReaderStarted => "reader_started",
            LinkEvent::ReaderStopped => "reader_stopped",
            LinkEvent::FrameReceived(_) => "frame_received",
            LinkEvent::ReaderError(_) => "reader_error",
            LinkEvent::ConnectError(_) => "connect_error",
            LinkEvent::ConnectSucceeded(_) => "connect_succeeded",
            LinkEvent::Disconnected(_) => "disconnected",
        }
    }

    /// Whether this event carries data rather than lifecycle/error signalling
    pub fn is_frame(&self) -> bool {
        matches!(self, LinkEvent::FrameReceived(_))
    }
}

/// Consumer of link events, typically owned by the presentation layer
pub trait Dispatcher {
    /// Handle one event
    fn dispatch(&mut self, event: LinkEvent);
}

impl<F> Dispatcher for F
where
    F: FnMut(LinkEvent),
{
    fn dispatch(&mut self, event: LinkEvent) {
        self(event)
    }
}

/// Producer side of the event queue
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: SyncSender<LinkEvent>,
    retry_interval: Duration,
}

/// Create the bounded event queue
pub(crate) fn event_queue(
    capacity: usize,
    retry_interval: Duration,
) -> (EventSender, Receiver<LinkEvent>) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (EventSender { tx, retry_interval }, rx)
}

impl EventSender {
    /// Queue `event`, waiting for room until `give_up` returns true.
    ///
    /// Returns false if the event was dropped. A consumer that has gone
    /// away is not an error.
    pub(crate) fn deliver(&self, event: LinkEvent, mut give_up: impl FnMut() -> bool) -> bool {
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(dropped)) => {
                    tracing::trace!("No event consumer, dropping {}", dropped.kind());
                    return false;
                }
                Err(TrySendError::Full(returned)) => {
                    if give_up() {
                        tracing::warn!("Event queue full, dropping {}", returned.kind());
                        return false;
                    }
                    event = returned;
                    thread::sleep(self.retry_interval);
                }
            }
        }
    }

    /// Queue `event`, waiting at most `timeout` for room
    pub(crate) fn deliver_within(&self, event: LinkEvent, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.deliver(event, || Instant::now() >= deadline)
    }
}
