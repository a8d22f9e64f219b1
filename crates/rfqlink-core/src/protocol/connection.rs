//! Connection management
//!
//! Handles the link lifecycle: opening the handle, running the reader and
//! handshake, and tearing everything down in the right order.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use super::events::{event_queue, EventSender};
use super::handshake::{self, HandshakeReport};
use super::reader::{FrameReader, ReaderHandle, ReaderSettings};
use super::serial::{NativePortOpener, PortDescriptor, PortOpener, SharedChannel};
use super::{ConnectionError, Dispatcher, LinkEvent, TransmitError, Transmitter, BAUD_RATE};
use crate::config::LinkConfig;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Opening the port (only observable inside `open`)
    Connecting,
    /// Connected and ready
    Connected,
}

/// Everything that exists only while the link is up
struct Session {
    port: PortDescriptor,
    /// The owned handle; the reader and transmitter hold views of it
    channel: SharedChannel,
    transmitter: Transmitter,
    reader: ReaderHandle,
}

/// One operator session with the controller.
///
/// Owns the serial handle and the background reader. Every event the
/// session produces, from this thread or the reader, comes out of
/// [`poll_event`](Self::poll_event) in order.
pub struct ConnectionManager {
    config: LinkConfig,
    opener: Box<dyn PortOpener>,
    state: ConnectionState,
    session: Option<Session>,
    last_handshake: Option<HandshakeReport>,
    events: EventSender,
    event_rx: Receiver<LinkEvent>,
    /// Events taken off the queue but not yet handed out, in stream order.
    /// Foreground events go straight here so they never wait on the queue
    /// this manager is the only consumer of.
    backlog: VecDeque<LinkEvent>,
}

impl ConnectionManager {
    /// Create a manager that opens real serial ports
    pub fn new(config: LinkConfig) -> Self {
        Self::with_opener(config, Box::new(NativePortOpener))
    }

    /// Create a manager with a custom port opener
    pub fn with_opener(config: LinkConfig, opener: Box<dyn PortOpener>) -> Self {
        let (events, event_rx) = event_queue(config.event_capacity(), config.poll_interval());
        Self {
            config,
            opener,
            state: ConnectionState::Disconnected,
            session: None,
            last_handshake: None,
            events,
            event_rx,
            backlog: VecDeque::new(),
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the link is up
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Port of the active session
    pub fn port(&self) -> Option<&PortDescriptor> {
        self.session.as_ref().map(|s| &s.port)
    }

    /// Session configuration
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Outcome of the most recent handshake
    pub fn last_handshake(&self) -> Option<&HandshakeReport> {
        self.last_handshake.as_ref()
    }

    /// Open `port`, start the reader and run the handshake.
    ///
    /// Opening while connected is a no-op. Handshake failures are logged
    /// and leave the link up.
    pub fn open(&mut self, port: PortDescriptor) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Disconnected {
            let current = self
                .port()
                .map(|p| p.to_string())
                .unwrap_or_else(|| port.to_string());
            tracing::info!("Already connected to {}", current);
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        tracing::info!("Connecting to {}", port);

        let mut handle = match self.opener.open(&port, BAUD_RATE) {
            Ok(handle) => handle,
            Err(e) => {
                let reason = match &e {
                    ConnectionError::OpenFailed(reason) => reason.clone(),
                    other => other.to_string(),
                };
                tracing::warn!("Failed to open {}: {}", port, reason);
                self.state = ConnectionState::Disconnected;
                self.emit(LinkEvent::ConnectError(reason));
                return Err(e);
            }
        };

        // Bytes that arrived before this session belong to no one
        if let Err(e) = handle.clear_input_buffer() {
            tracing::debug!("{}: failed to clear input buffer: {}", port, e);
        }

        let channel = SharedChannel::new(handle);
        let transmitter = Transmitter::new(channel.writer());

        self.state = ConnectionState::Connected;
        self.emit(LinkEvent::ConnectSucceeded(port.clone()));

        let reader = match FrameReader::spawn(
            channel.reader(),
            self.events.clone(),
            self.reader_settings(),
        ) {
            Ok(reader) => reader,
            Err(e) => {
                tracing::error!("Failed to start frame reader: {}", e);
                drop(transmitter);
                drop(channel);
                self.state = ConnectionState::Disconnected;
                self.emit(LinkEvent::ConnectError(e.to_string()));
                self.emit(LinkEvent::Disconnected(port));
                return Err(ConnectionError::ReaderSpawn(e.to_string()));
            }
        };

        tracing::info!("Connected to {}", port);

        let report = handshake::run(&transmitter, self.config.handshake_delay());
        self.last_handshake = Some(report);

        self.session = Some(Session {
            port,
            channel,
            transmitter,
            reader,
        });
        Ok(())
    }

    /// Stop the reader, release the handle and go back to `Disconnected`.
    ///
    /// The handle is released even if the reader does not stop in time.
    /// Closing a closed link does nothing.
    pub fn close(&mut self) -> Result<(), ConnectionError> {
        let Some(session) = self.session.take() else {
            self.state = ConnectionState::Disconnected;
            return Ok(());
        };

        let Session {
            port,
            channel,
            transmitter,
            reader,
        } = session;

        tracing::info!("Disconnecting from {}", port);

        let timeout = self.config.close_timeout();
        // Keep the queue moving so a reader blocked on a full queue can finish
        if !reader.stop_and_wait(timeout, || self.drain_queue()) {
            tracing::warn!(
                "Frame reader did not stop within {}ms, releasing handle anyway",
                timeout.as_millis()
            );
        }

        drop(transmitter);
        drop(channel);

        self.state = ConnectionState::Disconnected;
        self.emit(LinkEvent::Disconnected(port));
        Ok(())
    }

    /// Send a command to the controller
    pub fn send(&mut self, command: &str) -> Result<(), TransmitError> {
        match (&self.session, self.state) {
            (Some(session), ConnectionState::Connected) => session.transmitter.send(command),
            _ => Err(TransmitError::NotConnected),
        }
    }

    /// Wait up to `timeout` for the next event.
    ///
    /// A reader error from the active session forces a close before the
    /// event is returned, so `ReaderStopped` and `Disconnected` follow it.
    pub fn poll_event(&mut self, timeout: Duration) -> Option<LinkEvent> {
        let event = match self.backlog.pop_front() {
            Some(event) => event,
            None if timeout.is_zero() => self.event_rx.try_recv().ok()?,
            None => self.event_rx.recv_timeout(timeout).ok()?,
        };

        if let LinkEvent::ReaderError(reason) = &event {
            let active_failed = self
                .session
                .as_ref()
                .is_some_and(|s| s.reader.has_failed());
            if active_failed {
                tracing::warn!("Link lost ({}), closing", reason);
                if let Err(e) = self.close() {
                    tracing::error!("Failed to close after reader error: {}", e);
                }
            }
        }

        Some(event)
    }

    /// Forward every available event to `dispatcher`.
    ///
    /// Waits up to `timeout` for the first event only. Returns the number
    /// of events dispatched.
    pub fn pump<D: Dispatcher + ?Sized>(&mut self, dispatcher: &mut D, timeout: Duration) -> usize {
        let mut count = 0;
        let mut wait = timeout;
        while let Some(event) = self.poll_event(wait) {
            dispatcher.dispatch(event);
            count += 1;
            wait = Duration::ZERO;
        }
        count
    }

    fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            chunk_size: self.config.read_chunk_size(),
            poll_interval: self.config.poll_interval(),
            // Must stay below the close bound
            lifecycle_timeout: self.config.close_timeout() / 2,
        }
    }

    /// Move everything queued so far into the backlog
    fn drain_queue(&mut self) {
        let rx = &self.event_rx;
        self.backlog.extend(rx.try_iter());
    }

    /// Append a foreground event after everything queued before it
    fn emit(&mut self, event: LinkEvent) {
        self.drain_queue();
        self.backlog.push_back(event);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
