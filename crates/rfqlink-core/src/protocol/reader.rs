//! Background frame reader
//!
//! Polls the serial handle without blocking, feeds the bytes through a
//! [`FrameAccumulator`] and queues every completed frame as an event.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::events::EventSender;
use super::serial::ChannelReader;
use super::{FrameAccumulator, LinkEvent};

/// Timing and sizing for one reader instance
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReaderSettings {
    /// Bytes requested per read
    pub chunk_size: usize,
    /// Sleep between empty reads
    pub poll_interval: Duration,
    /// How long start/stop/error events may wait for queue room
    pub lifecycle_timeout: Duration,
}

/// Flags shared between a reader and its handle
#[derive(Debug, Default)]
pub(crate) struct ReaderFlags {
    /// Set by the foreground to ask the reader to exit
    stop: AtomicBool,
    /// Set by the reader when the handle failed
    failed: AtomicBool,
}

impl ReaderFlags {
    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Reader loop state. Lives on its own thread for one session.
pub(crate) struct FrameReader {
    source: ChannelReader,
    accumulator: FrameAccumulator,
    events: EventSender,
    flags: Arc<ReaderFlags>,
    settings: ReaderSettings,
}

impl FrameReader {
    pub(crate) fn new(
        source: ChannelReader,
        events: EventSender,
        flags: Arc<ReaderFlags>,
        settings: ReaderSettings,
    ) -> Self {
        Self {
            source,
            accumulator: FrameAccumulator::with_capacity(settings.chunk_size),
            events,
            flags,
            settings,
        }
    }

    /// Start a reader on a dedicated thread
    pub(crate) fn spawn(
        source: ChannelReader,
        events: EventSender,
        settings: ReaderSettings,
    ) -> io::Result<ReaderHandle> {
        let flags = Arc::new(ReaderFlags::default());
        let (done_tx, done_rx) = mpsc::channel();
        let reader = FrameReader::new(source, events, Arc::clone(&flags), settings);

        let join = thread::Builder::new()
            .name("rfqlink-reader".to_string())
            .spawn(move || {
                reader.run();
                let _ = done_tx.send(());
            })?;

        Ok(ReaderHandle {
            flags,
            done: done_rx,
            join: Some(join),
            poll_interval: settings.poll_interval,
        })
    }

    /// Run until stopped or the handle fails
    pub(crate) fn run(mut self) {
        tracing::debug!("Frame reader started");
        self.emit_lifecycle(LinkEvent::ReaderStarted);

        let mut chunk = vec![0u8; self.settings.chunk_size.max(1)];

        while !self.flags.stop_requested() {
            match self.source.read(&mut chunk) {
                Ok(0) => thread::sleep(self.settings.poll_interval),
                Ok(n) => {
                    tracing::trace!("Read {} bytes", n);
                    for frame in self.accumulator.push(&chunk[..n]) {
                        let flags = &self.flags;
                        let queued = self
                            .events
                            .deliver(LinkEvent::FrameReceived(frame), || flags.stop_requested());
                        if !queued && flags.stop_requested() {
                            break;
                        }
                    }
                }
                Err(e) if is_idle(&e) => thread::sleep(self.settings.poll_interval),
                Err(e) => {
                    tracing::error!("Serial read failed: {}", e);
                    self.flags.failed.store(true, Ordering::Release);
                    self.emit_lifecycle(LinkEvent::ReaderError(e.to_string()));
                    break;
                }
            }
        }

        let pending = self.accumulator.pending().len();
        if pending > 0 {
            tracing::debug!("Discarding {} unterminated bytes", pending);
        }

        tracing::debug!("Frame reader stopped");
        self.emit_lifecycle(LinkEvent::ReaderStopped);
    }

    fn emit_lifecycle(&self, event: LinkEvent) {
        self.events
            .deliver_within(event, self.settings.lifecycle_timeout);
    }
}

/// Read outcomes that only mean "no data yet" on a zero-timeout handle
fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Foreground handle on a running reader: stop signal plus termination wait.
/// Never owns the serial handle.
pub(crate) struct ReaderHandle {
    flags: Arc<ReaderFlags>,
    done: Receiver<()>,
    join: Option<JoinHandle<()>>,
    poll_interval: Duration,
}

impl ReaderHandle {
    /// Signal the reader and wait up to `timeout` for it to exit.
    ///
    /// `on_wait` runs once per poll interval while waiting, so the caller
    /// can keep draining the event queue the reader may be blocked on.
    /// Returns false if the reader did not exit in time; it is then left
    /// detached with its stop flag set.
    pub(crate) fn stop_and_wait(mut self, timeout: Duration, mut on_wait: impl FnMut()) -> bool {
        self.flags.stop.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;

        loop {
            on_wait();
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done.recv_timeout(remaining.min(self.poll_interval)) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) if remaining.is_zero() => return false,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::warn!("Frame reader thread panicked");
            }
        }
        true
    }

    /// Whether the reader terminated because the handle failed
    pub(crate) fn has_failed(&self) -> bool {
        self.flags.failed.load(Ordering::Acquire)
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.flags.stop.store(true, Ordering::Release);
    }
}
