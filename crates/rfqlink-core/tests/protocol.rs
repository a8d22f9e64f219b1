use chrono::{Local, NaiveTime};
use pretty_assertions::assert_eq;
use rfqlink_core::config::LinkConfig;
use rfqlink_core::demo::DemoOpener;
use rfqlink_core::protocol::{
    ConnectionError, ConnectionManager, ConnectionState, Frame, LinkEvent, PortDescriptor,
    PortOpener, SerialChannel, TransmitError,
};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// State shared between a test and the mock serial port it drives
#[derive(Default)]
struct MockState {
    incoming: VecDeque<io::Result<Vec<u8>>>,
    writes: Vec<Vec<u8>>,
    write_calls: usize,
    fail_on_write: bool,
    opens: usize,
}

#[derive(Clone, Default)]
struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    fn feed(&self, bytes: &[u8]) {
        self.0.lock().unwrap().incoming.push_back(Ok(bytes.to_vec()));
    }

    fn fail_next_read(&self, kind: io::ErrorKind, msg: &str) {
        self.0
            .lock()
            .unwrap()
            .incoming
            .push_back(Err(io::Error::new(kind, msg.to_string())));
    }

    fn set_fail_on_write(&self, fail: bool) {
        self.0.lock().unwrap().fail_on_write = fail;
    }

    fn writes(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    fn write_calls(&self) -> usize {
        self.0.lock().unwrap().write_calls
    }

    fn opens(&self) -> usize {
        self.0.lock().unwrap().opens
    }
}

/// Mock serial port for testing
struct MockSerial {
    state: MockHandle,
}

impl Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.0.lock().unwrap();
        match state.incoming.pop_front() {
            Some(Ok(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    state.incoming.push_front(Ok(bytes[n..].to_vec()));
                }
                Ok(n)
            }
            Some(Err(e)) => Err(e),
            None => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }
}

impl Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.0.lock().unwrap();
        state.write_calls += 1;
        if state.fail_on_write {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        state.writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialChannel for MockSerial {}

struct MockOpener {
    state: MockHandle,
    refuse: Option<String>,
}

impl PortOpener for MockOpener {
    fn open(
        &self,
        _port: &PortDescriptor,
        baud_rate: u32,
    ) -> Result<Box<dyn SerialChannel>, ConnectionError> {
        assert_eq!(baud_rate, 460_800);
        if let Some(reason) = &self.refuse {
            return Err(ConnectionError::OpenFailed(reason.clone()));
        }
        self.state.0.lock().unwrap().opens += 1;
        Ok(Box::new(MockSerial {
            state: self.state.clone(),
        }))
    }
}

/// Route core logs through the test harness; set RUST_LOG to see them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> LinkConfig {
    LinkConfig {
        poll_interval_ms: 1,
        handshake_delay_ms: 10,
        ..LinkConfig::default()
    }
}

fn mock_manager() -> (ConnectionManager, MockHandle) {
    mock_manager_with(fast_config())
}

fn mock_manager_with(config: LinkConfig) -> (ConnectionManager, MockHandle) {
    init_tracing();
    let handle = MockHandle::default();
    let manager = ConnectionManager::with_opener(
        config,
        Box::new(MockOpener {
            state: handle.clone(),
            refuse: None,
        }),
    );
    (manager, handle)
}

fn port() -> PortDescriptor {
    PortDescriptor::new("/dev/ttyUSB0", "RFQ controller")
}

/// Poll events until `done` is satisfied by the collected events or two seconds pass
fn collect_until(
    manager: &mut ConnectionManager,
    done: impl Fn(&[LinkEvent]) -> bool,
) -> Vec<LinkEvent> {
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut events = Vec::new();
    while !done(&events) && Instant::now() < deadline {
        if let Some(event) = manager.poll_event(Duration::from_millis(10)) {
            events.push(event);
        }
    }
    events
}

fn frames(events: &[LinkEvent]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|e| match e {
            LinkEvent::FrameReceived(frame) => Some(frame.as_bytes().to_vec()),
            _ => None,
        })
        .collect()
}

fn is_clock_command(command: &str) -> bool {
    let Some(value) = command.strip_prefix("time=").and_then(|v| v.strip_suffix('\r')) else {
        return false;
    };
    let bytes = value.as_bytes();
    bytes.len() == 8
        && bytes[2] == b':'
        && bytes[5] == b':'
        && [0, 1, 3, 4, 6, 7].iter().all(|&i| bytes[i].is_ascii_digit())
}

#[test]
fn test_open_runs_handshake_first() {
    let (mut manager, mock) = mock_manager();
    manager.open(port()).unwrap();

    assert_eq!(manager.state(), ConnectionState::Connected);
    let writes = mock.writes();
    assert_eq!(writes.len(), 2, "writes: {:?}", writes);
    assert!(is_clock_command(&writes[0]), "bad clock command {:?}", writes[0]);
    assert_eq!(writes[1], "time\r");

    // The clock sent is the host's local time
    let sent = NaiveTime::parse_from_str(&writes[0][5..13], "%H:%M:%S").unwrap();
    let drift = (Local::now().time() - sent).num_seconds().rem_euclid(86_400);
    assert!(drift <= 2 || drift >= 86_398, "clock off by {}s", drift);

    manager.send("status").unwrap();
    assert_eq!(mock.writes()[2], "status\r");
    assert!(manager.last_handshake().unwrap().is_complete());
}

#[test]
fn test_open_emits_connect_then_reader_started() {
    let (mut manager, _mock) = mock_manager();
    manager.open(port()).unwrap();

    let events = collect_until(&mut manager, |e| e.len() >= 2);
    assert_eq!(
        events,
        vec![LinkEvent::ConnectSucceeded(port()), LinkEvent::ReaderStarted]
    );
}

#[test]
fn test_frames_split_across_reads() {
    let (mut manager, mock) = mock_manager();
    manager.open(port()).unwrap();

    mock.feed(b"hello\rwor");
    mock.feed(b"ld\rpar");

    let events = collect_until(&mut manager, |e| frames(e).len() >= 2);
    assert_eq!(frames(&events), vec![b"hello".to_vec(), b"world".to_vec()]);

    // "par" stays buffered: nothing more shows up
    assert!(manager.poll_event(Duration::from_millis(30)).is_none());
}

#[test]
fn test_partial_frame_not_replayed_after_reconnect() {
    let (mut manager, mock) = mock_manager();
    manager.open(port()).unwrap();
    mock.feed(b"stale");
    std::thread::sleep(Duration::from_millis(50));
    manager.close().unwrap();

    manager.open(port()).unwrap();
    mock.feed(b"fresh\r");
    let events = collect_until(&mut manager, |e| !frames(e).is_empty());
    assert_eq!(frames(&events), vec![b"fresh".to_vec()]);
    assert_eq!(mock.opens(), 2);
}

#[test]
fn test_close_is_idempotent() {
    let (mut manager, _mock) = mock_manager();
    manager.open(port()).unwrap();

    assert!(manager.close().is_ok());
    assert!(manager.close().is_ok());
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let events = collect_until(&mut manager, |e| {
        e.iter().any(|ev| matches!(ev, LinkEvent::Disconnected(_)))
    });
    let disconnects = events
        .iter()
        .filter(|e| matches!(e, LinkEvent::Disconnected(_)))
        .count();
    assert_eq!(disconnects, 1);
    assert!(events.contains(&LinkEvent::ReaderStopped));
}

#[test]
fn test_close_after_reader_died() {
    let (mut manager, mock) = mock_manager();
    manager.open(port()).unwrap();
    mock.fail_next_read(io::ErrorKind::BrokenPipe, "device unplugged");

    // Give the reader time to hit the error without polling events
    std::thread::sleep(Duration::from_millis(50));
    assert!(manager.close().is_ok());
    assert!(manager.close().is_ok());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[test]
fn test_read_error_forces_disconnect() {
    let (mut manager, mock) = mock_manager();
    manager.open(port()).unwrap();
    mock.feed(b"last\r");
    mock.fail_next_read(io::ErrorKind::BrokenPipe, "device unplugged");

    let events = collect_until(&mut manager, |e| {
        e.iter().any(|ev| matches!(ev, LinkEvent::Disconnected(_)))
    });

    assert_eq!(
        events,
        vec![
            LinkEvent::ConnectSucceeded(port()),
            LinkEvent::ReaderStarted,
            LinkEvent::FrameReceived(Frame::from(&b"last"[..])),
            LinkEvent::ReaderError("device unplugged".to_string()),
            LinkEvent::ReaderStopped,
            LinkEvent::Disconnected(port()),
        ]
    );
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.send("time"), Err(TransmitError::NotConnected));
}

#[test]
fn test_send_while_disconnected_never_writes() {
    let (mut manager, mock) = mock_manager();
    assert_eq!(manager.send("time"), Err(TransmitError::NotConnected));
    assert_eq!(mock.write_calls(), 0);
}

#[test]
fn test_non_ascii_command_is_rejected() {
    let (mut manager, mock) = mock_manager();
    manager.open(port()).unwrap();
    let before = mock.write_calls();

    let result = manager.send("héllo");
    assert!(matches!(result, Err(TransmitError::EncodingError { .. })));
    assert_eq!(mock.write_calls(), before);
    assert!(manager.is_connected());
}

#[test]
fn test_write_failure_keeps_connection() {
    let (mut manager, mock) = mock_manager();
    manager.open(port()).unwrap();
    mock.set_fail_on_write(true);

    assert_eq!(
        manager.send("status"),
        Err(TransmitError::WriteFailed("device unplugged".to_string()))
    );
    assert_eq!(manager.state(), ConnectionState::Connected);

    mock.set_fail_on_write(false);
    assert!(manager.send("status").is_ok());
}

#[test]
fn test_handshake_failure_does_not_roll_back() {
    let (mut manager, mock) = mock_manager();
    mock.set_fail_on_write(true);

    manager.open(port()).unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);

    let report = manager.last_handshake().unwrap();
    assert!(report.set_clock.is_err());
    assert!(report.query_clock.is_err());
    // Both steps were attempted
    assert_eq!(mock.write_calls(), 2);
}

#[test]
fn test_open_while_connected_is_noop() {
    let (mut manager, mock) = mock_manager();
    manager.open(port()).unwrap();
    assert!(manager
        .open(PortDescriptor::new("/dev/ttyUSB1", "other"))
        .is_ok());

    assert_eq!(mock.opens(), 1);
    assert_eq!(manager.port(), Some(&port()));
    assert_eq!(mock.writes().len(), 2);
}

#[test]
fn test_open_failure() {
    let mut manager = ConnectionManager::with_opener(
        fast_config(),
        Box::new(MockOpener {
            state: MockHandle::default(),
            refuse: Some("/dev/ttyUSB0: device not found".to_string()),
        }),
    );

    let err = manager.open(port()).unwrap_err();
    assert!(matches!(err, ConnectionError::OpenFailed(_)));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        manager.poll_event(Duration::from_millis(10)),
        Some(LinkEvent::ConnectError(
            "/dev/ttyUSB0: device not found".to_string()
        ))
    );
}

#[test]
fn test_pump_into_dispatcher() {
    let (mut manager, mock) = mock_manager();
    manager.open(port()).unwrap();
    mock.feed(b"a\rb\r");

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while seen.len() < 4 && Instant::now() < deadline {
        manager.pump(&mut |event: LinkEvent| seen.push(event), Duration::from_millis(10));
    }

    assert_eq!(
        seen,
        vec![
            LinkEvent::ConnectSucceeded(port()),
            LinkEvent::ReaderStarted,
            LinkEvent::FrameReceived(Frame::from(&b"a"[..])),
            LinkEvent::FrameReceived(Frame::from(&b"b"[..])),
        ]
    );
}

#[test]
fn test_demo_device_answers_handshake() {
    let opener = DemoOpener::new();
    let log = opener.command_log();
    let mut manager = ConnectionManager::with_opener(fast_config(), Box::new(opener));

    manager
        .open(PortDescriptor::new("demo", "Demo controller"))
        .unwrap();

    let events = collect_until(&mut manager, |e| frames(e).len() >= 2);
    let replies = frames(&events);
    assert_eq!(replies[0], b"ok".to_vec());
    assert_eq!(replies[1].len(), 8);
    assert_eq!(replies[1][2], b':');

    let commands = log.snapshot();
    assert_eq!(commands.len(), 2);
    assert!(commands[0].starts_with("time="));
    assert_eq!(commands[1], "time");
}

#[test]
fn test_drop_closes_link() {
    let (mut manager, mock) = mock_manager();
    manager.open(port()).unwrap();
    drop(manager);

    // The handle is released: only the mock state's own reference remains
    assert_eq!(Arc::strong_count(&mock.0), 1);
}

#[test]
fn test_close_with_full_queue_keeps_lifecycle_events() {
    let (mut manager, mock) = mock_manager_with(LinkConfig {
        event_capacity: 4,
        ..fast_config()
    });
    manager.open(port()).unwrap();
    for _ in 0..20 {
        mock.feed(b"x\r");
    }

    // Nobody polls: the reader ends up blocked on the full queue
    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    manager.close().unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "close took {:?}",
        started.elapsed()
    );

    let events = collect_until(&mut manager, |e| {
        e.iter().any(|ev| matches!(ev, LinkEvent::Disconnected(_)))
    });
    assert_eq!(events[0], LinkEvent::ConnectSucceeded(port()));
    assert_eq!(events[1], LinkEvent::ReaderStarted);
    let tail = &events[events.len() - 2..];
    assert_eq!(
        tail,
        &[LinkEvent::ReaderStopped, LinkEvent::Disconnected(port())]
    );
    assert!(events[2..events.len() - 2]
        .iter()
        .all(|e| *e == LinkEvent::FrameReceived(Frame::from(&b"x"[..]))));
}

/// Per-channel switches for a port whose reads can hang
#[derive(Default)]
struct Stall {
    stalled: AtomicBool,
    released: AtomicBool,
}

struct StallingChannel {
    stall: Arc<Stall>,
}

impl Read for StallingChannel {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        if self.stall.stalled.load(Ordering::SeqCst) {
            while !self.stall.released.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        }
        Err(io::Error::from(io::ErrorKind::TimedOut))
    }
}

impl Write for StallingChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialChannel for StallingChannel {}

#[derive(Clone, Default)]
struct StallingOpener {
    channels: Arc<Mutex<Vec<Arc<Stall>>>>,
}

impl PortOpener for StallingOpener {
    fn open(
        &self,
        _port: &PortDescriptor,
        _baud_rate: u32,
    ) -> Result<Box<dyn SerialChannel>, ConnectionError> {
        let stall = Arc::new(Stall::default());
        self.channels.lock().unwrap().push(Arc::clone(&stall));
        Ok(Box::new(StallingChannel { stall }))
    }
}

#[test]
fn test_close_gives_up_on_hung_reader() {
    init_tracing();
    let opener = StallingOpener::default();
    let channels = Arc::clone(&opener.channels);
    let mut manager = ConnectionManager::with_opener(
        LinkConfig {
            close_timeout_ms: 50,
            ..fast_config()
        },
        Box::new(opener),
    );

    manager.open(port()).unwrap();
    let first = Arc::clone(&channels.lock().unwrap()[0]);
    first.stalled.store(true, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    manager.close().unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "close took {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "close took {:?}", elapsed);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let events = collect_until(&mut manager, |e| {
        e.iter().any(|ev| matches!(ev, LinkEvent::Disconnected(_)))
    });
    assert_eq!(events.last(), Some(&LinkEvent::Disconnected(port())));
    // The hung reader never got to stop
    assert!(!events.contains(&LinkEvent::ReaderStopped));

    // A fresh session works while the old reader is still stuck
    manager.open(port()).unwrap();
    assert!(manager.is_connected());
    assert_eq!(channels.lock().unwrap().len(), 2);

    first.released.store(true, Ordering::SeqCst);
    manager.close().unwrap();
}
