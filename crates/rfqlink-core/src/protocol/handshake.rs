//! Startup handshake
//!
//! Run once per connection: push the host clock to the controller, then ask
//! it for its clock. The reply comes back as an ordinary frame.

use chrono::{Local, NaiveTime, Timelike};
use std::thread;
use std::time::Duration;

use super::{TransmitError, Transmitter};

/// Query command for the controller's clock
pub const QUERY_CLOCK_COMMAND: &str = "time";

/// Build the `time=HH:MM:SS` command for `time` (24-hour, zero padded)
pub fn set_clock_command(time: NaiveTime) -> String {
    format!(
        "time={:02}:{:02}:{:02}",
        time.hour(),
        time.minute(),
        time.second()
    )
}

/// Outcome of both handshake steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReport {
    /// Result of sending `time=HH:MM:SS`
    pub set_clock: Result<(), TransmitError>,
    /// Result of sending `time`
    pub query_clock: Result<(), TransmitError>,
}

impl HandshakeReport {
    /// Whether both commands went out
    pub fn is_complete(&self) -> bool {
        self.set_clock.is_ok() && self.query_clock.is_ok()
    }
}

/// Run the handshake using the local wall clock
pub fn run(transmitter: &Transmitter, delay: Duration) -> HandshakeReport {
    run_at(transmitter, delay, Local::now().time())
}

/// Run the handshake with an explicit clock value.
///
/// Failures are logged and reported but never abort the second step.
pub fn run_at(transmitter: &Transmitter, delay: Duration, now: NaiveTime) -> HandshakeReport {
    let set_clock = transmitter.send(&set_clock_command(now));
    if let Err(e) = &set_clock {
        tracing::warn!("Handshake: failed to set controller clock: {}", e);
    }

    // The controller parser merges commands arriving in one burst
    thread::sleep(delay);

    let query_clock = transmitter.send(QUERY_CLOCK_COMMAND);
    if let Err(e) = &query_clock {
        tracing::warn!("Handshake: failed to query controller clock: {}", e);
    }

    let report = HandshakeReport {
        set_clock,
        query_clock,
    };
    if report.is_complete() {
        tracing::info!("Handshake sent");
    }
    report
}
