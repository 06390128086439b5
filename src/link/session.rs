//! Link session state machine
//!
//! Handles transitions between Disconnected, Opening, Synchronized and
//! ReadingFrame. Each poll waits for one heartbeat, acknowledges it, then
//! collects bytes until the line goes quiet for one read timeout.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::protocol::{
    decode_frame, verify_checksum, Reading, ACK_BYTE, FRAME_LEN, HEARTBEAT_BYTE,
};
use crate::sinks::ReadingSink;

use super::serial::{open_with_retry, ByteLink, LinkOpener, RetryPolicy};
use super::LinkError;

/// Longest run of bytes accepted as one frame before it is cut
const MAX_FRAME_BYTES: usize = 64;

/// Granularity of interruptible sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Sleep for `total`, waking early if `running` is cleared
///
/// Returns whether the session should keep running.
pub(super) fn sleep_while_running(total: Duration, running: &AtomicBool) -> bool {
    let until = Instant::now() + total;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= until {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(until - now));
    }
}

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No port handle held
    Disconnected,
    /// Open attempts in progress
    Opening,
    /// Port open, waiting for a heartbeat
    Synchronized,
    /// Heartbeat acknowledged, collecting frame bytes
    ReadingFrame,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Opening => write!(f, "Opening"),
            LinkState::Synchronized => write!(f, "Synchronized"),
            LinkState::ReadingFrame => write!(f, "ReadingFrame"),
        }
    }
}

/// Result of one poll of the link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Nothing arrived within the read timeout
    Timeout,
    /// A byte other than the heartbeat arrived while idle
    Noise(u8),
    /// Heartbeat acknowledged but no frame followed
    EmptyFrame,
    /// Frame failed checksum verification
    ChecksumMismatch(Vec<u8>),
    /// Checksum passed but the payload is not a measurement frame
    Unrecognized(Vec<u8>),
    /// A decoded measurement
    Reading(Reading),
}

/// Counters for what the session has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub heartbeats: u64,
    pub readings: u64,
    pub noise_bytes: u64,
    pub empty_frames: u64,
    pub checksum_errors: u64,
    pub unrecognized_frames: u64,
    pub reconnects: u64,
}

/// Session timing and retry settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub retry: RetryPolicy,
    /// Pause after a stray byte before listening again
    pub noise_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            noise_backoff: Duration::from_secs(1),
        }
    }
}

/// Classify a completed frame (checksum byte included)
pub(crate) fn classify_frame(frame: Vec<u8>) -> LinkEvent {
    if frame.is_empty() {
        return LinkEvent::EmptyFrame;
    }
    if !verify_checksum(&frame) {
        return LinkEvent::ChecksumMismatch(frame);
    }
    match decode_frame(&frame[..frame.len() - 1], Local::now()) {
        Some(reading) => LinkEvent::Reading(reading),
        None => LinkEvent::Unrecognized(frame),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The serial session with the meter
pub struct LinkSession<O: LinkOpener> {
    opener: O,
    link: Option<O::Link>,
    state: LinkState,
    config: SessionConfig,
    running: Arc<AtomicBool>,
    stats: LinkStats,
}

impl<O: LinkOpener> LinkSession<O> {
    pub fn new(opener: O, config: SessionConfig, running: Arc<AtomicBool>) -> Self {
        Self {
            opener,
            link: None,
            state: LinkState::Disconnected,
            config,
            running,
            stats: LinkStats::default(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> LinkState {
        self.state
    }

    #[cfg(test)]
    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    fn transition_to(&mut self, new_state: LinkState) {
        if self.state != new_state {
            trace!(from = %self.state, to = %new_state, "link state transition");
            self.state = new_state;
        }
    }

    /// Open the port, retrying per the configured policy
    pub fn connect(&mut self) -> Result<(), LinkError> {
        self.transition_to(LinkState::Opening);
        match open_with_retry(&mut self.opener, &self.config.retry, &self.running) {
            Ok(link) => {
                self.link = Some(link);
                self.transition_to(LinkState::Synchronized);
                Ok(())
            }
            Err(e) => {
                self.transition_to(LinkState::Disconnected);
                Err(e)
            }
        }
    }

    /// Drop the port handle
    pub fn disconnect(&mut self) {
        if self.link.take().is_some() {
            debug!("serial port closed");
        }
        self.transition_to(LinkState::Disconnected);
    }

    /// Wait for one heartbeat and read the frame that follows it
    ///
    /// Read timeouts and bad frames are reported as events, only I/O
    /// failures are errors.
    pub fn poll(&mut self) -> Result<LinkEvent, LinkError> {
        let Some(link) = self.link.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        };

        let byte = match link.read_byte()? {
            Some(byte) => byte,
            None => return Ok(LinkEvent::Timeout),
        };

        if byte != HEARTBEAT_BYTE {
            self.stats.noise_bytes += 1;
            sleep_while_running(self.config.noise_backoff, &self.running);
            return Ok(LinkEvent::Noise(byte));
        }

        self.stats.heartbeats += 1;
        link.write_byte(ACK_BYTE)?;
        self.state = LinkState::ReadingFrame;

        let mut frame = Vec::with_capacity(FRAME_LEN);
        let read = loop {
            match link.read_byte() {
                Ok(Some(byte)) => {
                    frame.push(byte);
                    if frame.len() >= MAX_FRAME_BYTES {
                        break Ok(());
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.state = LinkState::Synchronized;
        read?;

        let event = classify_frame(frame);
        match &event {
            LinkEvent::EmptyFrame => self.stats.empty_frames += 1,
            LinkEvent::ChecksumMismatch(_) => self.stats.checksum_errors += 1,
            LinkEvent::Unrecognized(_) => self.stats.unrecognized_frames += 1,
            LinkEvent::Reading(_) => self.stats.readings += 1,
            LinkEvent::Timeout | LinkEvent::Noise(_) => {}
        }
        Ok(event)
    }

    /// Run until stopped or the port cannot be reopened
    ///
    /// Every reading goes to `sink` and, if present, to `readings`.
    pub fn run<S: ReadingSink>(
        mut self,
        sink: &mut S,
        mut readings: Option<mpsc::Sender<Reading>>,
    ) -> Result<LinkStats, LinkError> {
        info!("link session started");

        while self.running.load(Ordering::SeqCst) {
            if self.link.is_none() {
                match self.connect() {
                    Ok(()) => {}
                    Err(LinkError::Stopped) => break,
                    Err(e) => return Err(e),
                }
            }

            match self.poll() {
                Ok(event) => Self::dispatch(event, sink, &mut readings),
                Err(LinkError::Io(e)) => {
                    warn!(error = %e, "serial link lost, reconnecting");
                    self.stats.reconnects += 1;
                    self.disconnect();
                }
                Err(e) => return Err(e),
            }
        }

        self.disconnect();
        info!(stats = ?self.stats, "link session stopped");
        Ok(self.stats)
    }

    fn dispatch<S: ReadingSink>(
        event: LinkEvent,
        sink: &mut S,
        readings: &mut Option<mpsc::Sender<Reading>>,
    ) {
        match event {
            LinkEvent::Timeout => {}
            LinkEvent::Noise(byte) => {
                debug!(byte = %format!("{byte:#04x}"), "out of sync, ignoring stray byte");
            }
            LinkEvent::EmptyFrame => {
                warn!("no message received");
            }
            LinkEvent::ChecksumMismatch(frame) => {
                warn!(frame = %hex(&frame), "chksum error, frame discarded");
            }
            LinkEvent::Unrecognized(frame) => {
                warn!(frame = %hex(&frame), "unrecognized frame shape, discarded");
            }
            LinkEvent::Reading(reading) => {
                match reading.value {
                    Some(level) => info!(value = %level, mode = %reading.mode, "reading"),
                    None => warn!(mode = %reading.mode, "reading without a value"),
                }

                if let Err(e) = sink.record(&reading) {
                    warn!(error = %e, "failed to write reading log");
                }

                if let Some(tx) = readings.as_ref() {
                    if tx.blocking_send(reading).is_err() {
                        debug!("capture controller gone, readings no longer forwarded");
                        *readings = None;
                    }
                }
            }
        }
    }
}
