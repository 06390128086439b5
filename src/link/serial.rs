//! Byte-level access to the serial port
//!
//! `ByteLink` is the seam between the session logic and the device, so the
//! session can be driven by a scripted link in tests.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{error, info, warn};

use super::session::sleep_while_running;
use super::LinkError;

/// A half-duplex byte stream with a read timeout
pub trait ByteLink: Send {
    /// Read one byte, `Ok(None)` if the read timed out
    fn read_byte(&mut self) -> io::Result<Option<u8>>;

    /// Write one byte and flush it
    fn write_byte(&mut self, byte: u8) -> io::Result<()>;
}

/// Something that can (re)open a [`ByteLink`]
pub trait LinkOpener: Send {
    type Link: ByteLink;

    /// Name of the device, for logs
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<Self::Link, LinkError>;
}

/// Bounded open retry with a fixed delay
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            delay: Duration::from_secs(5),
        }
    }
}

/// Open the link, retrying until it succeeds or the budget runs out
///
/// Returns [`LinkError::Stopped`] if `running` is cleared while waiting.
pub fn open_with_retry<O: LinkOpener>(
    opener: &mut O,
    policy: &RetryPolicy,
    running: &AtomicBool,
) -> Result<O::Link, LinkError> {
    for attempt in 1..=policy.max_attempts {
        if !running.load(Ordering::SeqCst) {
            return Err(LinkError::Stopped);
        }

        match opener.open() {
            Ok(link) => {
                info!(device = %opener.describe(), attempt, "serial port opened");
                return Ok(link);
            }
            Err(e) => {
                warn!(
                    error = %e,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "could not open the serial port, retrying in {:?}",
                    policy.delay
                );
            }
        }

        if attempt < policy.max_attempts && !sleep_while_running(policy.delay, running) {
            return Err(LinkError::Stopped);
        }
    }

    error!(device = %opener.describe(), "serial port cannot be opened, giving up");
    Err(LinkError::RetriesExhausted {
        attempts: policy.max_attempts,
    })
}

/// [`ByteLink`] over a real serial port
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
}

impl ByteLink for SerialPortLink {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.port.write_all(&[byte])?;
        self.port.flush()
    }
}

/// Opens the meter's serial device with fixed line settings
#[derive(Debug, Clone)]
pub struct SerialOpener {
    path: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialOpener {
    pub fn new(path: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            timeout,
        }
    }
}

impl LinkOpener for SerialOpener {
    type Link = SerialPortLink;

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud_rate)
    }

    fn open(&mut self) -> Result<SerialPortLink, LinkError> {
        serialport::new(&self.path, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map(|port| SerialPortLink { port })
            .map_err(|e| LinkError::Open {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }
}
