//! Serial link to the sound level meter
//!
//! Owns the physical connection: open with bounded retry, heartbeat
//! acknowledgement, and frame acquisition using the inter-byte read timeout
//! as the frame delimiter. Runs on a blocking worker thread.

mod serial;
mod session;

pub use serial::{RetryPolicy, SerialOpener};
pub use session::{LinkSession, SessionConfig};

#[cfg(test)]
pub(crate) use session::{tests as testing, LinkStats};

/// Errors that can occur on the serial link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to open serial port {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("serial port could not be opened after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("link session stopped")]
    Stopped,
}
