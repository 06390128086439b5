//! Frame verification and decoding
//!
//! A measurement frame is nine payload bytes followed by a checksum:
//!
//! ```text
//! 08 04 <ctrl> 0A 0A <v0> <v1> <v2> 01 <checksum>
//! ```
//!
//! The checksum is the sum of the payload bytes modulo 256.

use std::fmt;

use chrono::{DateTime, Local};

use super::control::{decode_control_byte, ControlByte};

/// Single byte the meter sends while waiting for the host
pub const HEARTBEAT_BYTE: u8 = 0x10;
/// Reply the host must send after every heartbeat
pub const ACK_BYTE: u8 = 0x20;

/// Payload length (frame minus checksum)
pub const PAYLOAD_LEN: usize = 9;
/// Full frame length including the checksum byte
pub const FRAME_LEN: usize = PAYLOAD_LEN + 1;

const PREAMBLE: [u8; 2] = [0x08, 0x04];
const SEPARATOR: [u8; 2] = [0x0A, 0x0A];
const TERMINATOR: u8 = 0x01;

/// Check the trailing checksum byte of a received frame
///
/// Frames of two bytes or fewer never verify.
pub fn verify_checksum(frame: &[u8]) -> bool {
    match frame.split_last() {
        Some((&checksum, body)) if frame.len() > 2 => {
            body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == checksum
        }
        _ => false,
    }
}

/// Sound level in tenths of a decibel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Level {
    tenths: u16,
}

impl Level {
    pub fn from_tenths(tenths: u16) -> Self {
        Self { tenths }
    }

    /// Level from the three value bytes: `v0 * 10 + v1 + v2 / 10`
    ///
    /// Returns `None` if the arithmetic overflows.
    fn from_value_bytes(v0: u8, v1: u8, v2: u8) -> Option<Self> {
        let tenths = u16::from(v0)
            .checked_mul(100)?
            .checked_add(u16::from(v1).checked_mul(10)?)?
            .checked_add(u16::from(v2))?;
        Some(Self { tenths })
    }

    pub fn as_db(&self) -> f64 {
        f64::from(self.tenths) / 10.0
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.tenths / 10, self.tenths % 10)
    }
}

/// One decoded measurement
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Host wall-clock time at decode; the meter sends no timestamp
    pub timestamp: DateTime<Local>,
    /// Measured level, absent if it could not be computed
    pub value: Option<Level>,
    pub control: ControlByte,
    /// Mode description text, see [`ControlByte::describe`]
    pub mode: String,
}

impl Reading {
    /// True only for a present value strictly above `threshold_db`
    pub fn exceeds(&self, threshold_db: f64) -> bool {
        self.value.is_some_and(|level| level.as_db() > threshold_db)
    }
}

/// Decode a frame payload (checksum already stripped)
///
/// Returns `None` when the payload does not have the measurement frame
/// shape; that is routine for a desynchronized stream.
pub fn decode_frame(payload: &[u8], timestamp: DateTime<Local>) -> Option<Reading> {
    let &[p0, p1, ctrl, s0, s1, v0, v1, v2, term] = payload else {
        return None;
    };

    if [p0, p1] != PREAMBLE || [s0, s1] != SEPARATOR || term != TERMINATOR {
        return None;
    }

    let control = decode_control_byte(ctrl);
    Some(Reading {
        timestamp,
        value: Level::from_value_bytes(v0, v1, v2),
        mode: control.describe(),
        control,
    })
}

#[cfg(test)]
pub(crate) fn encode_frame(ctrl: u8, value: [u8; 3]) -> Vec<u8> {
    let mut frame = vec![
        PREAMBLE[0],
        PREAMBLE[1],
        ctrl,
        SEPARATOR[0],
        SEPARATOR[1],
        value[0],
        value[1],
        value[2],
        TERMINATOR,
    ];
    let checksum = frame.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    frame.push(checksum);
    frame
}
