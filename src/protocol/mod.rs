//! Sound level meter wire protocol
//!
//! Pure decoding of the meter's serial messages:
//! - Control byte bit fields (mode, response speed, max-hold, Leq basis)
//! - Checksum verification of a received frame
//! - Frame shape matching and level computation

mod control;
mod frame;

pub use frame::{decode_frame, verify_checksum, Reading, ACK_BYTE, FRAME_LEN, HEARTBEAT_BYTE};

#[cfg(test)]
pub(crate) use control::decode_control_byte;
#[cfg(test)]
pub(crate) use frame::{encode_frame, Level};
