//! Control byte decoding
//!
//! The control byte packs the meter's display mode into bit fields:
//!
//! ```text
//!  7 6 | 5 4      | 3 2 1 0
//!  --- | max-hold | mode / response / Leq basis
//! ```
//!
//! When bits 3..2 read `10` the meter is averaging (Leq) and bits 1 and 0
//! carry the response speed and the averaging basis. Otherwise bits 3..1
//! select the measurement mode and bit 0 carries the response speed.

use std::fmt;

use serde::Serialize;

const MAX_HOLD_MASK: u8 = 0b0011_0000;
const MAX_HOLD_SHIFT: u8 = 4;
const LEQ_CLASS_MASK: u8 = 0b0000_1100;
const LEQ_CLASS_SHIFT: u8 = 2;
const LEQ_CLASS: u8 = 0b10;
const MODE_MASK: u8 = 0b0000_1110;
const MODE_SHIFT: u8 = 1;

/// Extract a bit field from `byte`
fn bits(byte: u8, mask: u8, shift: u8) -> u8 {
    (byte & mask) >> shift
}

/// Frequency weighting applied by the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    A,
    C,
    Flat,
}

/// Averaging window used in Leq mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeqBasis {
    /// Averaged over minutes
    Minutes,
    /// Averaged over ten-second windows
    TenSeconds,
}

/// Measurement mode selected on the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mode {
    /// Direct sound pressure level (Lp)
    SoundPressure { weighting: Weighting },
    /// Percentile level (Ln), A-weighted
    Percentile,
    /// Energy-equivalent averaged level, A-weighted
    Leq { basis: LeqBasis },
    /// Calibration reading
    Calibration,
    /// Bit pattern the meter documentation does not assign
    Unknown,
}

/// Detector response speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Slow,
    Fast,
}

/// Max-hold status as reported by the two-bit field
///
/// Only `10` and `01` are meaningful. The other two patterns are kept as
/// `Unknown` instead of being folded into either state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxHold {
    Active,
    Inactive,
    Unknown,
}

impl MaxHold {
    fn from_bits(pair: u8) -> Self {
        match pair {
            0b10 => MaxHold::Active,
            0b01 => MaxHold::Inactive,
            _ => MaxHold::Unknown,
        }
    }
}

/// A decoded control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlByte {
    /// Byte as received
    pub raw: u8,
    pub mode: Mode,
    pub response: Response,
    pub max_hold: MaxHold,
}

/// Decode every field of a control byte
///
/// Total over `u8`: unassigned mode patterns decode to [`Mode::Unknown`].
pub fn decode_control_byte(raw: u8) -> ControlByte {
    let max_hold = MaxHold::from_bits(bits(raw, MAX_HOLD_MASK, MAX_HOLD_SHIFT));

    let (mode, slow) = if bits(raw, LEQ_CLASS_MASK, LEQ_CLASS_SHIFT) == LEQ_CLASS {
        let basis = if raw & 0b01 != 0 {
            LeqBasis::Minutes
        } else {
            LeqBasis::TenSeconds
        };
        (Mode::Leq { basis }, raw & 0b10 != 0)
    } else {
        let mode = match bits(raw, MODE_MASK, MODE_SHIFT) {
            0b000 => Mode::SoundPressure { weighting: Weighting::A },
            0b001 => Mode::SoundPressure { weighting: Weighting::C },
            0b010 => Mode::SoundPressure { weighting: Weighting::Flat },
            0b011 => Mode::Percentile,
            0b110 => Mode::Calibration,
            _ => Mode::Unknown,
        };
        (mode, raw & 0b01 != 0)
    };

    ControlByte {
        raw,
        mode,
        response: if slow { Response::Slow } else { Response::Fast },
        max_hold,
    }
}

impl ControlByte {
    pub fn is_slow(&self) -> bool {
        self.response == Response::Slow
    }

    /// Human readable mode description, as written to the reading log
    ///
    /// e.g. `Lp_(dB),Weighting_A,Fast` or
    /// `Leq_(dB),Weighting_A,based_on_10s,Slow,MaxHold`
    pub fn describe(&self) -> String {
        let mut parts: Vec<&str> = match self.mode {
            Mode::SoundPressure { weighting: Weighting::A } => vec!["Lp_(dB)", "Weighting_A"],
            Mode::SoundPressure { weighting: Weighting::C } => vec!["Lp_(dB)", "Weighting_C"],
            Mode::SoundPressure { weighting: Weighting::Flat } => vec!["Lp_(dB)", "Flat"],
            Mode::Percentile => vec!["Ln_(%)", "Weighting_A"],
            Mode::Leq { basis: LeqBasis::Minutes } => {
                vec!["Leq_(dB)", "Weighting_A", "based_on_minutes"]
            }
            Mode::Leq { basis: LeqBasis::TenSeconds } => {
                vec!["Leq_(dB)", "Weighting_A", "based_on_10s"]
            }
            Mode::Calibration => vec!["Cal_(dB)"],
            Mode::Unknown => vec!["Unknown"],
        };

        parts.push(if self.is_slow() { "Slow" } else { "Fast" });

        if self.max_hold == MaxHold::Active {
            parts.push("MaxHold");
        }

        parts.join(",")
    }
}

impl fmt::Display for ControlByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}
