//! Output sinks
//!
//! - Reading log: one CSV line per decoded reading
//! - Clip writer: one WAV file per finalized capture
//! - Event journal: one JSON line per capture event

mod clip;
mod journal;
mod readings;

pub use clip::{ClipSink, WavClipWriter};
pub use journal::EventJournal;
pub use readings::{CsvReadingLog, ReadingSink};

use chrono::{DateTime, Local};

/// Timestamp format used in file names
const FILE_STAMP: &str = "%Y-%m-%dT%H-%M-%S";

fn file_stamp(at: DateTime<Local>) -> String {
    at.format(FILE_STAMP).to_string()
}

/// Errors that can occur while writing output files
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV encoding error: {0}")]
    Wav(#[from] hound::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("clip is empty")]
    EmptyClip,
}
