//! CSV reading log

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::protocol::Reading;

use super::{file_stamp, SinkError};

/// Timestamp format for log records (ISO 8601 with microseconds)
const RECORD_STAMP: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Receives every decoded reading
pub trait ReadingSink {
    fn record(&mut self, reading: &Reading) -> Result<(), SinkError>;
}

/// Format one log line: `timestamp,value,mode`
///
/// A reading without a value gets an empty value field.
pub fn format_record(reading: &Reading) -> String {
    let value = reading
        .value
        .map(|level| level.to_string())
        .unwrap_or_default();
    format!(
        "{},{},{}",
        reading.timestamp.format(RECORD_STAMP),
        value,
        reading.mode
    )
}

/// Append-only CSV log, flushed after every record
pub struct CsvReadingLog {
    path: PathBuf,
    file: File,
}

impl CsvReadingLog {
    /// Create `log_<timestamp>.txt` in `dir`
    pub fn create(dir: &Path) -> Result<Self, SinkError> {
        let path = dir.join(format!("log_{}.txt", file_stamp(Local::now())));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReadingSink for CsvReadingLog {
    fn record(&mut self, reading: &Reading) -> Result<(), SinkError> {
        writeln!(self.file, "{}", format_record(reading))?;
        self.file.flush()?;
        Ok(())
    }
}
