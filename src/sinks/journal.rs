//! JSON-lines journal of capture events

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;

use crate::events::CaptureEvent;

use super::{file_stamp, SinkError};

#[derive(Serialize)]
struct JournalLine<'a> {
    at: String,
    #[serde(flatten)]
    event: &'a CaptureEvent,
}

/// Appends one JSON object per capture event to `captures_<timestamp>.jsonl`
pub struct EventJournal {
    path: PathBuf,
    file: File,
}

impl EventJournal {
    pub fn create(dir: &Path) -> Result<Self, SinkError> {
        let path = dir.join(format!("captures_{}.jsonl", file_stamp(Local::now())));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, event: &CaptureEvent) -> Result<(), SinkError> {
        let line = JournalLine {
            at: Local::now().to_rfc3339(),
            event,
        };
        let json = serde_json::to_string(&line)?;
        writeln!(self.file, "{json}")?;
        self.file.flush()?;
        Ok(())
    }
}
