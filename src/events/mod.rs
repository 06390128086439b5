//! Events module for capture controller transitions
//!
//! Provides structured event types for capture triggering, extension,
//! and clip save outcomes.

use serde::{Deserialize, Serialize};

/// Events emitted by the capture controller during transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureEvent {
    /// A loud reading started a new capture
    CaptureTriggered {
        /// Level that crossed the threshold, in dB
        level_db: f64,
        /// Milliseconds until the capture is finalized
        deadline_in_ms: u64,
    },

    /// A loud reading pushed the pending deadline out
    CaptureExtended {
        /// Level that crossed the threshold, in dB
        level_db: f64,
        /// Milliseconds until the capture is finalized
        deadline_in_ms: u64,
        /// Whether a clip write was in progress at the time
        while_saving: bool,
    },

    /// Deadline reached, buffer snapshot handed to the clip writer
    SaveStarted {
        /// Chunks in the snapshot
        chunks: usize,
    },

    /// Clip written successfully
    ClipSaved {
        path: String,
        chunks: usize,
    },

    /// Clip write failed; the controller is idle again regardless
    ClipFailed {
        error: String,
    },
}

impl std::fmt::Display for CaptureEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureEvent::CaptureTriggered { level_db, deadline_in_ms } => {
                write!(f, "CAPTURE_TRIGGERED ({level_db:.1} dB, save in {deadline_in_ms}ms)")
            }
            CaptureEvent::CaptureExtended { level_db, deadline_in_ms, .. } => {
                write!(f, "CAPTURE_EXTENDED ({level_db:.1} dB, save in {deadline_in_ms}ms)")
            }
            CaptureEvent::SaveStarted { chunks } => write!(f, "SAVE_STARTED ({chunks} chunks)"),
            CaptureEvent::ClipSaved { path, chunks } => {
                write!(f, "CLIP_SAVED ({path}, {chunks} chunks)")
            }
            CaptureEvent::ClipFailed { error } => write!(f, "CLIP_FAILED ({error})"),
        }
    }
}
