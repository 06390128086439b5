//! Rolling retention buffer of recent audio chunks
//!
//! Holds the last `window` of audio. While a capture is active trimming is
//! suspended so the eventual snapshot covers the whole event, up to a hard
//! `capture_limit`. Worst-case memory is therefore
//! `capture_limit * sample_rate * channels * 2` bytes no matter how often a
//! capture is extended.
//!
//! Trim, snapshot and the capture flag share one lock, so a trim can never
//! race a snapshot.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use super::{AudioChunk, AudioFormat};

struct Inner {
    chunks: VecDeque<AudioChunk>,
    capture_active: bool,
    /// Set once the capture limit forced a drop, to warn only once per capture
    limit_hit: bool,
}

/// Bounded, thread-safe history of audio chunks
pub struct RetentionBuffer {
    format: AudioFormat,
    window_chunks: usize,
    limit_chunks: usize,
    inner: Mutex<Inner>,
}

impl RetentionBuffer {
    /// Create a buffer retaining `window` of audio, growing to at most
    /// `capture_limit` while a capture is active
    pub fn new(format: AudioFormat, window: Duration, capture_limit: Duration) -> Self {
        let window_chunks = format.chunks_for(window);
        let limit_chunks = format.chunks_for(capture_limit).max(window_chunks);

        debug!(
            window_chunks,
            limit_chunks,
            chunk_ms = format.chunk_duration().as_millis() as u64,
            max_bytes = format.bytes_for(limit_chunks),
            "retention buffer sized"
        );

        Self {
            format,
            window_chunks,
            limit_chunks,
            inner: Mutex::new(Inner {
                chunks: VecDeque::with_capacity(window_chunks + 1),
                capture_active: false,
                limit_hit: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Chunk count kept when no capture is active
    #[cfg(test)]
    pub fn window_chunks(&self) -> usize {
        self.window_chunks
    }

    /// Append a chunk, then trim from the head if over the current bound
    pub fn ingest(&self, chunk: AudioChunk) {
        let mut inner = self.lock();
        inner.chunks.push_back(chunk);

        let bound = if inner.capture_active {
            self.limit_chunks
        } else {
            self.window_chunks
        };

        let excess = inner.chunks.len().saturating_sub(bound);
        if excess == 0 {
            return;
        }

        if inner.capture_active && !inner.limit_hit {
            inner.limit_hit = true;
            warn!(
                limit_chunks = self.limit_chunks,
                "capture exceeded the buffer limit, dropping oldest audio"
            );
        }
        inner.chunks.drain(..excess);
    }

    /// Drop everything older than the retention window, leaving the
    /// capture flag as it is
    ///
    /// Used when a new capture starts while the previous clip is still being
    /// written, so the next clip does not repeat the previous one.
    pub fn trim_to_window(&self) {
        let mut inner = self.lock();
        let excess = inner.chunks.len().saturating_sub(self.window_chunks);
        inner.chunks.drain(..excess);
        inner.limit_hit = false;
    }

    /// Independent copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<AudioChunk> {
        self.lock().chunks.iter().cloned().collect()
    }

    /// Suspend or resume trimming back to the retention window
    pub fn set_capture_active(&self, active: bool) {
        let mut inner = self.lock();
        inner.capture_active = active;
        if !active {
            inner.limit_hit = false;
        }
    }

    #[cfg(test)]
    pub fn is_capture_active(&self) -> bool {
        self.lock().capture_active
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().chunks.len()
    }

    /// Duration covered by the retained chunks
    #[cfg(test)]
    pub fn retained_duration(&self) -> Duration {
        self.format.chunk_duration() * self.len() as u32
    }
}
