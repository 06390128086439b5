//! Audio capture and retention
//!
//! Microphone input is cut into fixed-size chunks of 16-bit PCM and kept in a
//! rolling retention buffer, so a capture can reach back in time from the
//! moment a loud reading arrives.

mod buffer;
mod ingest;

pub use buffer::RetentionBuffer;
pub use ingest::{list_input_devices, AudioIngest};

use std::sync::Arc;
use std::time::Duration;

/// Bytes per sample; capture is always 16-bit signed PCM
pub const BYTES_PER_SAMPLE: usize = 2;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Fixed capture format for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames (one sample per channel) per chunk
    pub chunk_frames: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 1,
            chunk_frames: 1024,
        }
    }
}

impl AudioFormat {
    /// Interleaved samples in one chunk
    pub fn chunk_samples(&self) -> usize {
        self.chunk_frames * usize::from(self.channels)
    }

    pub fn chunk_duration(&self) -> Duration {
        let nanos = self.chunk_frames as u128 * NANOS_PER_SEC / u128::from(self.sample_rate);
        Duration::from_nanos(nanos as u64)
    }

    /// Smallest chunk count whose duration is at least `duration`
    pub fn chunks_for(&self, duration: Duration) -> usize {
        let frames_scaled = duration.as_nanos() * u128::from(self.sample_rate);
        let per_chunk = NANOS_PER_SEC * self.chunk_frames as u128;
        frames_scaled.div_ceil(per_chunk) as usize
    }

    /// Bytes held by `chunks` chunks
    pub fn bytes_for(&self, chunks: usize) -> usize {
        chunks * self.chunk_samples() * BYTES_PER_SAMPLE
    }
}

/// One fixed-size slice of interleaved samples
///
/// Immutable once produced; clones share the sample data.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    samples: Arc<[i16]>,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Errors that can occur while opening or running audio capture
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no default input device available")]
    NoDefaultDevice,

    #[error("no input device with index {0}")]
    DeviceIndex(usize),

    #[error("failed to enumerate input devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("failed to query input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("unsupported sample format {0}")]
    UnsupportedFormat(String),

    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start input stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("failed to spawn audio thread: {0}")]
    ThreadSpawn(String),

    #[error("audio thread exited before the stream started")]
    ThreadExited,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_for_rounds_up() {
        let format = AudioFormat::default();
        // 3 s at 44.1 kHz is 129.2 chunks of 1024 frames
        assert_eq!(format.chunks_for(Duration::from_secs(3)), 130);
        assert_eq!(format.chunks_for(Duration::ZERO), 0);
    }

    #[test]
    fn test_chunk_samples_interleaves_channels() {
        let format = AudioFormat {
            sample_rate: 8_000,
            channels: 2,
            chunk_frames: 100,
        };
        assert_eq!(format.chunk_samples(), 200);
        assert_eq!(format.bytes_for(10), 4_000);
        assert!((format.chunk_duration().as_secs_f64() - 0.0125).abs() < 1e-9);
    }
}
