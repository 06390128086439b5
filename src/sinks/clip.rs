//! WAV clip writer

use std::path::{Path, PathBuf};

use chrono::Local;
use hound::{SampleFormat, WavSpec, WavWriter};

use crate::audio::{AudioChunk, AudioFormat, BYTES_PER_SAMPLE};

use super::{file_stamp, SinkError};

/// Persists one finalized capture
pub trait ClipSink: Send + Sync {
    /// Write the chunks as one clip and return where it went
    fn write_clip(&self, chunks: &[AudioChunk], format: &AudioFormat) -> Result<PathBuf, SinkError>;
}

/// Writes `audio_<timestamp>.wav` files into a directory
#[derive(Debug, Clone)]
pub struct WavClipWriter {
    dir: PathBuf,
}

impl WavClipWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// First free `audio_<stamp>[_n].wav` path
    fn next_path(&self) -> PathBuf {
        let stamp = file_stamp(Local::now());
        let mut path = self.dir.join(format!("audio_{stamp}.wav"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("audio_{stamp}_{n}.wav"));
            n += 1;
        }
        path
    }

    fn write_to(path: &Path, chunks: &[AudioChunk], format: &AudioFormat) -> Result<(), SinkError> {
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: (BYTES_PER_SAMPLE * 8) as u16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec)?;
        for chunk in chunks {
            for &sample in chunk.samples() {
                writer.write_sample(sample)?;
            }
        }
        writer.finalize()?;
        Ok(())
    }
}

impl ClipSink for WavClipWriter {
    fn write_clip(&self, chunks: &[AudioChunk], format: &AudioFormat) -> Result<PathBuf, SinkError> {
        if chunks.iter().all(AudioChunk::is_empty) {
            return Err(SinkError::EmptyClip);
        }
        let path = self.next_path();
        Self::write_to(&path, chunks, format)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> AudioFormat {
        AudioFormat {
            sample_rate: 8_000,
            channels: 1,
            chunk_frames: 4,
        }
    }

    #[test]
    fn test_writes_concatenated_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WavClipWriter::new(dir.path());
        let chunks = vec![AudioChunk::new(vec![1, 2, 3, 4]), AudioChunk::new(vec![5, 6, 7, 8])];

        let path = writer.write_clip(&chunks, &format()).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 8_000);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_same_second_clips_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WavClipWriter::new(dir.path());
        let chunks = vec![AudioChunk::new(vec![1, 2, 3, 4])];

        let first = writer.write_clip(&chunks, &format()).unwrap();
        let second = writer.write_clip(&chunks, &format()).unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }

    #[test]
    fn test_empty_clip_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WavClipWriter::new(dir.path());
        assert!(matches!(writer.write_clip(&[], &format()), Err(SinkError::EmptyClip)));
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WavClipWriter::new(dir.path().join("missing"));
        let chunks = vec![AudioChunk::new(vec![1, 2, 3, 4])];
        assert!(writer.write_clip(&chunks, &format()).is_err());
    }
}
