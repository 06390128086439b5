//! Microphone ingestion via CPAL.
//!
//! The input stream lives on a dedicated `audio-ingest` thread (CPAL streams
//! are not `Send`). Callback data of any supported sample type is converted
//! to i16, cut into fixed-size chunks and appended to the retention buffer.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig};
use tracing::{debug, info, warn};

use super::{AudioChunk, AudioError, AudioFormat, RetentionBuffer};

/// Cuts an arbitrary-length sample stream into fixed-size chunks
pub struct ChunkAssembler {
    chunk_samples: usize,
    pending: Vec<i16>,
}

impl ChunkAssembler {
    pub fn new(chunk_samples: usize) -> Self {
        Self {
            chunk_samples,
            pending: Vec::with_capacity(chunk_samples),
        }
    }

    /// Append samples, calling `emit` for every chunk that fills up
    pub fn push(&mut self, mut samples: &[i16], mut emit: impl FnMut(AudioChunk)) {
        while !samples.is_empty() {
            let take = (self.chunk_samples - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.chunk_samples {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.chunk_samples));
                emit(AudioChunk::new(full));
            }
        }
    }

    /// Samples waiting for the current chunk to fill
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

fn u16_to_i16(sample: u16) -> i16 {
    (i32::from(sample) - 32_768) as i16
}

/// Input device names, in the order used by `--audio-device`
pub fn list_input_devices() -> Result<Vec<String>, AudioError> {
    let host = cpal::default_host();
    Ok(host
        .input_devices()?
        .map(|d| d.name().unwrap_or_else(|_| "Unknown Device".to_string()))
        .collect())
}

fn select_device(host: &cpal::Host, index: Option<usize>) -> Result<cpal::Device, AudioError> {
    match index {
        Some(index) => host
            .input_devices()?
            .nth(index)
            .ok_or(AudioError::DeviceIndex(index)),
        None => host
            .default_input_device()
            .ok_or(AudioError::NoDefaultDevice),
    }
}

fn build_stream<T, F>(
    device: &cpal::Device,
    config: &StreamConfig,
    chunk_samples: usize,
    buffer: Arc<RetentionBuffer>,
    convert: F,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    F: Fn(T) -> i16 + Send + 'static,
{
    let mut assembler = ChunkAssembler::new(chunk_samples);
    let mut scratch: Vec<i16> = Vec::with_capacity(chunk_samples);
    let err_fn = |err| warn!(error = %err, "audio stream error");

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| convert(s)));
            assembler.push(&scratch, |chunk| buffer.ingest(chunk));
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

fn open_stream(
    format: AudioFormat,
    device_index: Option<usize>,
    buffer: Arc<RetentionBuffer>,
) -> Result<(cpal::Stream, String), AudioError> {
    let host = cpal::default_host();
    let device = select_device(&host, device_index)?;
    let name = device
        .name()
        .unwrap_or_else(|_| "unknown input device".to_string());
    let sample_format = device.default_input_config()?.sample_format();

    let config = StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let chunk_samples = format.chunk_samples();

    debug!(
        device = %name,
        ?sample_format,
        sample_rate = format.sample_rate,
        channels = format.channels,
        "opening input stream"
    );

    let stream = match sample_format {
        SampleFormat::I16 => build_stream(&device, &config, chunk_samples, buffer, |s: i16| s)?,
        SampleFormat::F32 => build_stream(&device, &config, chunk_samples, buffer, f32_to_i16)?,
        SampleFormat::U16 => build_stream(&device, &config, chunk_samples, buffer, u16_to_i16)?,
        other => return Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
    };
    stream.play()?;
    Ok((stream, name))
}

/// Running audio ingestion; stops and releases the device on drop
pub struct AudioIngest {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl AudioIngest {
    /// Open the input device and start feeding `buffer`
    ///
    /// Returns once the stream is playing, or with the error that kept it
    /// from starting.
    pub fn start(
        format: AudioFormat,
        device_index: Option<usize>,
        buffer: Arc<RetentionBuffer>,
    ) -> Result<Self, AudioError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<String, AudioError>>();

        let handle = thread::Builder::new()
            .name("audio-ingest".to_string())
            .spawn(move || match open_stream(format, device_index, buffer) {
                Ok((stream, name)) => {
                    let _ = ready_tx.send(Ok(name));
                    // Blocks until stop() or the sender is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("audio input stream closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AudioError::ThreadSpawn(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(device_name)) => {
                info!(device = %device_name, "audio ingestion started");
                Ok(Self {
                    stop_tx: Some(stop_tx),
                    handle: Some(handle),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::ThreadExited)
            }
        }
    }

    /// Stop the stream and wait for the thread to release the device
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("audio ingest thread panicked");
            }
            info!("audio ingestion stopped");
        }
    }
}

impl Drop for AudioIngest {
    fn drop(&mut self) {
        self.shutdown();
    }
}
