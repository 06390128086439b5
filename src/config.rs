//! Configuration loading and management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser};

use crate::audio::AudioFormat;
use crate::capture::CaptureConfig;
use crate::link::{RetryPolicy, SessionConfig};

/// Read timeout that delimits frames on the wire
pub const FRAME_TIMEOUT: Duration = Duration::from_millis(100);

/// Command-line options
#[derive(Debug, Parser, Clone)]
#[command(
    about = "Sound level meter logger with threshold-triggered audio capture",
    version
)]
pub struct Cli {
    /// Serial device the meter is attached to
    #[arg(short = 'd', long, default_value = "/dev/ttyUSB0")]
    pub device: String,

    /// Directory for reading logs, clips and the capture journal
    #[arg(short = 'f', long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Record audio clips around loud readings
    #[arg(short = 's', long, action = ArgAction::Set, default_value_t = true)]
    pub save_audio: bool,

    /// Readings above this level (dB) trigger a capture
    #[arg(short = 'l', long, default_value_t = 80.0)]
    pub level_threshold: f64,

    /// Input device index (see --list-audio-devices); default device if unset
    #[arg(short = 'i', long)]
    pub audio_device: Option<usize>,

    /// Seconds of audio kept before the trigger and after the last trigger
    #[arg(long, default_value_t = 3)]
    pub capture_secs: u64,

    /// Maximum seconds buffered while a capture is extended
    #[arg(long, default_value_t = 60)]
    pub capture_limit_secs: u64,

    /// Capture sample rate in Hz
    #[arg(long, default_value_t = 44_100)]
    pub sample_rate: u32,

    /// Capture channel count
    #[arg(long, default_value_t = 1)]
    pub channels: u16,

    /// Frames per audio chunk
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Serial baud rate
    #[arg(long, default_value_t = 2400)]
    pub baud: u32,

    /// Attempts to open the serial port before giving up
    #[arg(long, default_value_t = 100)]
    pub open_retries: u32,

    /// Print audio input devices and exit
    #[arg(long, default_value_t = false)]
    pub list_audio_devices: bool,
}

/// Configuration values rejected at startup
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("level threshold must be a finite number, got {0}")]
    Threshold(f64),

    #[error("capture limit ({limit}s) must be at least the capture duration ({duration}s)")]
    LimitBelowDuration { limit: u64, duration: u64 },
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Serial device path
    pub device: String,

    /// Directory for all output files
    pub data_dir: PathBuf,

    pub save_audio: bool,
    pub level_threshold: f64,
    pub audio_device: Option<usize>,
    pub capture_duration: Duration,
    pub capture_limit: Duration,
    pub audio: AudioFormat,
    pub baud: u32,
    pub open_retries: u32,
    pub list_audio_devices: bool,
}

impl Config {
    /// Load configuration from the command line
    pub fn load() -> Result<Self> {
        let config = Self::from_cli(Cli::parse())?;
        Ok(config)
    }

    /// Validate parsed options
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.capture_secs == 0 {
            return Err(ConfigError::Zero("capture duration"));
        }
        if cli.capture_limit_secs == 0 {
            return Err(ConfigError::Zero("capture limit"));
        }
        if cli.sample_rate == 0 {
            return Err(ConfigError::Zero("sample rate"));
        }
        if cli.channels == 0 {
            return Err(ConfigError::Zero("channel count"));
        }
        if cli.chunk_frames == 0 {
            return Err(ConfigError::Zero("chunk size"));
        }
        if cli.baud == 0 {
            return Err(ConfigError::Zero("baud rate"));
        }
        if cli.open_retries == 0 {
            return Err(ConfigError::Zero("open retries"));
        }
        if !cli.level_threshold.is_finite() {
            return Err(ConfigError::Threshold(cli.level_threshold));
        }
        if cli.capture_limit_secs < cli.capture_secs {
            return Err(ConfigError::LimitBelowDuration {
                limit: cli.capture_limit_secs,
                duration: cli.capture_secs,
            });
        }

        Ok(Self {
            device: cli.device,
            data_dir: cli.data_dir,
            save_audio: cli.save_audio,
            level_threshold: cli.level_threshold,
            audio_device: cli.audio_device,
            capture_duration: Duration::from_secs(cli.capture_secs),
            capture_limit: Duration::from_secs(cli.capture_limit_secs),
            audio: AudioFormat {
                sample_rate: cli.sample_rate,
                channels: cli.channels,
                chunk_frames: cli.chunk_frames,
            },
            baud: cli.baud,
            open_retries: cli.open_retries,
            list_audio_devices: cli.list_audio_devices,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            retry: RetryPolicy {
                max_attempts: self.open_retries,
                ..RetryPolicy::default()
            },
            ..SessionConfig::default()
        }
    }

    pub fn capture(&self) -> CaptureConfig {
        CaptureConfig {
            threshold_db: self.level_threshold,
            duration: self.capture_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let mut argv = vec!["soundlog-daemon"];
        argv.extend_from_slice(args);
        Config::from_cli(Cli::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.device, "/dev/ttyUSB0");
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert!(config.save_audio);
        assert_eq!(config.level_threshold, 80.0);
        assert_eq!(config.audio_device, None);
        assert_eq!(config.capture_duration, Duration::from_secs(3));
        assert_eq!(config.capture_limit, Duration::from_secs(60));
        assert_eq!(config.audio, AudioFormat::default());
        assert_eq!(config.baud, 2400);
        assert_eq!(config.session().retry.max_attempts, 100);
        assert_eq!(config.session().retry.delay, Duration::from_secs(5));
    }

    #[test]
    fn test_short_flags() {
        let config = parse(&["-d", "/dev/ttyS1", "-f", "/tmp/out", "-s", "false", "-l", "72.5", "-i", "2"]).unwrap();
        assert_eq!(config.device, "/dev/ttyS1");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/out"));
        assert!(!config.save_audio);
        assert_eq!(config.capture().threshold_db, 72.5);
        assert_eq!(config.audio_device, Some(2));
    }

    #[test]
    fn test_rejects_zero_values() {
        assert_eq!(
            parse(&["--capture-secs", "0"]).unwrap_err(),
            ConfigError::Zero("capture duration")
        );
        assert_eq!(parse(&["--channels", "0"]).unwrap_err(), ConfigError::Zero("channel count"));
        assert_eq!(parse(&["--chunk-frames", "0"]).unwrap_err(), ConfigError::Zero("chunk size"));
        assert_eq!(parse(&["--sample-rate", "0"]).unwrap_err(), ConfigError::Zero("sample rate"));
    }

    #[test]
    fn test_rejects_limit_below_duration() {
        assert_eq!(
            parse(&["--capture-secs", "10", "--capture-limit-secs", "5"]).unwrap_err(),
            ConfigError::LimitBelowDuration { limit: 5, duration: 10 }
        );
        assert!(parse(&["--capture-secs", "10", "--capture-limit-secs", "10"]).is_ok());
    }

    #[test]
    fn test_ensure_dirs_creates_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let config = parse(&["-f", nested.to_str().unwrap()]).unwrap();
        config.ensure_dirs().unwrap();
        assert!(nested.is_dir());
    }
}
