//! soundlog-daemon: Sound level meter logger with triggered audio capture
//!
//! This daemon talks to a serial sound level meter and provides:
//! - Heartbeat-driven frame acquisition with checksum validation
//! - A CSV log of every decoded reading
//! - Audio clips around loud events, reaching back into a rolling buffer
//!
//! The serial link runs on a blocking worker, the microphone on its own
//! thread, and the capture controller as a single async actor.

mod audio;
mod capture;
mod config;
mod events;
mod lifecycle;
mod link;
mod protocol;
mod sinks;


use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::audio::{list_input_devices, AudioIngest, RetentionBuffer};
use crate::capture::CaptureController;
use crate::config::{Config, FRAME_TIMEOUT};
use crate::events::CaptureEvent;
use crate::lifecycle::ShutdownSignal;
use crate::link::{LinkSession, SerialOpener};
use crate::protocol::Reading;
use crate::sinks::{CsvReadingLog, EventJournal, WavClipWriter};

/// Readings queued for the capture controller before the link blocks
const READING_CHANNEL_CAPACITY: usize = 64;

/// Running capture pipeline: microphone thread plus controller task
struct Capture {
    ingest: AudioIngest,
    controller: JoinHandle<()>,
    journal: JoinHandle<()>,
}

impl Capture {
    fn start(config: &Config) -> Result<(Self, mpsc::Sender<Reading>)> {
        let buffer = Arc::new(RetentionBuffer::new(
            config.audio,
            config.capture_duration,
            config.capture_limit,
        ));

        // Device open failure at startup is fatal
        let ingest = AudioIngest::start(config.audio, config.audio_device, Arc::clone(&buffer))?;

        let (event_tx, event_rx) = broadcast::channel::<CaptureEvent>(64);
        let journal = spawn_journal(&config.data_dir, event_rx)?;

        let (readings_tx, readings_rx) = mpsc::channel(READING_CHANNEL_CAPACITY);
        let controller = CaptureController::new(
            config.capture(),
            buffer,
            Arc::new(WavClipWriter::new(&config.data_dir)),
            event_tx,
        );
        let controller = tokio::spawn(controller.run(readings_rx));

        Ok((
            Self {
                ingest,
                controller,
                journal,
            },
            readings_tx,
        ))
    }

    /// Wait for the controller to flush, then release the input device
    async fn finish(self) {
        if let Err(e) = self.controller.await {
            error!(?e, "capture controller task failed");
        }
        self.ingest.stop();
        if let Err(e) = self.journal.await {
            error!(?e, "capture journal task failed");
        }
    }
}

fn spawn_journal(
    dir: &Path,
    mut events: broadcast::Receiver<CaptureEvent>,
) -> Result<JoinHandle<()>> {
    let mut journal = EventJournal::create(dir)?;
    info!(path = %journal.path().display(), "capture journal opened");

    Ok(tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    info!(%event, "capture event");
                    if let Err(e) = journal.append(&event) {
                        warn!(error = %e, "failed to write capture journal");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "capture event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load()?;

    if config.list_audio_devices {
        for (index, name) in list_input_devices()?.iter().enumerate() {
            println!("{index}: {name}");
        }
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "soundlog-daemon starting"
    );

    config.ensure_dirs()?;
    info!(
        device = %config.device,
        data_dir = %config.data_dir.display(),
        threshold_db = config.level_threshold,
        save_audio = config.save_audio,
        "configuration loaded"
    );

    // Create shutdown signal handler
    let mut shutdown = ShutdownSignal::new();
    let running = Arc::new(AtomicBool::new(true));

    let (capture, readings_tx) = if config.save_audio {
        let (capture, tx) = Capture::start(&config)?;
        (Some(capture), Some(tx))
    } else {
        info!("audio capture disabled");
        (None, None)
    };

    let mut log = CsvReadingLog::create(&config.data_dir)?;
    info!(path = %log.path().display(), "reading log opened");
    let session = LinkSession::new(
        SerialOpener::new(&config.device, config.baud, FRAME_TIMEOUT),
        config.session(),
        Arc::clone(&running),
    );
    let mut link_task = tokio::task::spawn_blocking(move || session.run(&mut log, readings_tx));

    info!("daemon initialized, entering main loop");

    let link_result = tokio::select! {
        result = &mut link_task => result,
        _ = shutdown.wait() => {
            info!("shutdown signal received");
            running.store(false, Ordering::SeqCst);
            link_task.await
        }
    };

    // Cleanup
    info!("shutting down...");
    running.store(false, Ordering::SeqCst);

    // The link dropped its reading sender, so the controller flushes and exits
    if let Some(capture) = capture {
        capture.finish().await;
    }

    let outcome = match link_result {
        Ok(Ok(stats)) => {
            info!(?stats, "serial link closed");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "serial link failed");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("link task failed: {e}")),
    };

    info!("soundlog-daemon stopped");
    outcome
}
