//! Capture controller state machine
//!
//! Handles transitions between Idle, Pending and Saving based on decoded
//! readings, one re-armable deadline, and clip write completion. All capture
//! state lives in this actor; other tasks only talk to it through the
//! reading channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::{AudioChunk, RetentionBuffer};
use crate::events::CaptureEvent;
use crate::protocol::Reading;
use crate::sinks::{ClipSink, SinkError};

use super::deadline::Deadline;

type WriteHandle = JoinHandle<Result<PathBuf, SinkError>>;

/// Trigger settings, fixed for the process lifetime
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Readings strictly above this level trigger a capture
    pub threshold_db: f64,
    /// Audio kept before the trigger and recorded after the last trigger
    pub duration: Duration,
}

/// The three states of the capture controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No capture in progress
    Idle,
    /// Deadline armed, waiting for it to fall due
    Pending,
    /// A clip write is in flight
    Saving {
        /// Chunks in the clip being written
        chunks: usize,
        /// A loud reading re-armed the deadline during this write
        rearmed: bool,
    },
}

impl CaptureState {
    pub fn is_saving(&self) -> bool {
        matches!(self, CaptureState::Saving { .. })
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureState::Idle => write!(f, "Idle"),
            CaptureState::Pending => write!(f, "Pending"),
            CaptureState::Saving { .. } => write!(f, "Saving"),
        }
    }
}

/// The controller that turns loud readings into saved clips
pub struct CaptureController {
    config: CaptureConfig,
    state: CaptureState,
    buffer: Arc<RetentionBuffer>,
    sink: Arc<dyn ClipSink>,
    /// Channel for emitting capture events
    event_tx: broadcast::Sender<CaptureEvent>,
}

impl CaptureController {
    /// Create a new controller in the Idle state
    pub fn new(
        config: CaptureConfig,
        buffer: Arc<RetentionBuffer>,
        sink: Arc<dyn ClipSink>,
        event_tx: broadcast::Sender<CaptureEvent>,
    ) -> Self {
        Self {
            config,
            state: CaptureState::Idle,
            buffer,
            sink,
            event_tx,
        }
    }

    /// Get the current state
    #[cfg(test)]
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Run the controller until the reading channel closes
    ///
    /// On close, an in-flight write is awaited and a pending capture is
    /// saved right away.
    pub async fn run(mut self, mut readings: mpsc::Receiver<Reading>) {
        info!(
            threshold_db = self.config.threshold_db,
            duration_ms = self.config.duration.as_millis() as u64,
            "capture controller started in Idle state"
        );

        let mut deadline = Deadline::new();
        let mut write: Option<WriteHandle> = None;

        loop {
            tokio::select! {
                maybe = readings.recv() => match maybe {
                    Some(reading) => {
                        if let Some(at) = self.on_reading(&reading, Instant::now()) {
                            deadline.arm(at);
                        }
                    }
                    None => break,
                },

                // Held back while saving so a re-armed deadline waits for the write
                () = deadline.fired(), if deadline.is_armed() && !self.state.is_saving() => {
                    if let Some(chunks) = self.on_deadline() {
                        write = Some(self.spawn_write(chunks));
                    }
                }

                outcome = join_write(&mut write), if write.is_some() => {
                    write = None;
                    self.on_write_finished(outcome);
                }
            }
        }

        if let Some(handle) = write.as_mut() {
            debug!("waiting for in-flight clip write");
            let outcome = join_handle(handle).await;
            self.on_write_finished(outcome);
        }

        if deadline.is_armed() {
            deadline.disarm();
            info!("saving pending capture before shutdown");
            if let Some(chunks) = self.on_deadline() {
                let mut handle = self.spawn_write(chunks);
                let outcome = join_handle(&mut handle).await;
                self.on_write_finished(outcome);
            }
        }

        info!("capture controller stopped");
    }

    /// Handle one reading; returns the deadline to arm if it was loud
    fn on_reading(&mut self, reading: &Reading, now: Instant) -> Option<Instant> {
        if !reading.exceeds(self.config.threshold_db) {
            return None;
        }
        let level_db = reading.value.map(|level| level.as_db())?;

        let deadline = now + self.config.duration;
        let deadline_in_ms = self.config.duration.as_millis() as u64;

        let event = match self.state {
            CaptureState::Idle => {
                self.buffer.set_capture_active(true);
                self.transition_to(CaptureState::Pending);
                CaptureEvent::CaptureTriggered {
                    level_db,
                    deadline_in_ms,
                }
            }
            CaptureState::Pending => CaptureEvent::CaptureExtended {
                level_db,
                deadline_in_ms,
                while_saving: false,
            },
            CaptureState::Saving { chunks, rearmed } => {
                if !rearmed {
                    // The write in flight owns its snapshot; the next clip
                    // starts from the retention window before this reading
                    self.buffer.trim_to_window();
                }
                self.state = CaptureState::Saving {
                    chunks,
                    rearmed: true,
                };
                CaptureEvent::CaptureExtended {
                    level_db,
                    deadline_in_ms,
                    while_saving: true,
                }
            }
        };

        info!(level_db, "loud sound");
        self.emit(event);
        Some(deadline)
    }

    /// Handle the deadline falling due; returns the snapshot to write
    fn on_deadline(&mut self) -> Option<Vec<AudioChunk>> {
        match self.state {
            CaptureState::Saving { .. } => {
                debug!("deadline reached while saving, ignored");
                None
            }
            CaptureState::Idle => {
                debug!("deadline reached while idle, ignored");
                None
            }
            CaptureState::Pending => {
                let chunks = self.buffer.snapshot();
                self.transition_to(CaptureState::Saving {
                    chunks: chunks.len(),
                    rearmed: false,
                });
                self.emit(CaptureEvent::SaveStarted {
                    chunks: chunks.len(),
                });
                Some(chunks)
            }
        }
    }

    /// Handle a finished clip write, successful or not
    fn on_write_finished(&mut self, outcome: Result<PathBuf, String>) {
        let CaptureState::Saving { chunks, rearmed } = self.state else {
            warn!(state = %self.state, "clip write finished outside Saving");
            return;
        };

        match outcome {
            Ok(path) => {
                info!(path = %path.display(), chunks, "audio file saved");
                self.emit(CaptureEvent::ClipSaved {
                    path: path.display().to_string(),
                    chunks,
                });
            }
            Err(error) => {
                warn!(%error, "failed to save audio clip");
                self.emit(CaptureEvent::ClipFailed { error });
            }
        }

        if rearmed {
            self.transition_to(CaptureState::Pending);
        } else {
            self.buffer.set_capture_active(false);
            self.transition_to(CaptureState::Idle);
        }
    }

    fn spawn_write(&self, chunks: Vec<AudioChunk>) -> WriteHandle {
        let sink = Arc::clone(&self.sink);
        let format = self.buffer.format();
        tokio::task::spawn_blocking(move || sink.write_clip(&chunks, &format))
    }

    fn transition_to(&mut self, new_state: CaptureState) {
        debug!(from = %self.state, to = %new_state, "capture state transition");
        self.state = new_state;
    }

    fn emit(&self, event: CaptureEvent) {
        debug!(?event, "emitting capture event");
        let _ = self.event_tx.send(event);
    }
}

async fn join_handle(handle: &mut WriteHandle) -> Result<PathBuf, String> {
    match handle.await {
        Ok(Ok(path)) => Ok(path),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("clip writer task failed: {e}")),
    }
}

async fn join_write(write: &mut Option<WriteHandle>) -> Result<PathBuf, String> {
    match write {
        Some(handle) => join_handle(handle).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::protocol::{decode_control_byte, Level};
    use std::sync::Mutex;
    use tokio::sync::broadcast::error::TryRecvError;

    pub(crate) const D: Duration = Duration::from_secs(3);

    /// Clip sink that records writes and can hold the first one open
    pub(crate) struct MockClipSink {
        pub(crate) writes: Mutex<Vec<Vec<AudioChunk>>>,
        gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
        fail: bool,
    }

    impl MockClipSink {
        pub(crate) fn new() -> Self {
            Self {
                writes: Mutex::new(Vec::new()),
                gate: Mutex::new(None),
                fail: false,
            }
        }

        fn gated() -> (Self, std::sync::mpsc::Sender<()>) {
            let (tx, rx) = std::sync::mpsc::channel();
            let sink = Self {
                gate: Mutex::new(Some(rx)),
                ..Self::new()
            };
            (sink, tx)
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        pub(crate) fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    impl ClipSink for MockClipSink {
        fn write_clip(&self, chunks: &[AudioChunk], _format: &AudioFormat) -> Result<PathBuf, SinkError> {
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.recv();
            }
            self.writes.lock().unwrap().push(chunks.to_vec());
            if self.fail {
                return Err(SinkError::EmptyClip);
            }
            Ok(PathBuf::from(format!("clip_{}.wav", self.write_count())))
        }
    }

    pub(crate) fn test_format() -> AudioFormat {
        AudioFormat {
            sample_rate: 1_000,
            channels: 1,
            chunk_frames: 100,
        }
    }

    pub(crate) fn test_buffer() -> Arc<RetentionBuffer> {
        let buffer = Arc::new(RetentionBuffer::new(test_format(), D, Duration::from_secs(60)));
        for i in 0..40 {
            buffer.ingest(AudioChunk::new(vec![i; 100]));
        }
        buffer
    }

    pub(crate) fn reading(tenths: Option<u16>) -> Reading {
        let control = decode_control_byte(0x10);
        Reading {
            timestamp: chrono::Local::now(),
            value: tenths.map(Level::from_tenths),
            mode: control.describe(),
            control,
        }
    }

    fn loud() -> Reading {
        reading(Some(850))
    }

    fn config() -> CaptureConfig {
        CaptureConfig {
            threshold_db: 80.0,
            duration: D,
        }
    }

    struct Harness {
        tx: mpsc::Sender<Reading>,
        events: broadcast::Receiver<CaptureEvent>,
        sink: Arc<MockClipSink>,
        buffer: Arc<RetentionBuffer>,
        task: JoinHandle<()>,
    }

    fn spawn_controller(sink: MockClipSink) -> Harness {
        let sink = Arc::new(sink);
        let buffer = test_buffer();
        let (event_tx, events) = broadcast::channel(64);
        let (tx, rx) = mpsc::channel(16);
        let controller = CaptureController::new(
            config(),
            Arc::clone(&buffer),
            Arc::clone(&sink) as Arc<dyn ClipSink>,
            event_tx,
        );
        let task = tokio::spawn(controller.run(rx));
        Harness {
            tx,
            events,
            sink,
            buffer,
            task,
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<CaptureEvent>) -> CaptureEvent {
        events.recv().await.unwrap()
    }

    fn assert_close(elapsed: Duration, expected: Duration) {
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    fn controller_with(sink: Arc<dyn ClipSink>) -> CaptureController {
        let (event_tx, _) = broadcast::channel(16);
        CaptureController::new(config(), test_buffer(), sink, event_tx)
    }

    #[test]
    fn test_initial_state() {
        let controller = controller_with(Arc::new(MockClipSink::new()));
        assert_eq!(controller.state(), CaptureState::Idle);
    }

    #[test]
    fn test_quiet_and_absent_readings_are_ignored() {
        let mut controller = controller_with(Arc::new(MockClipSink::new()));
        let now = Instant::now();
        assert_eq!(controller.on_reading(&reading(Some(800)), now), None);
        assert_eq!(controller.on_reading(&reading(Some(400)), now), None);
        assert_eq!(controller.on_reading(&reading(None), now), None);
        assert_eq!(controller.state(), CaptureState::Idle);
        assert!(!controller.buffer.is_capture_active());
    }

    #[test]
    fn test_loud_reading_moves_idle_to_pending() {
        let mut controller = controller_with(Arc::new(MockClipSink::new()));
        let now = Instant::now();
        assert_eq!(controller.on_reading(&reading(Some(801)), now), Some(now + D));
        assert_eq!(controller.state(), CaptureState::Pending);
        assert!(controller.buffer.is_capture_active());
    }

    #[test]
    fn test_deadline_while_saving_is_noop() {
        let mut controller = controller_with(Arc::new(MockClipSink::new()));
        controller.on_reading(&loud(), Instant::now());
        assert!(controller.on_deadline().is_some());
        assert!(controller.state().is_saving());
        assert!(controller.on_deadline().is_none());
    }

    #[test]
    fn test_retrigger_while_saving_returns_to_pending() {
        let mut controller = controller_with(Arc::new(MockClipSink::new()));
        controller.on_reading(&loud(), Instant::now());
        controller.on_deadline();
        assert!(controller.on_reading(&loud(), Instant::now()).is_some());

        controller.on_write_finished(Ok(PathBuf::from("a.wav")));
        assert_eq!(controller.state(), CaptureState::Pending);
        assert!(controller.buffer.is_capture_active());
    }

    #[test]
    fn test_failed_write_still_returns_to_idle() {
        let mut controller = controller_with(Arc::new(MockClipSink::new()));
        controller.on_reading(&loud(), Instant::now());
        controller.on_deadline();
        controller.on_write_finished(Err("disk full".to_string()));
        assert_eq!(controller.state(), CaptureState::Idle);
        assert!(!controller.buffer.is_capture_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trigger_saves_once_after_duration() {
        let mut h = spawn_controller(MockClipSink::new());
        let start = Instant::now();

        h.tx.send(loud()).await.unwrap();
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::CaptureTriggered { .. }));

        // Audio keeps arriving while the capture is pending
        for i in 0..5 {
            h.buffer.ingest(AudioChunk::new(vec![100 + i; 100]));
        }

        let event = next_event(&mut h.events).await;
        assert_close(Instant::now() - start, D);
        assert_eq!(event, CaptureEvent::SaveStarted { chunks: 35 });
        assert!(matches!(
            next_event(&mut h.events).await,
            CaptureEvent::ClipSaved { chunks: 35, .. }
        ));

        drop(h.tx);
        h.task.await.unwrap();
        assert_eq!(h.sink.write_count(), 1);
        assert!(!h.buffer.is_capture_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrigger_extends_deadline_into_one_clip() {
        let mut h = spawn_controller(MockClipSink::new());
        let start = Instant::now();

        h.tx.send(loud()).await.unwrap();
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::CaptureTriggered { .. }));

        tokio::time::advance(D / 2).await;
        h.tx.send(loud()).await.unwrap();
        assert!(matches!(
            next_event(&mut h.events).await,
            CaptureEvent::CaptureExtended { while_saving: false, .. }
        ));

        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::SaveStarted { .. }));
        assert_close(Instant::now() - start, D + D / 2);
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::ClipSaved { .. }));
        assert_eq!(h.events.try_recv(), Err(TryRecvError::Empty));

        drop(h.tx);
        h.task.await.unwrap();
        assert_eq!(h.sink.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_while_saving_waits_for_write() {
        let (sink, release) = MockClipSink::gated();
        let mut h = spawn_controller(sink);

        h.tx.send(loud()).await.unwrap();
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::CaptureTriggered { .. }));
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::SaveStarted { .. }));

        // First write is now blocked inside the sink
        h.tx.send(loud()).await.unwrap();
        assert!(matches!(
            next_event(&mut h.events).await,
            CaptureEvent::CaptureExtended { while_saving: true, .. }
        ));

        // Re-armed deadline passes while the write is still running
        tokio::time::advance(D * 2).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.events.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(h.sink.write_count(), 0);

        release.send(()).unwrap();
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::ClipSaved { .. }));
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::SaveStarted { .. }));
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::ClipSaved { .. }));

        drop(h.tx);
        h.task.await.unwrap();
        assert_eq!(h.sink.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_on_clip_does_not_repeat_previous_clip() {
        let (sink, release) = MockClipSink::gated();
        let mut h = spawn_controller(sink);

        h.tx.send(loud()).await.unwrap();
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::CaptureTriggered { .. }));
        assert_eq!(next_event(&mut h.events).await, CaptureEvent::SaveStarted { chunks: 30 });

        // Audio keeps arriving while the first clip is being written
        for i in 40..60 {
            h.buffer.ingest(AudioChunk::new(vec![i; 100]));
        }
        h.tx.send(loud()).await.unwrap();
        assert!(matches!(
            next_event(&mut h.events).await,
            CaptureEvent::CaptureExtended { while_saving: true, .. }
        ));

        release.send(()).unwrap();
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::ClipSaved { .. }));
        assert_eq!(next_event(&mut h.events).await, CaptureEvent::SaveStarted { chunks: 30 });
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::ClipSaved { .. }));

        drop(h.tx);
        h.task.await.unwrap();

        let writes = h.sink.writes.lock().unwrap();
        let tags = |clip: &[AudioChunk]| clip.iter().map(|c| c.samples()[0]).collect::<Vec<i16>>();
        assert_eq!(tags(&writes[0][..]), (10..40).collect::<Vec<_>>());
        // Window before the retrigger only: nothing older than the first clip's tail minus D
        assert_eq!(tags(&writes[1][..]), (30..60).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_separated_events_produce_separate_clips() {
        let mut h = spawn_controller(MockClipSink::new());

        for _ in 0..2 {
            h.tx.send(loud()).await.unwrap();
            assert!(matches!(next_event(&mut h.events).await, CaptureEvent::CaptureTriggered { .. }));
            assert!(matches!(next_event(&mut h.events).await, CaptureEvent::SaveStarted { .. }));
            assert!(matches!(next_event(&mut h.events).await, CaptureEvent::ClipSaved { .. }));

            // Quiet for longer than the capture duration
            tokio::time::advance(D * 2).await;
            h.tx.send(reading(Some(500))).await.unwrap();
        }

        drop(h.tx);
        h.task.await.unwrap();
        assert_eq!(h.sink.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_returns_to_idle() {
        let mut h = spawn_controller(MockClipSink::failing());

        h.tx.send(loud()).await.unwrap();
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::CaptureTriggered { .. }));
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::SaveStarted { .. }));
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::ClipFailed { .. }));

        // A later trigger starts a fresh capture
        h.tx.send(loud()).await.unwrap();
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::CaptureTriggered { .. }));

        drop(h.tx);
        h.task.await.unwrap();
        assert_eq!(h.sink.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_capture_is_saved_on_shutdown() {
        let mut h = spawn_controller(MockClipSink::new());
        let start = Instant::now();

        h.tx.send(loud()).await.unwrap();
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::CaptureTriggered { .. }));
        drop(h.tx);
        h.task.await.unwrap();

        assert!(Instant::now() - start < D);
        assert_eq!(h.sink.write_count(), 1);
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::SaveStarted { .. }));
        assert!(matches!(next_event(&mut h.events).await, CaptureEvent::ClipSaved { .. }));
    }
}
