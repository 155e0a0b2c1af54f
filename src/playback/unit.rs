//! One participant's media and its arm/trigger state machine
//!
//! ```text
//! Unprepared ──prepare──▶ Ready ──arm──▶ Armed ──trigger──▶ Playing
//!     │  ▲                                                      │
//!     ▼  │ prepare                                              ▼
//!   Failed                        stop() from any state ──▶ Stopped
//! ```
//!
//! The armed instant lives inside the `Armed` variant, so a unit that is not
//! ready cannot hold one and leaving `Armed` consumes it.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::{AudioBuffer, AudioOutput};
use crate::clock::{as_ms, signed_ms, Clock, LoopHandle, TimerResolutionGuard};
use crate::error::{AudioError, PrepareError, SyncError};
use crate::media::{MediaBackend, MediaInfo, VideoSource};

/// Externally visible state of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Unprepared,
    Failed,
    Ready,
    Armed,
    Playing,
    Stopped,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitStatus::Unprepared => "unprepared",
            UnitStatus::Failed => "failed",
            UnitStatus::Ready => "ready",
            UnitStatus::Armed => "armed",
            UnitStatus::Playing => "playing",
            UnitStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
struct PreparedMedia {
    /// Decoder, shared with the main-loop start callback
    video: Arc<Mutex<Box<dyn VideoSource>>>,
    /// Samples at the output's rate, shared with the audio thread
    audio: Arc<AudioBuffer>,
    output: Arc<dyn AudioOutput>,
    info: MediaInfo,
}

enum UnitState {
    Unprepared,
    Failed { reason: String },
    Ready(PreparedMedia),
    Armed { media: PreparedMedia, at: Instant },
    Playing { media: PreparedMedia, target: Instant },
    Stopped,
}

impl UnitState {
    fn status(&self) -> UnitStatus {
        match self {
            UnitState::Unprepared => UnitStatus::Unprepared,
            UnitState::Failed { .. } => UnitStatus::Failed,
            UnitState::Ready(_) => UnitStatus::Ready,
            UnitState::Armed { .. } => UnitStatus::Armed,
            UnitState::Playing { .. } => UnitStatus::Playing,
            UnitState::Stopped => UnitStatus::Stopped,
        }
    }
}

/// Start instants written by the video callback and the audio thread
#[derive(Debug, Default)]
pub(crate) struct StartTimes {
    /// Set by the main-loop video callback
    video: Mutex<Option<Instant>>,
    /// Set by the audio thread right after the device starts
    audio: Mutex<Option<Instant>>,
}

/// Handle to a triggered unit's start instants
#[derive(Debug, Clone)]
pub struct StartTicket {
    /// Instant the unit was armed for
    target: Instant,
    starts: Arc<StartTimes>,
}

impl StartTicket {
    pub fn target(&self) -> Instant {
        self.target
    }

    pub fn video_start(&self) -> Option<Instant> {
        *self.starts.video.lock()
    }

    pub fn audio_start(&self) -> Option<Instant> {
        *self.starts.audio.lock()
    }

    /// Poll until the video start is recorded or `timeout` elapses.
    ///
    /// The video command runs on the main loop, so this must not be called
    /// from the thread that drives it.
    pub fn wait_video_start(&self, timeout: Duration) -> Option<Instant> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(at) = self.video_start() {
                return Some(at);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Everything needed to start a unit after it left `Armed`
#[derive(Clone)]
pub(crate) struct Launch {
    /// Unit label, used for the audio thread name and logs
    label: Arc<str>,
    /// Decoder the video callback starts
    video: Arc<Mutex<Box<dyn VideoSource>>>,
    /// Samples handed to the audio thread
    audio: Arc<AudioBuffer>,
    /// Device the audio thread plays on
    output: Arc<dyn AudioOutput>,
    /// Where both start instants are recorded
    starts: Arc<StartTimes>,
    /// Set by `stop()`; checked before each start command
    cancel: Arc<AtomicBool>,
    /// Armed instant this launch was taken from
    target: Instant,
}

impl Launch {
    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn target(&self) -> Instant {
        self.target
    }

    /// Issue the video start command. Runs on the main loop and never waits.
    pub(crate) fn start_video(&self, clock: &Clock) {
        if self.cancel.load(Ordering::Relaxed) {
            return;
        }
        let now = clock.now();
        self.video.lock().start(now);
        *self.starts.video.lock() = Some(now);
    }

    /// Spawn the detached audio thread that waits for the target itself
    pub(crate) fn spawn_audio(&self, clock: Clock) -> Result<(), SyncError> {
        let label = self.label.clone();
        let audio = self.audio.clone();
        let output = self.output.clone();
        let starts = self.starts.clone();
        let cancel = self.cancel.clone();
        let target = self.target;

        thread::Builder::new()
            .name(format!("audio-{}", label))
            .spawn(move || {
                let _resolution = TimerResolutionGuard::new();
                let mut record = |at: Instant| *starts.audio.lock() = Some(at);
                if let Err(e) = output.play_at(audio, target, &clock, &cancel, &mut record) {
                    tracing::error!("Audio playback failed for {} on {}: {}", label, output.device_id(), e);
                }
            })
            .map(|_| ())
            .map_err(|e| SyncError::Spawn(e.to_string()))
    }

    pub(crate) fn video_start(&self) -> Option<Instant> {
        *self.starts.video.lock()
    }

    pub(crate) fn audio_start(&self) -> Option<Instant> {
        *self.starts.audio.lock()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub(crate) fn ticket(&self) -> StartTicket {
        StartTicket {
            target: self.target,
            starts: self.starts.clone(),
        }
    }
}

/// One participant's video, extracted audio and output device
pub struct PlaybackUnit {
    /// Name used in logs and sync reports
    label: Arc<str>,
    /// Media file to play
    media_path: PathBuf,
    /// Output identifier, see [`crate::audio::get_output_device`]
    device_id: String,
    /// Decoder and device factory
    backend: Arc<dyn MediaBackend>,
    /// Lifecycle, holding the prepared media and armed instant
    state: UnitState,
    /// Start instants of the current trigger
    starts: Arc<StartTimes>,
    /// Shared with the audio thread and video callback
    cancel: Arc<AtomicBool>,
}

impl PlaybackUnit {
    /// Label defaults to the file stem
    pub fn new(
        media_path: impl Into<PathBuf>,
        device_id: impl Into<String>,
        backend: Arc<dyn MediaBackend>,
    ) -> Self {
        let media_path = media_path.into();
        let label: Arc<str> = media_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unit".to_string())
            .into();
        Self {
            label,
            media_path,
            device_id: device_id.into(),
            backend,
            state: UnitState::Unprepared,
            starts: Arc::new(StartTimes::default()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        let label: String = label.into();
        self.label = label.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn media_path(&self) -> &Path {
        &self.media_path
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn status(&self) -> UnitStatus {
        self.state.status()
    }

    /// Ready or further along; false after a failed preparation
    pub fn is_ready(&self) -> bool {
        matches!(
            self.state,
            UnitState::Ready(_) | UnitState::Armed { .. } | UnitState::Playing { .. }
        )
    }

    /// Reason recorded by the last failed preparation
    pub fn failure(&self) -> Option<&str> {
        match &self.state {
            UnitState::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn media_info(&self) -> Option<&MediaInfo> {
        match &self.state {
            UnitState::Ready(media)
            | UnitState::Armed { media, .. }
            | UnitState::Playing { media, .. } => Some(&media.info),
            _ => None,
        }
    }

    pub fn armed_at(&self) -> Option<Instant> {
        match self.state {
            UnitState::Armed { at, .. } => Some(at),
            _ => None,
        }
    }

    /// Instant the video start command was issued
    pub fn actual_start(&self) -> Option<Instant> {
        *self.starts.video.lock()
    }

    pub fn audio_start(&self) -> Option<Instant> {
        *self.starts.audio.lock()
    }

    /// Target of the trigger that started this unit
    pub fn target(&self) -> Option<Instant> {
        match self.state {
            UnitState::Playing { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Decode the video, extract the audio and open the output device.
    ///
    /// Failure leaves the unit `Failed` so pollers never wait on it, and can
    /// be retried.
    pub fn prepare(&mut self) -> Result<(), PrepareError> {
        match self.state {
            UnitState::Unprepared | UnitState::Failed { .. } => {}
            ref other => {
                return Err(PrepareError::AlreadyPrepared {
                    unit: self.label.to_string(),
                    status: other.status().to_string(),
                })
            }
        }

        let started = Instant::now();
        tracing::info!("Preparing {} from {}", self.label, self.media_path.display());

        match self.load() {
            Ok(media) => {
                tracing::info!(
                    "{} ready in {:.1}ms ({}x{} @ {:.2}fps, {:.2}s, {} Hz audio)",
                    self.label,
                    as_ms(started.elapsed()),
                    media.info.width,
                    media.info.height,
                    media.info.frame_rate,
                    media.info.duration.as_secs_f64(),
                    media.audio.sample_rate()
                );
                self.state = UnitState::Ready(media);
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    "Preparing {} failed after {:.1}ms: {}",
                    self.label,
                    as_ms(started.elapsed()),
                    e
                );
                self.state = UnitState::Failed {
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    fn load(&self) -> Result<PreparedMedia, PrepareError> {
        if !self.media_path.is_file() {
            return Err(PrepareError::FileNotFound(self.media_path.clone()));
        }

        let probe = self.backend.probe(&self.media_path)?;
        let info = probe.video;
        if info.duration.is_zero() {
            return Err(PrepareError::DurationUnavailable(self.media_path.clone()));
        }
        let stream = probe
            .audio
            .ok_or_else(|| PrepareError::NoAudioStream(self.media_path.clone()))?;

        // The device decides the rate audio is decoded at.
        let output = self.backend.open_output(&self.device_id)?;
        let video = self.backend.open_video(&self.media_path, &info)?;
        let audio = self.backend.extract_audio(&self.media_path, &stream, output.sample_rate())?;
        if audio.sample_rate() != output.sample_rate() {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} decoded at {} Hz, {} runs at {} Hz",
                self.media_path.display(),
                audio.sample_rate(),
                output.device_id(),
                output.sample_rate()
            ))
            .into());
        }

        Ok(PreparedMedia {
            video: Arc::new(Mutex::new(video)),
            audio: Arc::new(audio),
            output,
            info,
        })
    }

    /// Store the shared start instant. Requires `Ready`.
    pub fn arm(&mut self, at: Instant) -> Result<(), SyncError> {
        let state = std::mem::replace(&mut self.state, UnitState::Stopped);
        match state {
            UnitState::Ready(media) => {
                tracing::debug!(
                    "Armed {} for {:+.3}ms",
                    self.label,
                    signed_ms(at, Instant::now())
                );
                self.state = UnitState::Armed { media, at };
                Ok(())
            }
            other => {
                let found = other.status().to_string();
                self.state = other;
                Err(SyncError::InvalidState {
                    unit: self.label.to_string(),
                    expected: "ready",
                    found,
                })
            }
        }
    }

    /// Leave `Armed` for `Playing`, consuming the armed instant
    pub(crate) fn begin_playing(&mut self) -> Result<Launch, SyncError> {
        let state = std::mem::replace(&mut self.state, UnitState::Stopped);
        match state {
            UnitState::Armed { media, at } => {
                self.starts = Arc::new(StartTimes::default());
                let launch = Launch {
                    label: self.label.clone(),
                    video: media.video.clone(),
                    audio: media.audio.clone(),
                    output: media.output.clone(),
                    starts: self.starts.clone(),
                    cancel: self.cancel.clone(),
                    target: at,
                };
                self.state = UnitState::Playing { media, target: at };
                Ok(launch)
            }
            other => {
                let found = other.status().to_string();
                self.state = other;
                Err(SyncError::InvalidState {
                    unit: self.label.to_string(),
                    expected: "armed",
                    found,
                })
            }
        }
    }

    /// Start this unit alone at its armed instant.
    ///
    /// Audio waits on its own thread; the video command is scheduled on the
    /// main loop. Returns immediately with a ticket for the start instants.
    pub fn trigger(&mut self, handle: &LoopHandle, clock: &Clock) -> Result<StartTicket, SyncError> {
        let launch = self.begin_playing()?;
        if let Err(e) = launch.spawn_audio(*clock) {
            self.stop();
            return Err(e);
        }

        let ticket = launch.ticket();
        let clock = *clock;
        handle.schedule_at(launch.target(), move || launch.start_video(&clock));
        tracing::info!("Triggered {}", self.label);
        Ok(ticket)
    }

    /// Release the decoder and stop feeding the device. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        let state = std::mem::replace(&mut self.state, UnitState::Stopped);
        match state {
            UnitState::Ready(media)
            | UnitState::Armed { media, .. }
            | UnitState::Playing { media, .. } => {
                media.video.lock().release();
                tracing::debug!("Stopped {}", self.label);
            }
            _ => {}
        }
    }
}

impl Drop for PlaybackUnit {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for PlaybackUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackUnit")
            .field("label", &self.label)
            .field("media_path", &self.media_path)
            .field("device_id", &self.device_id)
            .field("status", &self.status())
            .finish()
    }
}

/// Prepare every unit concurrently. One failure never aborts the others.
pub fn prepare_all(units: &mut [PlaybackUnit]) -> Vec<Result<(), PrepareError>> {
    thread::scope(|scope| {
        let workers: Vec<_> = units
            .iter_mut()
            .map(|unit| {
                let label = unit.label().to_string();
                (label, scope.spawn(move || unit.prepare()))
            })
            .collect();

        workers
            .into_iter()
            .map(|(label, worker)| {
                worker
                    .join()
                    .unwrap_or_else(|_| Err(PrepareError::Panicked(label)))
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MainLoop;
    use crate::media::mock::{MockBackend, MockFailure, MOCK_RATE};

    fn media_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    fn mock() -> Arc<dyn MediaBackend> {
        Arc::new(MockBackend::new(Duration::from_millis(100)))
    }

    #[test]
    fn test_prepare_then_arm() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = PlaybackUnit::new(media_file(&dir, "p1.mp4"), "default", mock());
        assert_eq!(unit.label(), "p1");
        assert_eq!(unit.status(), UnitStatus::Unprepared);

        unit.prepare().unwrap();
        assert!(unit.is_ready());
        assert_eq!(unit.media_info().unwrap().duration, Duration::from_millis(100));

        let at = Instant::now() + Duration::from_millis(100);
        unit.arm(at).unwrap();
        assert_eq!(unit.status(), UnitStatus::Armed);
        assert_eq!(unit.armed_at(), Some(at));
    }

    #[test]
    fn test_missing_file_marks_failed() {
        let mut unit = PlaybackUnit::new("/nonexistent/clip.mp4", "default", mock());
        let err = unit.prepare().unwrap_err();
        assert!(matches!(err, PrepareError::FileNotFound(_)));
        assert_eq!(unit.status(), UnitStatus::Failed);
        assert!(!unit.is_ready());
        assert!(unit.failure().unwrap().contains("not found"));
    }

    #[test]
    fn test_backend_failure_marks_failed_and_allows_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = media_file(&dir, "p1.mp4");
        let mut unit = PlaybackUnit::new(&path, "default", Arc::new(MockBackend::failing(MockFailure::NoAudio)));
        assert!(matches!(unit.prepare(), Err(PrepareError::NoAudioStream(_))));
        assert_eq!(unit.status(), UnitStatus::Failed);

        unit.backend = mock();
        unit.prepare().unwrap();
        assert_eq!(unit.status(), UnitStatus::Ready);
        assert!(matches!(
            unit.prepare(),
            Err(PrepareError::AlreadyPrepared { .. })
        ));
    }

    #[test]
    fn test_arm_requires_ready() {
        let mut unit = PlaybackUnit::new("clip.mp4", "default", mock());
        let err = unit.arm(Instant::now()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { expected: "ready", .. }));
        assert_eq!(unit.status(), UnitStatus::Unprepared);
        assert_eq!(unit.armed_at(), None);
    }

    #[test]
    fn test_trigger_requires_armed() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = PlaybackUnit::new(media_file(&dir, "p1.mp4"), "default", mock());
        unit.prepare().unwrap();

        let main_loop = MainLoop::new(Clock::default());
        let err = unit.trigger(&main_loop.handle(), &Clock::default()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { expected: "armed", .. }));
        assert_eq!(unit.status(), UnitStatus::Ready);
    }

    #[test]
    fn test_trigger_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Clock::default();
        let mut main_loop = MainLoop::new(clock);
        let mut unit = PlaybackUnit::new(media_file(&dir, "p1.mp4"), "default", mock());
        unit.prepare().unwrap();

        let target = clock.target_after(Duration::from_millis(30));
        unit.arm(target).unwrap();
        let ticket = unit.trigger(&main_loop.handle(), &clock).unwrap();
        assert_eq!(unit.armed_at(), None);
        assert_eq!(unit.status(), UnitStatus::Playing);
        assert!(unit.trigger(&main_loop.handle(), &clock).is_err());

        main_loop.run_until(target + Duration::from_millis(20));
        let started = ticket.video_start().expect("video not started");
        assert!(started >= target);
        assert!(signed_ms(started, target) < 5.0);
        assert_eq!(unit.actual_start(), Some(started));
    }

    #[test]
    fn test_stop_is_idempotent_from_any_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut fresh = PlaybackUnit::new("clip.mp4", "default", mock());
        fresh.stop();
        fresh.stop();
        assert_eq!(fresh.status(), UnitStatus::Stopped);

        let mut armed = PlaybackUnit::new(media_file(&dir, "p2.mp4"), "default", mock());
        armed.prepare().unwrap();
        armed.arm(Instant::now()).unwrap();
        armed.stop();
        assert_eq!(armed.status(), UnitStatus::Stopped);
        assert_eq!(armed.armed_at(), None);
        assert!(armed.arm(Instant::now()).is_err());
    }

    #[test]
    fn test_stopped_unit_skips_scheduled_video() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Clock::default();
        let mut main_loop = MainLoop::new(clock);
        let mut unit = PlaybackUnit::new(media_file(&dir, "p1.mp4"), "default", mock());
        unit.prepare().unwrap();
        unit.arm(clock.target_after(Duration::from_millis(20))).unwrap();
        let ticket = unit.trigger(&main_loop.handle(), &clock).unwrap();

        unit.stop();
        main_loop.run_for(Duration::from_millis(40));
        assert_eq!(ticket.video_start(), None);
    }

    #[test]
    fn test_prepare_decodes_audio_at_device_rate() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = PlaybackUnit::new(media_file(&dir, "p1.mp4"), "default", mock());
        unit.prepare().unwrap();
        match &unit.state {
            UnitState::Ready(media) => {
                assert_eq!(media.audio.sample_rate(), media.output.sample_rate());
                assert_eq!(media.audio.sample_rate(), MOCK_RATE);
            }
            _ => panic!("unit not ready"),
        }
    }

    #[test]
    fn test_rate_mismatch_fails_preparation() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = PlaybackUnit::new(
            media_file(&dir, "p1.mp4"),
            "default",
            Arc::new(MockBackend::failing(MockFailure::IgnoresDeviceRate)),
        );
        let err = unit.prepare().unwrap_err();
        assert!(matches!(err, PrepareError::Output(AudioError::UnsupportedFormat(_))));
        assert_eq!(unit.status(), UnitStatus::Failed);
    }

    #[test]
    fn test_missing_video_stream_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::failing(MockFailure::NoVideo));
        let mut unit = PlaybackUnit::new(media_file(&dir, "p1.mp4"), "default", backend.clone());
        assert!(matches!(unit.prepare(), Err(PrepareError::NoVideoStream(_))));
        assert_eq!(unit.status(), UnitStatus::Failed);
        assert!(backend.outputs.lock().is_empty());
    }

    #[test]
    fn test_audio_thread_starts_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Clock::default();
        let mut main_loop = MainLoop::new(clock);
        let backend = Arc::new(MockBackend::new(Duration::from_millis(100)));
        let mut unit = PlaybackUnit::new(media_file(&dir, "p1.mp4"), "default", backend.clone());
        unit.prepare().unwrap();

        let target = clock.target_after(Duration::from_millis(30));
        unit.arm(target).unwrap();
        let ticket = unit.trigger(&main_loop.handle(), &clock).unwrap();
        main_loop.run_until(target + Duration::from_millis(20));

        let audio = ticket.audio_start().expect("audio not started");
        assert!(audio >= target);
        assert!(signed_ms(audio, target) < 5.0);
        assert_eq!(unit.audio_start(), Some(audio));
        assert_eq!(backend.audio_starts(), vec![Some(audio)]);
    }

    #[test]
    fn test_prepare_all_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut units = vec![
            PlaybackUnit::new(media_file(&dir, "p1.mp4"), "default", mock()).with_label("P1"),
            PlaybackUnit::new(
                media_file(&dir, "p2.mp4"),
                "output:missing",
                Arc::new(MockBackend::failing(MockFailure::NoDevice)),
            )
            .with_label("P2"),
        ];

        let results = prepare_all(&mut units);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(PrepareError::Output(_))));
        assert_eq!(units[0].status(), UnitStatus::Ready);
        assert_eq!(units[1].status(), UnitStatus::Failed);
    }
}
