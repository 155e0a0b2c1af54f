//! In-memory backend for unit tests

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::{AudioBuffer, AudioOutput};
use crate::clock::Clock;
use crate::error::{AudioError, PrepareError};
use crate::media::{AudioStreamInfo, MediaBackend, MediaInfo, MediaProbe, VideoFrame, VideoSource};

/// Rate of the mock device and of the silent source audio
pub(crate) const MOCK_RATE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockFailure {
    /// Probe finds no video stream
    NoVideo,
    /// Probe finds no audio stream
    NoAudio,
    /// Output device cannot be opened
    NoDevice,
    /// Audio is decoded at the source rate instead of the device rate
    IgnoresDeviceRate,
    /// Output opens but every start attempt fails
    DeadOutput,
}

pub(crate) struct MockBackend {
    /// Duration reported for every file
    pub duration: Duration,
    pub failure: Option<MockFailure>,
    /// Every output handed out, for inspecting start instants
    pub outputs: Mutex<Vec<Arc<MockOutput>>>,
}

impl MockBackend {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            failure: None,
            outputs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(failure: MockFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(Duration::from_millis(200))
        }
    }

    /// Start instants recorded by the outputs, in the order they were opened
    pub fn audio_starts(&self) -> Vec<Option<Instant>> {
        self.outputs.lock().iter().map(|o| *o.started.lock()).collect()
    }
}

impl MediaBackend for MockBackend {
    fn probe(&self, path: &Path) -> Result<MediaProbe, PrepareError> {
        if self.failure == Some(MockFailure::NoVideo) {
            return Err(PrepareError::NoVideoStream(path.to_path_buf()));
        }
        let audio = (self.failure != Some(MockFailure::NoAudio)).then_some(AudioStreamInfo {
            sample_rate: 2 * MOCK_RATE,
            channels: 1,
        });
        Ok(MediaProbe {
            video: MediaInfo {
                duration: self.duration,
                width: 4,
                height: 4,
                frame_rate: 50.0,
            },
            audio,
        })
    }

    fn open_video(&self, _path: &Path, info: &MediaInfo) -> Result<Box<dyn VideoSource>, PrepareError> {
        Ok(Box::new(MockVideo {
            info: info.clone(),
            epoch: None,
            released: false,
        }))
    }

    fn extract_audio(
        &self,
        _path: &Path,
        stream: &AudioStreamInfo,
        sample_rate: u32,
    ) -> Result<AudioBuffer, PrepareError> {
        let rate = if self.failure == Some(MockFailure::IgnoresDeviceRate) {
            stream.sample_rate
        } else {
            sample_rate
        };
        let frames = (self.duration.as_secs_f64() * rate as f64) as usize;
        Ok(AudioBuffer::new(vec![0.0; frames], rate, stream.channels))
    }

    fn open_output(&self, device_id: &str) -> Result<Arc<dyn AudioOutput>, PrepareError> {
        if self.failure == Some(MockFailure::NoDevice) {
            return Err(AudioError::DeviceNotFound(device_id.to_string()).into());
        }
        let output = Arc::new(MockOutput {
            device_id: device_id.to_string(),
            dead: self.failure == Some(MockFailure::DeadOutput),
            started: Mutex::new(None),
        });
        self.outputs.lock().push(output.clone());
        Ok(output)
    }
}

pub(crate) struct MockVideo {
    info: MediaInfo,
    epoch: Option<Instant>,
    released: bool,
}

impl VideoSource for MockVideo {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn start(&mut self, epoch: Instant) {
        if !self.released && self.epoch.is_none() {
            self.epoch = Some(epoch);
        }
    }

    fn started_at(&self) -> Option<Instant> {
        self.epoch
    }

    fn next_frame(&mut self, now: Instant) -> Option<VideoFrame> {
        let pts = now.saturating_duration_since(self.epoch?);
        Some(VideoFrame {
            pts,
            width: self.info.width,
            height: self.info.height,
            data: Arc::new(vec![0; 64]),
        })
    }

    fn release(&mut self) {
        self.released = true;
    }
}

pub(crate) struct MockOutput {
    device_id: String,
    /// Fail at the start instant like a device unplugged after preparation
    dead: bool,
    pub started: Mutex<Option<Instant>>,
}

impl AudioOutput for MockOutput {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn sample_rate(&self) -> u32 {
        MOCK_RATE
    }

    fn play_at(
        &self,
        buffer: Arc<AudioBuffer>,
        target: Instant,
        clock: &Clock,
        cancel: &AtomicBool,
        on_started: &mut dyn FnMut(Instant),
    ) -> Result<(), AudioError> {
        clock.wait_until(target);
        if cancel.load(Ordering::Relaxed) {
            return Ok(());
        }
        if self.dead {
            return Err(AudioError::CpalError(format!("{} disappeared", self.device_id)));
        }
        let now = clock.now();
        *self.started.lock() = Some(now);
        on_started(now);

        let end = now + buffer.duration();
        while clock.now() < end && !cancel.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }
}
