//! Media decoding seam
//!
//! A [`MediaBackend`] turns a media file into the pieces a playback unit
//! owns: a started-on-command [`VideoSource`], a fully decoded
//! [`AudioBuffer`], and an [`AudioOutput`] for the participant's device.
//! The file is probed once; the probe result drives both decoders.

pub mod ffmpeg;
#[cfg(test)]
pub(crate) mod mock;

pub use ffmpeg::FfmpegBackend;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::{AudioBuffer, AudioOutput};
use crate::error::PrepareError;

/// Stream parameters discovered while opening a file
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration: Duration,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

/// First audio stream of a container, as reported by the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Everything learned about a file before decoding starts
#[derive(Debug, Clone, PartialEq)]
pub struct MediaProbe {
    /// First video stream and container duration
    pub video: MediaInfo,
    /// `None` when the container has no audio stream
    pub audio: Option<AudioStreamInfo>,
}

/// One decoded RGBA frame
#[derive(Clone)]
pub struct VideoFrame {
    /// Presentation time relative to the start of the stream
    pub pts: Duration,
    pub width: u32,
    pub height: u32,
    pub data: Arc<Vec<u8>>,
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("pts", &self.pts)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Decoded video waiting for its start command.
///
/// Owned by the thread running the main loop; `start` must be cheap enough
/// to call for every unit inside one callback.
pub trait VideoSource: Send {
    fn info(&self) -> &MediaInfo;

    /// Begin presentation with `epoch` as time zero
    fn start(&mut self, epoch: Instant);

    /// Presentation epoch once started
    fn started_at(&self) -> Option<Instant>;

    /// Most recent frame due at `now`, for the renderer
    fn next_frame(&mut self, now: Instant) -> Option<VideoFrame>;

    /// True once every frame up to the stream duration has been presented
    fn is_finished(&self, now: Instant) -> bool {
        match self.started_at() {
            Some(epoch) => now.saturating_duration_since(epoch) >= self.info().duration,
            None => false,
        }
    }

    /// Stop decoding and free frame memory. Idempotent.
    fn release(&mut self);
}

/// Factory for a unit's media resources
pub trait MediaBackend: Send + Sync {
    /// Read stream metadata without decoding
    fn probe(&self, path: &Path) -> Result<MediaProbe, PrepareError>;

    /// Open the container's first video stream and decode at least one frame
    fn open_video(&self, path: &Path, info: &MediaInfo) -> Result<Box<dyn VideoSource>, PrepareError>;

    /// Decode the container's first audio stream into memory, resampled to
    /// `sample_rate`
    fn extract_audio(
        &self,
        path: &Path,
        stream: &AudioStreamInfo,
        sample_rate: u32,
    ) -> Result<AudioBuffer, PrepareError>;

    /// Output for the given device identifier
    fn open_output(&self, device_id: &str) -> Result<Arc<dyn AudioOutput>, PrepareError>;
}
