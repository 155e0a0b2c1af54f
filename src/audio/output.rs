//! Audio output
//!
//! Each playback unit owns one [`AudioOutput`]. `play_at` runs on the unit's
//! dedicated audio thread: device APIs block until playback completes and
//! must never share a thread with video scheduling.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::buffer::AudioBuffer;
use crate::audio::device::{get_output_device, OutputFormat};
use crate::clock::Clock;
use crate::error::AudioError;

/// Poll interval while waiting for a stream to drain
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// A device a unit can start playback on
pub trait AudioOutput: Send + Sync {
    /// Identifier of the device this output plays to
    fn device_id(&self) -> &str;

    /// Rate buffers handed to `play_at` must already be at
    fn sample_rate(&self) -> u32;

    /// Wait for `target`, start playing `buffer`, and block until it drains.
    ///
    /// `on_started` receives the instant the start command was issued. Returns
    /// early once `cancel` is set; a cancel raised during the wait means the
    /// device is never started.
    fn play_at(
        &self,
        buffer: Arc<AudioBuffer>,
        target: Instant,
        clock: &Clock,
        cancel: &AtomicBool,
        on_started: &mut dyn FnMut(Instant),
    ) -> Result<(), AudioError>;
}

/// cpal-backed output
pub struct CpalOutput {
    /// Identifier the device was resolved from
    device_id: String,
    /// f32 format chosen when the device was opened
    format: OutputFormat,
}

impl CpalOutput {
    /// Resolve the device and its f32 format now, so an unusable device
    /// fails at preparation time rather than at the start instant
    pub fn open(device_id: &str) -> Result<Self, AudioError> {
        let device = get_output_device(device_id)?;
        let format = device.f32_output_format()?;
        tracing::debug!(
            "Output {} opened at {} Hz, {} channels",
            device_id,
            format.sample_rate,
            format.channels
        );
        Ok(Self {
            device_id: device_id.to_string(),
            format,
        })
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }
}

impl AudioOutput for CpalOutput {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    fn play_at(
        &self,
        buffer: Arc<AudioBuffer>,
        target: Instant,
        clock: &Clock,
        cancel: &AtomicBool,
        on_started: &mut dyn FnMut(Instant),
    ) -> Result<(), AudioError> {
        if buffer.is_empty() {
            return Err(AudioError::EmptyBuffer);
        }
        if buffer.sample_rate() != self.format.sample_rate {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} Hz buffer on {} running at {} Hz",
                buffer.sample_rate(),
                self.device_id,
                self.format.sample_rate
            )));
        }

        // The stream is built paused before the wait so only `play()` sits on
        // the critical path. cpal streams are not Send, hence built here.
        let device = get_output_device(&self.device_id)?;
        let out_channels = self.format.channels;
        let config = cpal::StreamConfig {
            channels: out_channels,
            sample_rate: cpal::SampleRate(self.format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let position = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let (error_tx, error_rx) = bounded::<AudioError>(4);

        let stream = {
            let buffer = buffer.clone();
            let position = position.clone();
            let finished = finished.clone();
            let out_channels = out_channels as usize;
            device
                .into_inner()
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut frame = position.load(Ordering::Relaxed);
                        for out in data.chunks_mut(out_channels) {
                            buffer.write_frame(frame, out);
                            frame += 1;
                        }
                        position.store(frame, Ordering::Relaxed);
                        if frame >= buffer.frames() {
                            finished.store(true, Ordering::Release);
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                )
                .map_err(|e| AudioError::StreamError(e.to_string()))?
        };

        clock.wait_until(target);
        if cancel.load(Ordering::Relaxed) {
            return Ok(());
        }
        stream
            .play()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;
        on_started(clock.now());

        let deadline = clock.now() + buffer.duration() + Duration::from_secs(2);
        while !finished.load(Ordering::Acquire) && !cancel.load(Ordering::Relaxed) {
            if let Ok(err) = error_rx.try_recv() {
                return Err(err);
            }
            if clock.now() >= deadline {
                tracing::warn!(
                    "Audio on {} did not drain in time ({} of {} frames)",
                    self.device_id,
                    position.load(Ordering::Relaxed),
                    buffer.frames()
                );
                break;
            }
            std::thread::sleep(DRAIN_POLL);
        }

        // Let the device flush its last period before the stream is dropped.
        if !cancel.load(Ordering::Relaxed) {
            std::thread::sleep(DRAIN_POLL);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_unknown_device_fails() {
        let result = CpalOutput::open("output:no-such-device-for-tests");
        assert!(matches!(result, Err(AudioError::DeviceNotFound(_))));
    }

    #[test]
    fn test_play_default_device_when_present() {
        // Only runs on machines with an output device.
        let Ok(output) = CpalOutput::open(crate::audio::device::DEFAULT_DEVICE_ID) else {
            return;
        };
        let rate = output.sample_rate();
        let clock = Clock::default();
        let cancel = AtomicBool::new(false);

        let mismatched = Arc::new(AudioBuffer::new(vec![0.0; 480], rate + 1, 1));
        let result = output.play_at(mismatched, clock.now(), &clock, &cancel, &mut |_| {});
        assert!(matches!(result, Err(AudioError::UnsupportedFormat(_))));

        let buffer = Arc::new(AudioBuffer::new(vec![0.0; rate as usize / 10], rate, 1));
        let target = clock.target_after(Duration::from_millis(30));
        let mut started = None;

        let result = output.play_at(buffer, target, &clock, &cancel, &mut |at| {
            started = Some(at)
        });
        if result.is_ok() {
            assert!(started.expect("start not reported") >= target);
        }
    }
}
