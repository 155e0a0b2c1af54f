//! In-memory decoded audio
//!
//! A unit's whole soundtrack is decoded up front so starting playback never
//! waits on I/O.

use std::time::Duration;

/// Interleaved f32 samples for one soundtrack
#[derive(Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl std::fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("frames", &self.frames())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}

impl AudioBuffer {
    /// Trailing samples that do not fill a whole frame are dropped.
    pub fn new(mut samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1);
        let whole = samples.len() - samples.len() % channels as usize;
        samples.truncate(whole);
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Decode little-endian f32 PCM as produced by `ffmpeg -f f32le`
    pub fn from_f32le_bytes(bytes: &[u8], sample_rate: u32, channels: u16) -> Self {
        let samples = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Self::new(samples, sample_rate, channels)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of samples per channel
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// One output frame for a device with `out_channels` channels.
    ///
    /// Mono is duplicated to every output channel, extra source channels are
    /// dropped, and missing ones are silent.
    #[inline]
    pub fn write_frame(&self, frame: usize, out: &mut [f32]) {
        let channels = self.channels as usize;
        let start = frame * channels;
        if start + channels > self.samples.len() {
            out.fill(0.0);
            return;
        }
        let source = &self.samples[start..start + channels];
        if channels == 1 {
            out.fill(source[0]);
            return;
        }
        for (i, sample) in out.iter_mut().enumerate() {
            *sample = source.get(i).copied().unwrap_or(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frame_is_dropped() {
        let buffer = AudioBuffer::new(vec![0.1, 0.2, 0.3, 0.4, 0.5], 48000, 2);
        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.samples().len(), 4);
    }

    #[test]
    fn test_duration() {
        let buffer = AudioBuffer::new(vec![0.0; 48000 * 2], 48000, 2);
        assert_eq!(buffer.duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_from_f32le_bytes() {
        let mut bytes = Vec::new();
        for v in [0.5f32, -0.25, 1.0, 0.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.push(0xFF); // stray byte from a truncated pipe read

        let buffer = AudioBuffer::from_f32le_bytes(&bytes, 44100, 2);
        assert_eq!(buffer.samples(), &[0.5, -0.25, 1.0, 0.0]);
        assert_eq!(buffer.sample_rate(), 44100);
    }

    #[test]
    fn test_write_frame_channel_mapping() {
        let mono = AudioBuffer::new(vec![0.3, 0.6], 8000, 1);
        let mut out = [0.0f32; 2];
        mono.write_frame(1, &mut out);
        assert_eq!(out, [0.6, 0.6]);

        let stereo = AudioBuffer::new(vec![0.1, 0.2], 8000, 2);
        let mut out = [9.0f32; 4];
        stereo.write_frame(0, &mut out);
        assert_eq!(out, [0.1, 0.2, 0.0, 0.0]);

        let mut out = [9.0f32; 2];
        stereo.write_frame(5, &mut out);
        assert_eq!(out, [0.0, 0.0]);
    }
}
