//! ffmpeg/ffprobe media backend
//!
//! Metadata comes from `ffprobe -print_format json`. Audio is extracted from
//! the first audio stream as f32le PCM straight into memory, resampled to the
//! rate the output device runs at. Video is decoded
//! to RGBA by an ffmpeg child process and a reader thread that fills a small
//! bounded frame queue, so decoding runs ahead of presentation without
//! unbounded memory growth.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::{AudioBuffer, AudioOutput, CpalOutput};
use crate::config::MediaConfig;
use crate::error::PrepareError;
use crate::media::{AudioStreamInfo, MediaBackend, MediaInfo, MediaProbe, VideoFrame, VideoSource};

/// Frame rate assumed when the container does not report one
const FALLBACK_FRAME_RATE: f64 = 30.0;

/// Create a Command that does not flash a console window on Windows
fn create_hidden_command(program: &Path) -> Command {
    let mut cmd = Command::new(program);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd
}

#[derive(Debug, Default, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u16>,
    duration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

impl ProbeOutput {
    fn first(&self, codec_type: &str) -> Option<&ProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(codec_type))
    }

    /// Container duration, falling back to the video stream's own
    fn duration(&self) -> Option<Duration> {
        let from_format = self
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(parse_seconds);
        let from_stream = self
            .first("video")
            .and_then(|s| s.duration.as_deref())
            .and_then(parse_seconds);
        from_format.or(from_stream)
    }
}

fn parse_seconds(text: &str) -> Option<Duration> {
    let secs: f64 = text.trim().parse().ok()?;
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// Parse ffprobe rationals such as `30000/1001`
fn parse_rate(text: &str) -> Option<f64> {
    let (num, den) = match text.split_once('/') {
        Some((n, d)) => (n.trim().parse::<f64>().ok()?, d.trim().parse::<f64>().ok()?),
        None => (text.trim().parse::<f64>().ok()?, 1.0),
    };
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}

/// Media backend that shells out to ffmpeg and ffprobe
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    config: MediaConfig,
}

impl FfmpegBackend {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    /// True when both executables run
    pub fn is_available(&self) -> bool {
        [&self.config.ffmpeg_path, &self.config.ffprobe_path]
            .iter()
            .all(|tool| {
                create_hidden_command(tool)
                    .arg("-version")
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .map(|s| s.success())
                    .unwrap_or(false)
            })
    }

    fn run_probe(&self, path: &Path) -> Result<ProbeOutput, PrepareError> {
        let output = create_hidden_command(&self.config.ffprobe_path)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_entries",
                "format=duration:stream=codec_type,width,height,r_frame_rate,avg_frame_rate,sample_rate,channels,duration",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| PrepareError::ToolLaunch {
                tool: self.config.ffprobe_path.display().to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(PrepareError::Probe {
                path: path.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| PrepareError::Probe {
            path: path.to_path_buf(),
            reason: format!("unreadable ffprobe output: {}", e),
        })
    }

    fn media_info(&self, path: &Path, probe: &ProbeOutput) -> Result<MediaInfo, PrepareError> {
        let video = probe
            .first("video")
            .ok_or_else(|| PrepareError::NoVideoStream(path.to_path_buf()))?;
        let duration = probe
            .duration()
            .ok_or_else(|| PrepareError::DurationUnavailable(path.to_path_buf()))?;
        let (width, height) = match (video.width, video.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => {
                return Err(PrepareError::Probe {
                    path: path.to_path_buf(),
                    reason: "video stream has no dimensions".to_string(),
                })
            }
        };
        let frame_rate = video
            .avg_frame_rate
            .as_deref()
            .and_then(parse_rate)
            .or_else(|| video.r_frame_rate.as_deref().and_then(parse_rate))
            .unwrap_or(FALLBACK_FRAME_RATE);

        Ok(MediaInfo {
            duration,
            width,
            height,
            frame_rate,
        })
    }

    fn audio_stream(&self, path: &Path, probe: &ProbeOutput) -> Result<Option<AudioStreamInfo>, PrepareError> {
        let Some(stream) = probe.first("audio") else {
            return Ok(None);
        };
        let sample_rate: u32 = stream
            .sample_rate
            .as_deref()
            .and_then(|r| r.trim().parse().ok())
            .filter(|r| *r > 0)
            .ok_or_else(|| PrepareError::AudioExtraction {
                path: path.to_path_buf(),
                reason: "audio stream has no sample rate".to_string(),
            })?;
        Ok(Some(AudioStreamInfo {
            sample_rate,
            channels: stream.channels.unwrap_or(2).max(1),
        }))
    }
}

impl MediaBackend for FfmpegBackend {
    fn probe(&self, path: &Path) -> Result<MediaProbe, PrepareError> {
        let probe = self.run_probe(path)?;
        Ok(MediaProbe {
            video: self.media_info(path, &probe)?,
            audio: self.audio_stream(path, &probe)?,
        })
    }

    fn open_video(&self, path: &Path, info: &MediaInfo) -> Result<Box<dyn VideoSource>, PrepareError> {
        let video = FfmpegVideo::spawn(
            &self.config.ffmpeg_path,
            path,
            info.clone(),
            self.config.frame_queue_depth,
            self.config.first_frame_timeout(),
        )?;
        Ok(Box::new(video))
    }

    fn extract_audio(
        &self,
        path: &Path,
        stream: &AudioStreamInfo,
        sample_rate: u32,
    ) -> Result<AudioBuffer, PrepareError> {
        let channels = stream.channels;
        if stream.sample_rate != sample_rate {
            tracing::debug!(
                "Resampling {} from {} Hz to {} Hz",
                path.display(),
                stream.sample_rate,
                sample_rate
            );
        }

        let output = create_hidden_command(&self.config.ffmpeg_path)
            .args(["-v", "error", "-nostdin", "-threads", "0", "-i"])
            .arg(path)
            .args(["-vn", "-map", "0:a:0", "-f", "f32le", "-acodec", "pcm_f32le"])
            .args(["-ar", &sample_rate.to_string(), "-ac", &channels.to_string()])
            .arg("pipe:1")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| PrepareError::ToolLaunch {
                tool: self.config.ffmpeg_path.display().to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(PrepareError::AudioExtraction {
                path: path.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let buffer = AudioBuffer::from_f32le_bytes(&output.stdout, sample_rate, channels);
        if buffer.is_empty() {
            return Err(PrepareError::AudioExtraction {
                path: path.to_path_buf(),
                reason: "no samples decoded".to_string(),
            });
        }
        Ok(buffer)
    }

    fn open_output(&self, device_id: &str) -> Result<Arc<dyn AudioOutput>, PrepareError> {
        Ok(Arc::new(CpalOutput::open(device_id)?))
    }
}

/// Video stream decoded by an ffmpeg child process
pub struct FfmpegVideo {
    path: PathBuf,
    info: MediaInfo,
    epoch: Option<Instant>,
    frames: Option<Receiver<VideoFrame>>,
    pending: Option<VideoFrame>,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
}

impl FfmpegVideo {
    fn spawn(
        ffmpeg: &Path,
        path: &Path,
        info: MediaInfo,
        queue_depth: usize,
        first_frame_timeout: Duration,
    ) -> Result<Self, PrepareError> {
        let mut child = create_hidden_command(ffmpeg)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-map", "0:v:0", "-an", "-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PrepareError::ToolLaunch {
                tool: ffmpeg.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut stdout = child.stdout.take().ok_or_else(|| PrepareError::NoDecodableFrame {
            path: path.to_path_buf(),
            reason: "decoder produced no output pipe".to_string(),
        })?;

        let (tx, rx) = bounded::<VideoFrame>(queue_depth.max(1));
        let frame_bytes = info.width as usize * info.height as usize * 4;
        let frame_rate = info.frame_rate;
        let (width, height) = (info.width, info.height);
        let label = path.display().to_string();

        let reader = thread::Builder::new()
            .name("video-decode".to_string())
            .spawn(move || {
                let mut index: u64 = 0;
                loop {
                    let mut data = vec![0u8; frame_bytes];
                    if stdout.read_exact(&mut data).is_err() {
                        break;
                    }
                    let frame = VideoFrame {
                        pts: Duration::from_secs_f64(index as f64 / frame_rate),
                        width,
                        height,
                        data: Arc::new(data),
                    };
                    if tx.send(frame).is_err() {
                        break;
                    }
                    index += 1;
                }
                tracing::debug!("Decoder for {} finished after {} frames", label, index);
            })
            .map_err(|e| PrepareError::ToolLaunch {
                tool: "video-decode thread".to_string(),
                reason: e.to_string(),
            })?;

        let mut video = Self {
            path: path.to_path_buf(),
            info,
            epoch: None,
            frames: Some(rx),
            pending: None,
            child: Some(child),
            reader: Some(reader),
        };

        let first = video
            .frames
            .as_ref()
            .map(|rx| rx.recv_timeout(first_frame_timeout));
        match first {
            Some(Ok(frame)) => {
                video.pending = Some(frame);
                Ok(video)
            }
            Some(Err(RecvTimeoutError::Timeout)) => {
                video.release();
                Err(PrepareError::NoDecodableFrame {
                    path: path.to_path_buf(),
                    reason: format!("no frame within {}ms", first_frame_timeout.as_millis()),
                })
            }
            _ => {
                video.release();
                Err(PrepareError::NoDecodableFrame {
                    path: path.to_path_buf(),
                    reason: "decoder exited before the first frame".to_string(),
                })
            }
        }
    }
}

impl VideoSource for FfmpegVideo {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn start(&mut self, epoch: Instant) {
        if self.epoch.is_none() {
            self.epoch = Some(epoch);
        }
    }

    fn started_at(&self) -> Option<Instant> {
        self.epoch
    }

    fn next_frame(&mut self, now: Instant) -> Option<VideoFrame> {
        let elapsed = now.saturating_duration_since(self.epoch?);
        let mut latest = None;
        loop {
            let frame = match self.pending.take() {
                Some(frame) => frame,
                None => match self.frames.as_ref()?.try_recv() {
                    Ok(frame) => frame,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                },
            };
            if frame.pts <= elapsed {
                latest = Some(frame);
            } else {
                self.pending = Some(frame);
                break;
            }
        }
        latest
    }

    fn release(&mut self) {
        // Dropping the receiver unblocks a reader stuck on a full queue.
        self.frames = None;
        self.pending = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        tracing::debug!("Released video decoder for {}", self.path.display());
    }
}

impl Drop for FfmpegVideo {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("30/1"), Some(30.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("n/a"), None);
    }

    #[test]
    fn test_probe_json_parsing() {
        let json = r#"{
            "programs": [],
            "streams": [
                {"codec_type": "video", "width": 1920, "height": 1080,
                 "r_frame_rate": "30/1", "avg_frame_rate": "30000/1001"},
                {"codec_type": "audio", "sample_rate": "48000", "channels": 2}
            ],
            "format": {"duration": "12.500000"}
        }"#;
        let probe: ProbeOutput = serde_json::from_str(json).unwrap();
        assert_eq!(probe.duration(), Some(Duration::from_millis(12500)));

        let backend = FfmpegBackend::new(MediaConfig::default());
        let info = backend.media_info(Path::new("clip.mp4"), &probe).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
        assert!((info.frame_rate - 29.97).abs() < 0.01);

        let audio = backend.audio_stream(Path::new("clip.mp4"), &probe).unwrap();
        assert_eq!(
            audio,
            Some(AudioStreamInfo {
                sample_rate: 48000,
                channels: 2
            })
        );
    }

    #[test]
    fn test_audio_stream_without_rate_is_rejected() {
        let json = r#"{"streams": [{"codec_type": "audio", "sample_rate": "N/A"}]}"#;
        let probe: ProbeOutput = serde_json::from_str(json).unwrap();
        let backend = FfmpegBackend::new(MediaConfig::default());
        let err = backend.audio_stream(Path::new("a.mp4"), &probe).unwrap_err();
        assert!(matches!(err, PrepareError::AudioExtraction { .. }));
    }

    #[test]
    fn test_missing_duration_is_rejected() {
        let json = r#"{"streams": [{"codec_type": "video", "width": 2, "height": 2}],
                       "format": {"duration": "N/A"}}"#;
        let probe: ProbeOutput = serde_json::from_str(json).unwrap();
        let backend = FfmpegBackend::new(MediaConfig::default());
        let err = backend.media_info(Path::new("x.mp4"), &probe).unwrap_err();
        assert!(matches!(err, PrepareError::DurationUnavailable(_)));
    }

    #[test]
    fn test_audio_only_file_has_no_video() {
        let json = r#"{"streams": [{"codec_type": "audio", "sample_rate": "44100"}],
                       "format": {"duration": "3.0"}}"#;
        let probe: ProbeOutput = serde_json::from_str(json).unwrap();
        let backend = FfmpegBackend::new(MediaConfig::default());
        let err = backend.media_info(Path::new("a.wav"), &probe).unwrap_err();
        assert!(matches!(err, PrepareError::NoVideoStream(_)));
    }

    #[test]
    fn test_missing_tool_reports_launch_failure() {
        let backend = FfmpegBackend::new(MediaConfig {
            ffprobe_path: PathBuf::from("/nonexistent/ffprobe-for-tests"),
            ..MediaConfig::default()
        });
        let err = backend.probe(Path::new("clip.mp4")).unwrap_err();
        assert!(matches!(err, PrepareError::ToolLaunch { .. }));
    }

    #[test]
    fn test_generated_clip_when_ffmpeg_present() {
        let backend = FfmpegBackend::new(MediaConfig::default());
        if !backend.is_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mkv");
        let status = Command::new("ffmpeg")
            .args(["-v", "error", "-y", "-f", "lavfi", "-i", "testsrc=size=64x48:rate=25:duration=1"])
            .args(["-f", "lavfi", "-i", "sine=frequency=440:sample_rate=48000:duration=1"])
            .args(["-shortest"])
            .arg(&clip)
            .status();
        if !matches!(status, Ok(s) if s.success()) {
            return;
        }

        let probe = backend.probe(&clip).unwrap();
        let stream = probe.audio.expect("generated clip has audio");
        assert_eq!(stream.sample_rate, 48000);

        let audio = backend.extract_audio(&clip, &stream, 44100).unwrap();
        assert_eq!(audio.sample_rate(), 44100);
        assert!(audio.duration() > Duration::from_millis(800));

        let mut video = backend.open_video(&clip, &probe.video).unwrap();
        assert_eq!(video.info().width, 64);
        assert!(video.next_frame(Instant::now()).is_none());

        let epoch = Instant::now();
        video.start(epoch);
        let frame = video.next_frame(epoch).expect("first frame due at epoch");
        assert_eq!(frame.pts, Duration::ZERO);
        assert_eq!(frame.data.len(), 64 * 48 * 4);
        video.release();
    }
}
