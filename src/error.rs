//! Error types for the synchronization engine and marker protocol

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Preparation error: {0}")]
    Prepare(#[from] PrepareError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Marker error: {0}")]
    Marker(#[from] MarkerError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Media preparation failures.
///
/// Recoverable at the batch level: the affected unit is marked failed and the
/// executor decides whether the trial goes ahead.
#[derive(Error, Debug)]
pub enum PrepareError {
    #[error("Media file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to launch {tool}: {reason}")]
    ToolLaunch { tool: String, reason: String },

    #[error("Probe failed for {path}: {reason}")]
    Probe { path: PathBuf, reason: String },

    #[error("No video stream in {0}")]
    NoVideoStream(PathBuf),

    #[error("No audio stream in {0}")]
    NoAudioStream(PathBuf),

    #[error("Duration not retrievable for {0}")]
    DurationUnavailable(PathBuf),

    #[error("No decodable video frame in {path}: {reason}")]
    NoDecodableFrame { path: PathBuf, reason: String },

    #[error("Audio extraction failed for {path}: {reason}")]
    AudioExtraction { path: PathBuf, reason: String },

    #[error("Audio output unavailable: {0}")]
    Output(#[from] AudioError),

    #[error("Unit {unit} cannot be prepared while {status}")]
    AlreadyPrepared { unit: String, status: String },

    #[error("Preparation of {0} panicked")]
    Panicked(String),
}

/// Arm/trigger misuse and batch consistency failures
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Unit {unit} is {found}, expected {expected}")]
    InvalidState {
        unit: String,
        expected: &'static str,
        found: String,
    },

    #[error("Unit {index} is not armed")]
    NotArmed { index: usize },

    #[error(
        "Unit {index} armed {diff_ms:+.3}ms away from unit 0; all units must share one target"
    )]
    Desynchronized { index: usize, diff_ms: f64 },

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Marker template syntax, resolution and delivery errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarkerError {
    #[error("Invalid marker template '{template}': {reason}")]
    Syntax { template: String, reason: String },

    #[error("Template '{template}' requires variables {missing:?} missing from the trial context")]
    MissingVariable {
        template: String,
        missing: Vec<String>,
    },

    #[error("Trial index required for template '{0}'")]
    MissingTrialIndex(String),

    #[error("Response value required for template '{0}'")]
    MissingResponse(String),

    #[error("Template '{template}' resolved to '{value}', which is not an integer")]
    NotAnInteger { template: String, value: String },

    #[error("Participant must be 1, 2 or absent (both), got {0}")]
    InvalidParticipant(u8),

    #[error("Marker delivery failed: {0}")]
    Delivery(String),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Empty audio buffer")]
    EmptyBuffer,

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desync_message_carries_signed_difference() {
        let err = SyncError::Desynchronized {
            index: 1,
            diff_ms: 2.0,
        };
        assert!(err.to_string().contains("+2.000ms"));
    }

    #[test]
    fn test_nested_errors_convert() {
        let err: Error = MarkerError::MissingTrialIndex("100#".into()).into();
        assert!(matches!(err, Error::Marker(MarkerError::MissingTrialIndex(_))));

        let err: PrepareError = AudioError::DeviceNotFound("output:x".into()).into();
        assert!(matches!(err, PrepareError::Output(_)));
    }
}
