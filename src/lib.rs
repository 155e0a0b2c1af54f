//! # Dyadic Sync
//!
//! Millisecond-precision synchronized audio/video playback for
//! two-participant experiments, plus the event-marker templates sent to the
//! physiological recorder.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                         PHASE EXECUTOR (caller)                             │
//! │   prepare ahead ──▶ arm at T = now + prep ──▶ trigger at the transition     │
//! └──────────┬──────────────────────────┬───────────────────────────┬───────────┘
//!            │                          │                           │
//!            ▼                          ▼                           ▼
//! ┌─────────────────────┐   ┌───────────────────────────┐   ┌─────────────────┐
//! │ PlaybackUnit (P1)   │   │ SyncCoordinator           │   │ MarkerDispatcher│
//! │  video  ◀─ ffmpeg   │   │  check armed T (±1 ms)    │   │  binding ─▶     │
//! │  audio  ◀─ f32 PCM  │   │  spawn audio threads      │   │  template ─▶    │
//! │  output ─▶ cpal     │   │  one video callback at T  │   │  Marker ─▶ sink │
//! ├─────────────────────┤   │  verify at T + 100 ms     │   │         └▶ log  │
//! │ PlaybackUnit (P2)   │   └─────────────┬─────────────┘   └─────────────────┘
//! └──────────┬──────────┘                 │
//!            │                            ▼
//!            │              ┌───────────────────────────┐
//!            │              │ MainLoop (render thread)  │
//!            │              │  video start P1, P2 @ T   │
//!            │              │  verification @ T+delay   │
//!            │              └───────────────────────────┘
//!            ▼
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │  audio-P1 thread: wait_until(T) ─▶ play      audio-P2 thread: same         │
//! │  Clock::wait_until = coarse sleep, then spin for the final 5 ms            │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod markers;
pub mod media;
pub mod playback;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Remaining time below which `wait_until` stops sleeping and spins
    pub const SPIN_THRESHOLD_MS: f64 = 5.0;

    /// Extra headroom before the spin phase to absorb sleep overshoot
    pub const SLEEP_MARGIN_MS: f64 = 5.0;

    /// Lead time used when the caller does not choose one
    pub const DEFAULT_PREP_TIME_MS: f64 = 100.0;

    /// Lead times below this are allowed but logged
    pub const MIN_PREP_TIME_MS: f64 = 10.0;

    /// Maximum difference between armed instants in one batch
    pub const ARM_TOLERANCE_MS: f64 = 1.0;

    /// A batch succeeds when every drift is strictly below this
    pub const SUCCESS_THRESHOLD_MS: f64 = 5.0;

    /// Delay after the target before start instants are collected
    pub const VERIFICATION_DELAY_MS: f64 = 100.0;
}
