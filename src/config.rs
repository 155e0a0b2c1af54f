//! Engine configuration
//!
//! Loaded from TOML. Every section has defaults, so an empty or partial file
//! is valid.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub timing: TimingConfig,
    pub media: MediaConfig,
    pub markers: MarkerConfig,
}

/// Scheduler and verification thresholds, all in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Remaining time below which `wait_until` spins instead of sleeping
    pub spin_threshold_ms: f64,
    /// Extra headroom above the spin threshold before a coarse sleep is taken
    pub sleep_margin_ms: f64,
    /// Lead time used by one-shot playback when the caller has no preference
    pub default_prep_time_ms: f64,
    /// Prep times below this are accepted with a warning
    pub min_prep_time_ms: f64,
    /// Maximum difference between armed timestamps in one batch
    pub arm_tolerance_ms: f64,
    /// A batch succeeds when every unit's drift is strictly below this
    pub success_threshold_ms: f64,
    /// Delay after the target before the sync report is computed
    pub verification_delay_ms: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            spin_threshold_ms: constants::SPIN_THRESHOLD_MS,
            sleep_margin_ms: constants::SLEEP_MARGIN_MS,
            default_prep_time_ms: constants::DEFAULT_PREP_TIME_MS,
            min_prep_time_ms: constants::MIN_PREP_TIME_MS,
            arm_tolerance_ms: constants::ARM_TOLERANCE_MS,
            success_threshold_ms: constants::SUCCESS_THRESHOLD_MS,
            verification_delay_ms: constants::VERIFICATION_DELAY_MS,
        }
    }
}

impl TimingConfig {
    pub fn spin_threshold(&self) -> Duration {
        ms(self.spin_threshold_ms)
    }

    pub fn sleep_margin(&self) -> Duration {
        ms(self.sleep_margin_ms)
    }

    pub fn default_prep_time(&self) -> Duration {
        ms(self.default_prep_time_ms)
    }

    pub fn min_prep_time(&self) -> Duration {
        ms(self.min_prep_time_ms)
    }

    pub fn arm_tolerance(&self) -> Duration {
        ms(self.arm_tolerance_ms)
    }

    pub fn verification_delay(&self) -> Duration {
        ms(self.verification_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        let fields = [
            ("spin_threshold_ms", self.spin_threshold_ms),
            ("sleep_margin_ms", self.sleep_margin_ms),
            ("default_prep_time_ms", self.default_prep_time_ms),
            ("min_prep_time_ms", self.min_prep_time_ms),
            ("arm_tolerance_ms", self.arm_tolerance_ms),
            ("success_threshold_ms", self.success_threshold_ms),
            ("verification_delay_ms", self.verification_delay_ms),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!(
                    "timing.{} must be a finite, non-negative number of milliseconds (got {})",
                    name, value
                )));
            }
            if value > MAX_TIMING_MS {
                return Err(Error::Config(format!(
                    "timing.{} must be at most {}ms (got {})",
                    name, MAX_TIMING_MS, value
                )));
            }
        }
        if self.spin_threshold_ms == 0.0 {
            return Err(Error::Config(
                "timing.spin_threshold_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// External media tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// ffmpeg executable, as located by the launcher
    pub ffmpeg_path: PathBuf,
    /// ffprobe executable, as located by the launcher
    pub ffprobe_path: PathBuf,
    /// How long `prepare` waits for the first decoded video frame
    pub first_frame_timeout_ms: u64,
    /// Decoded frames buffered ahead of presentation
    pub frame_queue_depth: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            first_frame_timeout_ms: 5000,
            frame_queue_depth: 8,
        }
    }
}

impl MediaConfig {
    pub fn first_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.first_frame_timeout_ms)
    }
}

/// Marker session settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Session identifier written into marker logs; generated when absent
    pub session_id: Option<String>,
    /// Directory for marker log exports; the project data directory when absent
    pub log_dir: Option<PathBuf>,
}

impl MarkerConfig {
    pub fn session_id(&self) -> String {
        self.session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.data_dir().join("markers")))
    }
}

impl SyncConfig {
    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: SyncConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load from the default location, falling back to defaults when no file exists
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Write as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// `<config dir>/dyadic-sync.toml`
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("dyadic-sync.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        self.timing.validate()?;
        if self.media.frame_queue_depth == 0 {
            return Err(Error::Config(
                "media.frame_queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "dyadic-sync", "dyadic-sync")
}

/// Largest accepted timing value, one hour
const MAX_TIMING_MS: f64 = 3_600_000.0;

/// Milliseconds to a duration, clamped to `0..=MAX_TIMING_MS` so unvalidated
/// values never overflow instant arithmetic
fn ms(value: f64) -> Duration {
    let clamped = if value.is_nan() { 0.0 } else { value.clamp(0.0, MAX_TIMING_MS) };
    Duration::from_secs_f64(clamped / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_constants() {
        let config = SyncConfig::default();
        assert_eq!(config.timing.spin_threshold(), Duration::from_millis(5));
        assert_eq!(config.timing.arm_tolerance(), Duration::from_millis(1));
        assert_eq!(config.timing.default_prep_time(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml(
            r#"
            [timing]
            default_prep_time_ms = 150.0

            [media]
            ffmpeg_path = "/opt/ffmpeg/bin/ffmpeg"
            "#,
        )
        .unwrap();

        assert_eq!(config.timing.default_prep_time_ms, 150.0);
        assert_eq!(config.timing.spin_threshold_ms, 5.0);
        assert_eq!(config.media.ffmpeg_path, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(config.media.ffprobe_path, PathBuf::from("ffprobe"));
    }

    #[test]
    fn test_rejects_negative_threshold() {
        let err = SyncConfig::from_toml("[timing]\narm_tolerance_ms = -1.0\n").unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("arm_tolerance_ms")));
    }

    #[test]
    fn test_rejects_zero_spin_threshold() {
        assert!(SyncConfig::from_toml("[timing]\nspin_threshold_ms = 0.0\n").is_err());
    }

    #[test]
    fn test_rejects_huge_timing_values() {
        let mut config = SyncConfig::default();
        config.timing.verification_delay_ms = 1e300;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("verification_delay_ms"));

        config.timing.verification_delay_ms = MAX_TIMING_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unvalidated_durations_saturate() {
        let timing = TimingConfig {
            verification_delay_ms: 1e300,
            default_prep_time_ms: f64::NAN,
            ..TimingConfig::default()
        };
        assert_eq!(timing.verification_delay(), Duration::from_secs(3600));
        assert_eq!(timing.default_prep_time(), Duration::ZERO);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dyadic-sync.toml");

        let mut config = SyncConfig::default();
        config.markers.session_id = Some("P001_session1".to_string());
        config.timing.verification_delay_ms = 250.0;
        config.save(&path).unwrap();

        let loaded = SyncConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_session_id_generated_when_absent() {
        let markers = MarkerConfig::default();
        let a = markers.session_id();
        let b = markers.session_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
