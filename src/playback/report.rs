//! Sync verification
//!
//! Verification is diagnostic only. A report that misses the threshold is
//! logged and kept as data-quality telemetry; playback is never undone.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::clock::signed_ms;
use crate::error::Result;

/// Achieved start quality of one batch
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    #[serde(skip)]
    pub target: Option<Instant>,
    #[serde(skip)]
    pub actual_starts: Vec<Option<Instant>>,
    pub labels: Vec<String>,
    /// Video start minus target, per unit; `None` when the unit never started
    pub drifts_ms: Vec<Option<f64>>,
    pub audio_drifts_ms: Vec<Option<f64>>,
    /// Audio start minus video start, per unit
    pub av_offsets_ms: Vec<Option<f64>>,
    pub max_drift_ms: f64,
    /// Largest `|audio drift|`; infinite when any unit's audio never started
    pub max_audio_drift_ms: f64,
    /// Every audio thread started within the threshold
    pub audio_ok: bool,
    pub spread_ms: f64,
    pub units_started: usize,
    pub units_total: usize,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

impl SyncReport {
    /// Report for a batch with nothing in it
    pub fn empty() -> Self {
        Self {
            target: None,
            actual_starts: Vec::new(),
            labels: Vec::new(),
            drifts_ms: Vec::new(),
            audio_drifts_ms: Vec::new(),
            av_offsets_ms: Vec::new(),
            max_drift_ms: f64::INFINITY,
            max_audio_drift_ms: f64::INFINITY,
            audio_ok: false,
            spread_ms: 0.0,
            units_started: 0,
            units_total: 0,
            success: false,
            recorded_at: Utc::now(),
        }
    }
}

/// Compare recorded start instants against `target`.
///
/// Success requires every unit to have started both video and audio, with
/// every drift strictly below `threshold_ms`.
pub fn verify_sync(
    labels: &[String],
    video_starts: &[Option<Instant>],
    audio_starts: &[Option<Instant>],
    target: Instant,
    threshold_ms: f64,
) -> SyncReport {
    let units_total = video_starts.len();
    let drifts_ms: Vec<Option<f64>> = video_starts
        .iter()
        .map(|s| s.map(|at| signed_ms(at, target)))
        .collect();
    let audio_drifts_ms: Vec<Option<f64>> = (0..units_total)
        .map(|i| audio_starts.get(i).copied().flatten().map(|at| signed_ms(at, target)))
        .collect();
    let av_offsets_ms: Vec<Option<f64>> = (0..units_total)
        .map(|i| match (audio_starts.get(i).copied().flatten(), video_starts[i]) {
            (Some(audio), Some(video)) => Some(signed_ms(audio, video)),
            _ => None,
        })
        .collect();

    let started: Vec<Instant> = video_starts.iter().flatten().copied().collect();
    let units_started = started.len();

    let max_drift_ms = if started.is_empty() {
        f64::INFINITY
    } else {
        drifts_ms.iter().flatten().fold(0.0_f64, |acc, d| acc.max(d.abs()))
    };
    let spread_ms = match (started.iter().min(), started.iter().max()) {
        (Some(first), Some(last)) => signed_ms(*last, *first),
        _ => 0.0,
    };
    let max_audio_drift_ms = if units_total > 0 && audio_drifts_ms.iter().all(Option::is_some) {
        audio_drifts_ms.iter().flatten().fold(0.0_f64, |acc, d| acc.max(d.abs()))
    } else {
        f64::INFINITY
    };
    let audio_ok = max_audio_drift_ms < threshold_ms;
    let success =
        units_total > 0 && units_started == units_total && max_drift_ms < threshold_ms && audio_ok;

    if success {
        tracing::info!(
            "Sync SUCCESS: max drift {:.3}ms, spread {:.3}ms ({}/{} started)",
            max_drift_ms,
            spread_ms,
            units_started,
            units_total
        );
    } else {
        tracing::warn!(
            "Sync WARNING: max drift {:.3}ms, spread {:.3}ms ({}/{} started, threshold {:.1}ms)",
            max_drift_ms,
            spread_ms,
            units_started,
            units_total,
            threshold_ms
        );
        if !audio_ok {
            let silent: Vec<&str> = audio_drifts_ms
                .iter()
                .enumerate()
                .filter(|(_, d)| d.is_none())
                .map(|(i, _)| labels.get(i).map(String::as_str).unwrap_or("?"))
                .collect();
            if silent.is_empty() {
                tracing::warn!("  audio drift {:.3}ms over threshold", max_audio_drift_ms);
            } else {
                tracing::warn!("  audio not started: {}", silent.join(", "));
            }
        }
    }
    for (i, drift) in drifts_ms.iter().enumerate() {
        let label = labels.get(i).map(String::as_str).unwrap_or("?");
        match (drift, audio_drifts_ms[i]) {
            (Some(video), Some(audio)) => tracing::debug!(
                "  {}: video {:+.3}ms, audio {:+.3}ms",
                label,
                video,
                audio
            ),
            (Some(video), None) => tracing::debug!("  {}: video {:+.3}ms, audio not started", label, video),
            (None, _) => tracing::debug!("  {}: not started", label),
        }
    }

    SyncReport {
        target: Some(target),
        actual_starts: video_starts.to_vec(),
        labels: labels.to_vec(),
        drifts_ms,
        audio_drifts_ms,
        av_offsets_ms,
        max_drift_ms,
        max_audio_drift_ms,
        audio_ok,
        spread_ms,
        units_started,
        units_total,
        success,
        recorded_at: Utc::now(),
    }
}

/// Session-wide record of every verification, shared with the main loop
#[derive(Debug, Clone, Default)]
pub struct SyncTelemetry {
    reports: Arc<Mutex<Vec<SyncReport>>>,
}

impl SyncTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: SyncReport) {
        self.reports.lock().push(report);
    }

    pub fn reports(&self) -> Vec<SyncReport> {
        self.reports.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    /// Fraction of batches that met the threshold
    pub fn success_rate(&self) -> Option<f64> {
        let reports = self.reports.lock();
        if reports.is_empty() {
            return None;
        }
        let ok = reports.iter().filter(|r| r.success).count();
        Some(ok as f64 / reports.len() as f64)
    }

    /// Write every report as a JSON array
    pub fn export_json(&self, path: &Path) -> Result<()> {
        let reports = self.reports.lock();
        let json = serde_json::to_string_pretty(&*reports)
            .map_err(|e| crate::Error::Config(format!("telemetry serialization: {}", e)))?;
        std::fs::write(path, json)?;
        tracing::info!("Exported {} sync reports to {}", reports.len(), path.display());
        Ok(())
    }
}
