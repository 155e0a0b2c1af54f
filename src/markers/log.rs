//! Session record of every marker sent
//!
//! Kept for post-session documentation: a CSV of every emission and a plain
//! text summary for the lab notebook.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::MarkerConfig;
use crate::error::Result;
use crate::markers::binding::Participant;
use crate::markers::template::Marker;

/// Optional context attached to a logged marker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordDetails {
    pub event_type: Option<String>,
    pub phase_name: Option<String>,
    pub trial_index: Option<i64>,
    pub participant: Option<Participant>,
    pub additional_data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerRecord {
    pub timestamp: DateTime<Utc>,
    /// Time since the log was created
    pub elapsed: Duration,
    pub marker: Marker,
    pub details: RecordDetails,
}

pub struct MarkerLog {
    session_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    records: Vec<MarkerRecord>,
}

impl MarkerLog {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            records: Vec::new(),
        }
    }

    pub fn from_config(config: &MarkerConfig) -> Self {
        Self::new(config.session_id())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn record(&mut self, marker: Marker, details: RecordDetails) {
        self.records.push(MarkerRecord {
            timestamp: Utc::now(),
            elapsed: self.started.elapsed(),
            marker,
            details,
        });
    }

    pub fn records(&self) -> &[MarkerRecord] {
        &self.records
    }

    /// Records matching every given criterion
    pub fn filter(
        &self,
        marker: Option<&Marker>,
        event_type: Option<&str>,
        trial_index: Option<i64>,
    ) -> Vec<&MarkerRecord> {
        self.records
            .iter()
            .filter(|r| marker.map_or(true, |m| &r.marker == m))
            .filter(|r| event_type.map_or(true, |e| r.details.event_type.as_deref() == Some(e)))
            .filter(|r| trial_index.map_or(true, |t| r.details.trial_index == Some(t)))
            .collect()
    }

    /// How many times each marker was sent
    pub fn counts(&self) -> BTreeMap<Marker, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.marker.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn last(&self) -> Option<&MarkerRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget every record, e.g. between blocks
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// One row per record
    pub fn export_csv(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;

        let mut out = String::from(
            "timestamp,relative_time_sec,marker,event_type,phase_name,trial_index,participant,additional_data\n",
        );
        for record in &self.records {
            let d = &record.details;
            let additional = d
                .additional_data
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(";");
            let row = [
                format!("{:.6}", record.timestamp.timestamp_micros() as f64 / 1e6),
                format!("{:.3}", record.elapsed.as_secs_f64()),
                record.marker.to_string(),
                d.event_type.clone().unwrap_or_default(),
                d.phase_name.clone().unwrap_or_default(),
                d.trial_index.map(|t| t.to_string()).unwrap_or_default(),
                d.participant.map(|p| p.number().to_string()).unwrap_or_default(),
                additional,
            ];
            let fields: Vec<String> = row.iter().map(|f| csv_field(f)).collect();
            out.push_str(&fields.join(","));
            out.push('\n');
        }

        std::fs::write(path, out)?;
        tracing::info!("Exported {} markers to {}", self.records.len(), path.display());
        Ok(())
    }

    /// Totals, frequency table, event breakdown and trial coverage
    pub fn export_summary(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        std::fs::write(path, self.summary())?;
        tracing::info!("Exported marker summary to {}", path.display());
        Ok(())
    }

    pub fn summary(&self) -> String {
        let rule = "-".repeat(50);
        let mut out = String::new();
        let _ = writeln!(out, "Marker Log Summary");
        let _ = writeln!(out, "Session ID: {}", self.session_id);
        let _ = writeln!(out, "Session Start: {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(out);

        let counts = self.counts();
        let _ = writeln!(out, "Total Events: {}", self.records.len());
        let _ = writeln!(out, "Unique Markers: {}", counts.len());
        let _ = writeln!(out);

        let _ = writeln!(out, "Marker Frequency:");
        let _ = writeln!(out, "{}", rule);
        for (marker, count) in by_count_desc(counts) {
            let _ = writeln!(out, "  {}: {} occurrences", marker, count);
        }
        let _ = writeln!(out);

        let mut event_types: BTreeMap<String, usize> = BTreeMap::new();
        for record in &self.records {
            if let Some(event) = &record.details.event_type {
                *event_types.entry(event.clone()).or_insert(0) += 1;
            }
        }
        if !event_types.is_empty() {
            let _ = writeln!(out, "Event Type Breakdown:");
            let _ = writeln!(out, "{}", rule);
            for (event, count) in by_count_desc(event_types) {
                let _ = writeln!(out, "  {}: {} events", event, count);
            }
            let _ = writeln!(out);
        }

        let trials: BTreeSet<i64> = self.records.iter().filter_map(|r| r.details.trial_index).collect();
        if !trials.is_empty() {
            let list: Vec<String> = trials.iter().map(i64::to_string).collect();
            let _ = writeln!(out, "Trial Coverage:");
            let _ = writeln!(out, "{}", rule);
            let _ = writeln!(out, "  Trials with markers: [{}]", list.join(", "));
            let _ = writeln!(out, "  Total trials: {}", trials.len());
            let _ = writeln!(out);
        }
        out
    }

    /// Write `<session>_markers.csv` and `<session>_summary.txt` into `dir`
    pub fn export_all(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let csv = dir.join(format!("{}_markers.csv", self.session_id));
        let summary = dir.join(format!("{}_summary.txt", self.session_id));
        self.export_csv(&csv)?;
        self.export_summary(&summary)?;
        Ok((csv, summary))
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Highest count first, ties in key order
fn by_count_desc<K: Ord>(counts: BTreeMap<K, usize>) -> Vec<(K, usize)> {
    let mut entries: Vec<(K, usize)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries
}
