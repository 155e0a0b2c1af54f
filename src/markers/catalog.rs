//! Named marker definitions
//!
//! Integer markers are keyed by base code, string markers by template. The
//! catalog is an ordinary value owned by the session; nothing here is global.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{MarkerError, Result};
use crate::markers::template::{Marker, MarkerTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    Integer,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerDefinition {
    pub name: String,
    pub description: String,
    pub template: Option<String>,
    pub code: Option<i64>,
    pub kind: MarkerKind,
}

impl MarkerDefinition {
    pub fn integer(name: &str, description: &str, code: i64) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            template: None,
            code: Some(code),
            kind: MarkerKind::Integer,
        }
    }

    pub fn string(name: &str, description: &str, template: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            template: Some(template.to_string()),
            code: None,
            kind: MarkerKind::String,
        }
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }

    /// Codebook line, `100#: Trial begin`
    fn codebook_line(&self) -> String {
        let key = match (&self.template, self.code) {
            (Some(t), _) => t.clone(),
            (None, Some(code)) => code.to_string(),
            (None, None) => self.name.clone(),
        };
        format!("{}: {}", key, self.description)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarkerCatalog {
    integers: BTreeMap<i64, MarkerDefinition>,
    strings: BTreeMap<String, MarkerDefinition>,
}

impl MarkerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lab's standard code book
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        let defaults = [
            MarkerDefinition::integer("Headset B16 to P1", "Participant 1 assigned headset B16", 9161),
            MarkerDefinition::integer(
                "Headset B16 to P2",
                "Participant 1 assigned other headset, P2 is B16",
                9162,
            ),
            MarkerDefinition::integer("Baseline Start", "Baseline fixation cross start", 8888),
            MarkerDefinition::integer("Baseline End", "Baseline fixation cross end", 9999),
            MarkerDefinition::integer("Trial Start", "Trial begin (all trials start simultaneously)", 1000)
                .with_template("100#"),
            MarkerDefinition::integer("P1 Video End", "Video playback end for participant 1", 2100)
                .with_template("210#"),
            MarkerDefinition::integer("P2 Video End", "Video playback end for participant 2", 2200)
                .with_template("220#"),
            MarkerDefinition::integer("P1 Rating", "Rating response for participant 1 (trial + rating)", 30000)
                .with_template("300#0$"),
            MarkerDefinition::integer("P2 Rating", "Rating response for participant 2 (trial + rating)", 50000)
                .with_template("500#0$"),
        ];
        for definition in defaults {
            if let Some(code) = definition.code {
                catalog.integers.insert(code, definition);
            }
        }
        catalog
    }

    /// Add a definition. `Ok(false)` when its key is already taken.
    pub fn add(&mut self, definition: MarkerDefinition) -> std::result::Result<bool, MarkerError> {
        if let Some(template) = &definition.template {
            MarkerTemplate::parse(template)?;
        }

        match definition.kind {
            MarkerKind::String => {
                let template = definition.template.clone().ok_or_else(|| MarkerError::Syntax {
                    template: definition.name.clone(),
                    reason: "string markers need a template".to_string(),
                })?;
                if self.strings.contains_key(&template) {
                    return Ok(false);
                }
                self.strings.insert(template, definition);
            }
            MarkerKind::Integer => {
                let code = definition.code.ok_or_else(|| MarkerError::Syntax {
                    template: definition.name.clone(),
                    reason: "integer markers need a code".to_string(),
                })?;
                if self.integers.contains_key(&code) {
                    return Ok(false);
                }
                self.integers.insert(code, definition);
            }
        }
        Ok(true)
    }

    /// Remove by code (integer) or template (text)
    pub fn remove(&mut self, key: &Marker) -> Option<MarkerDefinition> {
        match key {
            Marker::Int(code) => self.integers.remove(code),
            Marker::Text(template) => self.strings.remove(template),
        }
    }

    pub fn get(&self, key: &Marker) -> Option<&MarkerDefinition> {
        match key {
            Marker::Int(code) => self.integers.get(code),
            Marker::Text(template) => self.strings.get(template),
        }
    }

    pub fn find_by_template(&self, template: &str) -> Option<&MarkerDefinition> {
        self.integers
            .values()
            .find(|d| d.template.as_deref() == Some(template))
            .or_else(|| self.strings.get(template))
    }

    /// Catalog name, or the marker itself when unnamed
    pub fn name_of(&self, marker: &Marker) -> String {
        self.get(marker)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| marker.to_string())
    }

    /// Integers by code, then strings by name
    pub fn definitions(&self) -> Vec<&MarkerDefinition> {
        let mut strings: Vec<&MarkerDefinition> = self.strings.values().collect();
        strings.sort_by(|a, b| a.name.cmp(&b.name));
        self.integers.values().chain(strings).collect()
    }

    pub fn len(&self) -> usize {
        self.integers.len() + self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.integers.is_empty() && self.strings.is_empty()
    }

    /// Render the catalog in the lab's CodeBook.txt layout
    pub fn codebook(&self) -> String {
        let mut lines: Vec<String> = vec![
            "INTEGER MARKERS".to_string(),
            "# denotes changing integer based on trial number or participant rating response".to_string(),
            "$ denotes rating value (1-7)".to_string(),
            String::new(),
        ];

        let mut headsets = Vec::new();
        let mut baseline = Vec::new();
        let mut trials = Vec::new();
        let mut videos = Vec::new();
        let mut ratings = Vec::new();
        let mut other = Vec::new();

        for definition in self.integers.values() {
            let line = definition.codebook_line();
            let template = definition.template.as_deref().unwrap_or("");
            match definition.code {
                Some(9161) | Some(9162) => headsets.push(line),
                Some(8888) | Some(9999) => baseline.push(line),
                _ if template.starts_with("100") => trials.push(line),
                _ if template.starts_with('2') => videos.push(line),
                _ if template.starts_with("300") || template.starts_with("500") => ratings.push(line),
                _ => other.push(line),
            }
        }

        let has_ratings = !ratings.is_empty();
        for section in [headsets, baseline, trials, videos, ratings, other] {
            if !section.is_empty() {
                lines.extend(section);
                lines.push(String::new());
            }
        }
        if has_ratings {
            lines.push("example: 300507, a 7 rating for trial 5 in participant 1".to_string());
            lines.push(String::new());
        }

        if !self.strings.is_empty() {
            lines.push(String::new());
            lines.push("STRING MARKERS".to_string());
            lines.push("{variable} denotes template variable (e.g., type, condition)".to_string());
            lines.push(String::new());
            let mut strings: Vec<&MarkerDefinition> = self.strings.values().collect();
            strings.sort_by(|a, b| a.name.cmp(&b.name));
            lines.extend(strings.iter().map(|d| d.codebook_line()));
            lines.push(String::new());
            lines.push("example: {type}_start with type='happy' -> 'happy_start'".to_string());
            lines.push(String::new());
        }

        lines.join("\n")
    }

    pub fn export_codebook(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.codebook())?;
        tracing::info!("Exported codebook with {} markers to {}", self.len(), path.display());
        Ok(())
    }
}
