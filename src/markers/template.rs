//! Marker template grammar
//!
//! Four families, told apart by their special characters:
//!
//! | Family           | Example          | Result                                   |
//! |------------------|------------------|------------------------------------------|
//! | static           | `8888`           | integer if it parses, otherwise the text |
//! | counter          | `100#`           | `#` replaced by the trial index digits   |
//! | counter+response | `300#0$`         | `#` then `$` replaced, parsed as integer |
//! | named            | `{type}_start`   | `{name}` replaced from the context, text |
//!
//! Substitution is textual. Trial 12 in `100#` gives `10012`, not `112`, and
//! multi-digit values can make two different (trial, response) pairs encode
//! to the same code. That encoding is kept as is.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::MarkerError;

/// Context key holding the trial number
pub const TRIAL_INDEX_KEY: &str = "trial_index";

/// A resolved marker, ready for the outbound stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Marker {
    Int(i64),
    Text(String),
}

impl Marker {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Marker::Int(code) => Some(*code),
            Marker::Text(_) => None,
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::Int(code) => write!(f, "{}", code),
            Marker::Text(text) => f.write_str(text),
        }
    }
}

impl From<i64> for Marker {
    fn from(code: i64) -> Self {
        Marker::Int(code)
    }
}

impl From<&str> for Marker {
    fn from(text: &str) -> Self {
        Marker::Text(text.to_string())
    }
}

/// One trial variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::Int(v) => write!(f, "{}", v),
            // Debug keeps the fractional part on whole numbers ("3.0").
            ContextValue::Float(v) => write!(f, "{:?}", v),
            ContextValue::Bool(v) => write!(f, "{}", v),
            ContextValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        ContextValue::Int(v)
    }
}

impl From<u32> for ContextValue {
    fn from(v: u32) -> Self {
        ContextValue::Int(i64::from(v))
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Float(v)
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Bool(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        ContextValue::Text(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        ContextValue::Text(v)
    }
}

/// Variables of the current trial, typically one row of the trial list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialContext {
    values: BTreeMap<String, ContextValue>,
}

impl TrialContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trial_index(trial_index: i64) -> Self {
        Self::new().with(TRIAL_INDEX_KEY, trial_index)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn trial_index(&self) -> Option<&ContextValue> {
        self.get(TRIAL_INDEX_KEY)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<ContextValue>> FromIterator<(K, V)> for TrialContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut ctx = Self::new();
        for (k, v) in iter {
            ctx.set(k, v);
        }
        ctx
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Static,
    Counter,
    CounterResponse,
    Named,
}

/// A validated template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerTemplate {
    source: String,
    kind: TemplateKind,
    /// Variable names of a named template, in order of first appearance
    variables: Vec<String>,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Every `{word}` placeholder, left to right
fn placeholders(template: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let name_len = after
            .char_indices()
            .find(|(_, c)| !is_word_char(*c))
            .map(|(i, _)| i)
            .unwrap_or(after.len());
        if name_len > 0 && after[name_len..].starts_with('}') {
            found.push(&after[..name_len]);
            rest = &after[name_len + 1..];
        } else {
            rest = after;
        }
    }
    found
}

fn syntax(template: &str, reason: &str) -> MarkerError {
    MarkerError::Syntax {
        template: template.to_string(),
        reason: reason.to_string(),
    }
}

impl MarkerTemplate {
    /// Validate `template` and classify its family
    pub fn parse(template: &str) -> Result<Self, MarkerError> {
        let is_named = template.contains('{') && template.contains('}');
        let has_counter = template.contains('#') || template.contains('$');

        if is_named {
            let vars = placeholders(template);
            if vars.is_empty() {
                return Err(syntax(template, "string template must contain at least one {variable}"));
            }
            let mut remainder = template.to_string();
            for var in &vars {
                remainder = remainder.replace(&format!("{{{}}}", var), "");
            }
            if !remainder.chars().all(|c| is_word_char(c) || c == '-') {
                return Err(syntax(
                    template,
                    "string template can only contain alphanumerics, underscores, hyphens and {variables}",
                ));
            }

            let mut variables: Vec<String> = Vec::new();
            for var in vars {
                if !variables.iter().any(|v| v == var) {
                    variables.push(var.to_string());
                }
            }
            return Ok(Self {
                source: template.to_string(),
                kind: TemplateKind::Named,
                variables,
            });
        }

        if has_counter {
            if !template.chars().all(|c| c.is_ascii_digit() || c == '#' || c == '$') {
                return Err(syntax(template, "integer template must contain only digits, '#' and '$'"));
            }
            let hashes = template.matches('#').count();
            let dollars = template.matches('$').count();
            if hashes > 1 {
                return Err(syntax(template, "at most one '#' is allowed"));
            }
            if dollars > 1 {
                return Err(syntax(template, "at most one '$' is allowed"));
            }
            if dollars == 1 && hashes == 0 {
                return Err(syntax(template, "response '$' requires trial '#'"));
            }
            if template.replace(['#', '$'], "0").parse::<i64>().is_err() {
                return Err(syntax(template, "template must resolve to a valid integer"));
            }

            let kind = if dollars == 1 {
                TemplateKind::CounterResponse
            } else {
                TemplateKind::Counter
            };
            return Ok(Self {
                source: template.to_string(),
                kind,
                variables: Vec::new(),
            });
        }

        Ok(Self {
            source: template.to_string(),
            kind: TemplateKind::Static,
            variables: Vec::new(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Substitute `context` (and `response` for counter+response templates)
    pub fn resolve(&self, context: &TrialContext, response: Option<i64>) -> Result<Marker, MarkerError> {
        match self.kind {
            TemplateKind::Static => Ok(match self.source.trim().parse::<i64>() {
                Ok(code) => Marker::Int(code),
                Err(_) => Marker::Text(self.source.clone()),
            }),
            TemplateKind::Counter => {
                let trial = context
                    .trial_index()
                    .ok_or_else(|| MarkerError::MissingTrialIndex(self.source.clone()))?;
                self.to_int(self.source.replace('#', &trial.to_string()))
            }
            TemplateKind::CounterResponse => {
                let trial = context
                    .trial_index()
                    .ok_or_else(|| MarkerError::MissingTrialIndex(self.source.clone()))?;
                let response =
                    response.ok_or_else(|| MarkerError::MissingResponse(self.source.clone()))?;
                let digits = self
                    .source
                    .replace('#', &trial.to_string())
                    .replace('$', &response.to_string());
                self.to_int(digits)
            }
            TemplateKind::Named => {
                let missing: Vec<String> = self
                    .variables
                    .iter()
                    .filter(|v| !context.contains(v))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(MarkerError::MissingVariable {
                        template: self.source.clone(),
                        missing,
                    });
                }

                let mut text = self.source.clone();
                for var in &self.variables {
                    if let Some(value) = context.get(var) {
                        text = text.replace(&format!("{{{}}}", var), &value.to_string());
                    }
                }
                Ok(Marker::Text(text))
            }
        }
    }

    fn to_int(&self, digits: String) -> Result<Marker, MarkerError> {
        digits
            .parse::<i64>()
            .map(Marker::Int)
            .map_err(|_| MarkerError::NotAnInteger {
                template: self.source.clone(),
                value: digits,
            })
    }

    /// Human-readable summary for configuration screens
    pub fn describe(&self) -> String {
        match self.kind {
            TemplateKind::Static => format!("Static marker: {}", self.source),
            TemplateKind::Counter => {
                let samples: Vec<String> = (1..=3)
                    .map(|trial| {
                        self.resolve(&TrialContext::with_trial_index(trial), None)
                            .map(|m| m.to_string())
                            .unwrap_or_else(|_| "?".to_string())
                    })
                    .collect();
                format!("Trial-indexed: {}, ...", samples.join(", "))
            }
            TemplateKind::CounterResponse => format!(
                "Trial + Response: {}",
                self.source.replace('#', "[trial]").replace('$', "[response]")
            ),
            TemplateKind::Named => format!(
                "String template: {} (variables: {})",
                self.source,
                self.variables.join(", ")
            ),
        }
    }
}

impl fmt::Display for MarkerTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for MarkerTemplate {
    type Err = MarkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Check a template's structure without resolving it.
///
/// Does not know which variables a context will supply; that surfaces in
/// [`resolve`].
pub fn validate_syntax(template: &str) -> Result<TemplateKind, MarkerError> {
    MarkerTemplate::parse(template).map(|t| t.kind())
}

/// Validate and resolve in one step
pub fn resolve(template: &str, context: &TrialContext, response: Option<i64>) -> Result<Marker, MarkerError> {
    MarkerTemplate::parse(template)?.resolve(context, response)
}

/// Description of a template, or why it is invalid
pub fn describe(template: &str) -> String {
    match MarkerTemplate::parse(template) {
        Ok(parsed) => parsed.describe(),
        Err(e) => format!("Invalid template: {}", e),
    }
}

/// `"8888 - Baseline Start"`, or just the marker without a name
pub fn format_marker_display(marker: &Marker, name: Option<&str>) -> String {
    match name {
        Some(name) if !name.is_empty() => format!("{} - {}", marker, name),
        _ => marker.to_string(),
    }
}
