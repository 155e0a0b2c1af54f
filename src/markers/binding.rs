//! Event to marker bindings

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MarkerError;
use crate::markers::template::{Marker, MarkerTemplate, TrialContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Participant {
    One,
    Two,
}

impl Participant {
    pub fn number(self) -> u8 {
        match self {
            Participant::One => 1,
            Participant::Two => 2,
        }
    }
}

impl TryFrom<u8> for Participant {
    type Error = MarkerError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(Participant::One),
            2 => Ok(Participant::Two),
            other => Err(MarkerError::InvalidParticipant(other)),
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.number())
    }
}

/// Which participants' events a binding reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParticipantScope {
    #[default]
    Both,
    Only(Participant),
}

impl ParticipantScope {
    fn from_number(n: Option<u8>) -> Result<Self, MarkerError> {
        match n {
            None => Ok(ParticipantScope::Both),
            Some(n) => Participant::try_from(n).map(ParticipantScope::Only),
        }
    }

    fn number(self) -> Option<u8> {
        match self {
            ParticipantScope::Both => None,
            ParticipantScope::Only(p) => Some(p.number()),
        }
    }
}

/// "When `event_type` occurs, send this template's marker"
///
/// The template is validated on construction, including deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBinding", into = "RawBinding")]
pub struct MarkerBinding {
    event_type: String,
    template: MarkerTemplate,
    scope: ParticipantScope,
}

#[derive(Serialize, Deserialize)]
struct RawBinding {
    event_type: String,
    marker_template: String,
    #[serde(default)]
    participant: Option<u8>,
}

impl TryFrom<RawBinding> for MarkerBinding {
    type Error = MarkerError;

    fn try_from(raw: RawBinding) -> Result<Self, Self::Error> {
        let scope = ParticipantScope::from_number(raw.participant)?;
        MarkerBinding::new(raw.event_type, &raw.marker_template, scope)
    }
}

impl From<MarkerBinding> for RawBinding {
    fn from(binding: MarkerBinding) -> Self {
        RawBinding {
            participant: binding.scope.number(),
            marker_template: binding.template.as_str().to_string(),
            event_type: binding.event_type,
        }
    }
}

impl MarkerBinding {
    pub fn new(
        event_type: impl Into<String>,
        template: &str,
        scope: ParticipantScope,
    ) -> Result<Self, MarkerError> {
        Ok(Self {
            event_type: event_type.into(),
            template: MarkerTemplate::parse(template)?,
            scope,
        })
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn template(&self) -> &MarkerTemplate {
        &self.template
    }

    pub fn scope(&self) -> ParticipantScope {
        self.scope
    }

    /// Whether an event fired by `firing` should emit this binding's marker.
    ///
    /// An event with no participant is shared and reaches every scope.
    pub fn applies_to(&self, firing: Option<Participant>) -> bool {
        match (self.scope, firing) {
            (ParticipantScope::Both, _) | (_, None) => true,
            (ParticipantScope::Only(want), Some(got)) => want == got,
        }
    }

    pub fn resolve(&self, context: &TrialContext, response: Option<i64>) -> Result<Marker, MarkerError> {
        self.template.resolve(context, response)
    }
}

impl fmt::Display for MarkerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.event_type, self.template)?;
        if let ParticipantScope::Only(p) = self.scope {
            write!(f, " [{}]", p)?;
        }
        Ok(())
    }
}
