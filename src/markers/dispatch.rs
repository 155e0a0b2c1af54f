//! Resolving bindings for an event and delivering the markers
//!
//! The outlet that actually carries markers to the recorder lives outside
//! this crate; [`MarkerSink`] is the seam. A resolution failure only drops
//! that binding's marker, the rest of the event still goes out.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use crate::error::MarkerError;
use crate::markers::binding::{MarkerBinding, Participant, ParticipantScope};
use crate::markers::catalog::MarkerCatalog;
use crate::markers::log::{MarkerLog, RecordDetails};
use crate::markers::template::{format_marker_display, ContextValue, Marker, TrialContext};

/// Destination for resolved markers
pub trait MarkerSink: Send + Sync {
    fn send(&self, marker: &Marker) -> Result<(), MarkerError>;
}

/// Hands markers with their send instant to an outlet thread
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<(Marker, Instant)>,
}

impl ChannelSink {
    pub fn new(tx: Sender<(Marker, Instant)>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, Receiver<(Marker, Instant)>) {
        let (tx, rx) = unbounded();
        (Self::new(tx), rx)
    }
}

impl MarkerSink for ChannelSink {
    fn send(&self, marker: &Marker) -> Result<(), MarkerError> {
        self.tx
            .send((marker.clone(), Instant::now()))
            .map_err(|_| MarkerError::Delivery("marker outlet closed".to_string()))
    }
}

/// Something that happened during a phase
#[derive(Debug, Clone, PartialEq)]
pub struct EventOccurrence {
    pub event_type: String,
    /// `None` for shared events such as a phase start
    pub participant: Option<Participant>,
    pub response: Option<i64>,
    pub phase_name: Option<String>,
}

impl EventOccurrence {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            participant: None,
            response: None,
            phase_name: None,
        }
    }

    pub fn for_participant(mut self, participant: Participant) -> Self {
        self.participant = Some(participant);
        self
    }

    pub fn with_response(mut self, response: i64) -> Self {
        self.response = Some(response);
        self
    }

    pub fn in_phase(mut self, phase_name: impl Into<String>) -> Self {
        self.phase_name = Some(phase_name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingFailure {
    pub binding: String,
    pub error: MarkerError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutcome {
    pub delivered: Vec<Marker>,
    pub failures: Vec<BindingFailure>,
}

impl DispatchOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Bindings of one phase plus where their markers go
pub struct MarkerDispatcher {
    bindings: Vec<MarkerBinding>,
    sink: Arc<dyn MarkerSink>,
    catalog: Option<Arc<MarkerCatalog>>,
    log: Option<Arc<Mutex<MarkerLog>>>,
}

impl MarkerDispatcher {
    pub fn new(sink: Arc<dyn MarkerSink>) -> Self {
        Self {
            bindings: Vec::new(),
            sink,
            catalog: None,
            log: None,
        }
    }

    pub fn with_bindings(mut self, bindings: Vec<MarkerBinding>) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<MarkerCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_log(mut self, log: Arc<Mutex<MarkerLog>>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn add_binding(&mut self, binding: MarkerBinding) {
        self.bindings.push(binding);
    }

    pub fn bindings(&self) -> &[MarkerBinding] {
        &self.bindings
    }

    /// Resolve and deliver every binding matching `event`
    pub fn emit(&self, event: &EventOccurrence, context: &TrialContext) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        for binding in &self.bindings {
            if binding.event_type() != event.event_type || !binding.applies_to(event.participant) {
                continue;
            }

            let marker = match binding.resolve(context, event.response) {
                Ok(marker) => marker,
                Err(e) => {
                    tracing::error!("Marker for {} not sent: {}", binding, e);
                    outcome.failures.push(BindingFailure {
                        binding: binding.to_string(),
                        error: e,
                    });
                    continue;
                }
            };

            if let Err(e) = self.sink.send(&marker) {
                tracing::error!("Marker {} not delivered: {}", marker, e);
                outcome.failures.push(BindingFailure {
                    binding: binding.to_string(),
                    error: e,
                });
                continue;
            }

            let name = self.catalog.as_ref().map(|c| c.name_of(&marker));
            tracing::info!(
                "Marker sent: {} ({})",
                format_marker_display(&marker, name.as_deref()),
                event.event_type
            );

            if let Some(log) = &self.log {
                let participant = event.participant.or(match binding.scope() {
                    ParticipantScope::Only(p) => Some(p),
                    ParticipantScope::Both => None,
                });
                let trial_index = match context.trial_index() {
                    Some(ContextValue::Int(t)) => Some(*t),
                    _ => None,
                };
                let mut details = RecordDetails {
                    event_type: Some(event.event_type.clone()),
                    phase_name: event.phase_name.clone(),
                    trial_index,
                    participant,
                    ..RecordDetails::default()
                };
                if let Some(response) = event.response {
                    details
                        .additional_data
                        .insert("response".to_string(), response.to_string());
                }
                log.lock().record(marker.clone(), details);
            }

            outcome.delivered.push(marker);
        }

        outcome
    }
}
