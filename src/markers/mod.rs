//! Event-marker protocol
//!
//! Templates encode trial number, participant and response into the codes
//! sent to the physiological recorder. Bindings attach templates to executor
//! events; the dispatcher resolves and delivers them.

pub mod binding;
pub mod catalog;
pub mod dispatch;
pub mod log;
pub mod template;

pub use binding::{MarkerBinding, Participant, ParticipantScope};
pub use catalog::{MarkerCatalog, MarkerDefinition, MarkerKind};
pub use dispatch::{BindingFailure, ChannelSink, DispatchOutcome, EventOccurrence, MarkerDispatcher, MarkerSink};
pub use log::{MarkerLog, MarkerRecord, RecordDetails};
pub use template::{
    describe, format_marker_display, resolve, validate_syntax, ContextValue, Marker, MarkerTemplate,
    TemplateKind, TrialContext,
};
