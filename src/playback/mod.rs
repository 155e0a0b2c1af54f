//! Playback units and the sync coordinator

pub mod coordinator;
pub mod report;
pub mod unit;

pub use coordinator::{PendingSync, SyncCoordinator};
pub use report::{verify_sync, SyncReport, SyncTelemetry};
pub use unit::{prepare_all, PlaybackUnit, StartTicket, UnitStatus};
