//! Batch arm/trigger and deferred verification
//!
//! Neither call blocks. Start commands and the verification callback are
//! queued on the main loop, which must keep running for either to happen.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

use crate::clock::{signed_ms, Clock, LoopHandle};
use crate::config::{SyncConfig, TimingConfig};
use crate::error::SyncError;
use crate::playback::report::{verify_sync, SyncReport, SyncTelemetry};
use crate::playback::unit::{Launch, PlaybackUnit, UnitStatus};

/// Verification result that arrives after the batch has started
#[derive(Debug)]
pub struct PendingSync {
    /// Shared start instant; `None` for an empty batch
    target: Option<Instant>,
    /// Filled by the verification callback on the main loop
    rx: Option<Receiver<SyncReport>>,
    /// Report once received
    report: Option<SyncReport>,
}

impl PendingSync {
    fn scheduled(target: Instant, rx: Receiver<SyncReport>) -> Self {
        Self {
            target: Some(target),
            rx: Some(rx),
            report: None,
        }
    }

    fn ready(report: SyncReport) -> Self {
        Self {
            target: report.target,
            rx: None,
            report: Some(report),
        }
    }

    /// Shared start instant, absent for an empty batch
    pub fn target(&self) -> Option<Instant> {
        self.target
    }

    /// The report if verification has run
    pub fn try_report(&mut self) -> Option<&SyncReport> {
        if self.report.is_none() {
            if let Some(rx) = &self.rx {
                match rx.try_recv() {
                    Ok(report) => self.report = Some(report),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
                }
            }
        }
        self.report.as_ref()
    }

    /// Block until the report arrives.
    ///
    /// Deadlocks when called on the thread that drives the main loop; use
    /// [`PendingSync::try_report`] there.
    pub fn wait(&mut self, timeout: Duration) -> Option<&SyncReport> {
        if self.report.is_none() {
            if let Some(rx) = &self.rx {
                match rx.recv_timeout(timeout) {
                    Ok(report) => self.report = Some(report),
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
                }
            }
        }
        self.report.as_ref()
    }
}

/// Starts groups of units together
pub struct SyncCoordinator {
    /// Source of targets and start instants
    clock: Clock,
    /// Tolerances, thresholds and verification delay
    timing: TimingConfig,
    /// Main loop that runs video starts and verification
    handle: LoopHandle,
    /// Every report this coordinator produced
    telemetry: SyncTelemetry,
}

impl SyncCoordinator {
    pub fn new(timing: TimingConfig, handle: LoopHandle) -> Self {
        Self {
            clock: Clock::new(&timing),
            timing,
            handle,
            telemetry: SyncTelemetry::new(),
        }
    }

    pub fn from_config(config: &SyncConfig, handle: LoopHandle) -> Self {
        Self::new(config.timing.clone(), handle)
    }

    /// Share telemetry with another coordinator or the session
    pub fn with_telemetry(mut self, telemetry: SyncTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn telemetry(&self) -> &SyncTelemetry {
        &self.telemetry
    }

    /// Arm every prepared unit to one target `prep_time` from now and trigger.
    ///
    /// The target comes from a single clock read. An empty batch yields an
    /// unsuccessful report instead of an error.
    pub fn play_synchronized(
        &self,
        units: &mut [PlaybackUnit],
        prep_time: Duration,
    ) -> Result<PendingSync, SyncError> {
        if units.is_empty() {
            tracing::warn!("play_synchronized called with no units");
            return Ok(self.empty_batch());
        }

        for unit in units.iter() {
            if unit.status() != UnitStatus::Ready {
                return Err(SyncError::InvalidState {
                    unit: unit.label().to_string(),
                    expected: "ready",
                    found: unit.status().to_string(),
                });
            }
        }

        let base = self.clock.now();
        let target = self.clock.target_from(base, prep_time);
        for unit in units.iter_mut() {
            unit.arm(target)?;
        }

        self.trigger_synchronized(units)
    }

    /// Start units armed earlier by the caller.
    ///
    /// Every unit must be armed within the arm tolerance of unit 0; otherwise
    /// nothing starts. Audio threads are spawned immediately and wait for the
    /// target themselves. All video starts run inside one main-loop callback.
    pub fn trigger_synchronized(&self, units: &mut [PlaybackUnit]) -> Result<PendingSync, SyncError> {
        if units.is_empty() {
            tracing::warn!("trigger_synchronized called with no units");
            return Ok(self.empty_batch());
        }

        let target = self.check_armed(units)?;

        let mut launches = Vec::with_capacity(units.len());
        for unit in units.iter_mut() {
            launches.push(unit.begin_playing()?);
        }

        tracing::info!(
            "Triggering {} units at {:+.3}ms",
            launches.len(),
            signed_ms(target, self.clock.now())
        );

        for launch in &launches {
            if let Err(e) = launch.spawn_audio(self.clock) {
                tracing::error!("Aborting batch: {}", e);
                for launch in &launches {
                    launch.cancel();
                }
                for unit in units.iter_mut() {
                    unit.stop();
                }
                return Err(e);
            }
        }

        let clock = self.clock;
        let video_launches = launches.clone();
        self.handle.schedule_at(target, move || {
            for launch in &video_launches {
                launch.start_video(&clock);
            }
        });

        Ok(self.schedule_verification(target, launches))
    }

    /// Target shared by the batch, or the first consistency violation
    fn check_armed(&self, units: &[PlaybackUnit]) -> Result<Instant, SyncError> {
        let reference = units
            .first()
            .and_then(PlaybackUnit::armed_at)
            .ok_or(SyncError::NotArmed { index: 0 })?;
        let tolerance_ms = self.timing.arm_tolerance_ms;

        for (index, unit) in units.iter().enumerate().skip(1) {
            let at = unit.armed_at().ok_or(SyncError::NotArmed { index })?;
            let diff_ms = signed_ms(at, reference);
            if diff_ms.abs() > tolerance_ms {
                tracing::error!(
                    "Desynchronized batch: {} armed {:+.3}ms from {}",
                    unit.label(),
                    diff_ms,
                    units[0].label()
                );
                return Err(SyncError::Desynchronized { index, diff_ms });
            }
        }
        Ok(reference)
    }

    fn schedule_verification(&self, target: Instant, launches: Vec<Launch>) -> PendingSync {
        let (tx, rx) = bounded(1);
        let telemetry = self.telemetry.clone();
        let threshold_ms = self.timing.success_threshold_ms;

        self.handle
            .schedule_at(target + self.timing.verification_delay(), move || {
                let labels: Vec<String> = launches.iter().map(|l| l.label().to_string()).collect();
                let video: Vec<Option<Instant>> = launches.iter().map(Launch::video_start).collect();
                let audio: Vec<Option<Instant>> = launches.iter().map(Launch::audio_start).collect();

                let report = verify_sync(&labels, &video, &audio, target, threshold_ms);
                telemetry.record(report.clone());
                let _ = tx.send(report);
            });

        PendingSync::scheduled(target, rx)
    }

    fn empty_batch(&self) -> PendingSync {
        let report = SyncReport::empty();
        self.telemetry.record(report.clone());
        PendingSync::ready(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MainLoop;
    use crate::media::mock::{MockBackend, MockFailure};
    use std::sync::Arc;

    fn prepared_pair(dir: &tempfile::TempDir) -> Vec<PlaybackUnit> {
        prepared_pair_on(dir, Arc::new(MockBackend::new(Duration::from_millis(300))))
    }

    fn prepared_pair_on(dir: &tempfile::TempDir, backend: Arc<MockBackend>) -> Vec<PlaybackUnit> {
        ["P1", "P2"]
            .iter()
            .map(|label| {
                let path = dir.path().join(format!("{}.mp4", label));
                std::fs::write(&path, b"").unwrap();
                let mut unit = PlaybackUnit::new(path, format!("output:{}", label), backend.clone())
                    .with_label(*label);
                unit.prepare().unwrap();
                unit
            })
            .collect()
    }

    #[test]
    fn test_empty_batch_reports_no_success() {
        let main_loop = MainLoop::new(Clock::default());
        let coordinator = SyncCoordinator::new(TimingConfig::default(), main_loop.handle());

        let mut pending = coordinator
            .play_synchronized(&mut [], Duration::from_millis(100))
            .unwrap();
        let report = pending.try_report().expect("empty batch reports immediately");
        assert!(!report.success);
        assert_eq!(report.units_total, 0);

        let mut pending = coordinator.trigger_synchronized(&mut []).unwrap();
        assert!(!pending.try_report().unwrap().success);
        assert_eq!(coordinator.telemetry().len(), 2);
    }

    #[test]
    fn test_desynchronized_batch_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut main_loop = MainLoop::new(Clock::default());
        let coordinator = SyncCoordinator::new(TimingConfig::default(), main_loop.handle());
        let mut units = prepared_pair(&dir);

        let target = Instant::now() + Duration::from_millis(100);
        units[0].arm(target).unwrap();
        units[1].arm(target + Duration::from_millis(2)).unwrap();

        let err = coordinator.trigger_synchronized(&mut units).unwrap_err();
        assert!(matches!(err, SyncError::Desynchronized { index: 1, .. }));
        for unit in &units {
            assert_eq!(unit.status(), UnitStatus::Armed);
        }
        assert_eq!(main_loop.pending(), 0);
    }

    #[test]
    fn test_unarmed_unit_rejected_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut main_loop = MainLoop::new(Clock::default());
        let coordinator = SyncCoordinator::new(TimingConfig::default(), main_loop.handle());
        let mut units = prepared_pair(&dir);
        units[0].arm(Instant::now() + Duration::from_millis(100)).unwrap();

        let err = coordinator.trigger_synchronized(&mut units).unwrap_err();
        assert!(matches!(err, SyncError::NotArmed { index: 1 }));
        assert_eq!(units[0].status(), UnitStatus::Armed);
        assert_eq!(main_loop.pending(), 0);
    }

    #[test]
    fn test_within_tolerance_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let mut main_loop = MainLoop::new(Clock::default());
        let coordinator = SyncCoordinator::new(TimingConfig::default(), main_loop.handle());
        let mut units = prepared_pair(&dir);

        let target = Instant::now() + Duration::from_millis(30);
        units[0].arm(target).unwrap();
        units[1].arm(target + Duration::from_micros(500)).unwrap();

        let pending = coordinator.trigger_synchronized(&mut units).unwrap();
        assert_eq!(pending.target(), Some(target));
        // one unified video callback plus verification
        assert_eq!(main_loop.pending(), 2);
        for unit in units.iter_mut() {
            unit.stop();
        }
    }

    #[test]
    fn test_two_phase_trigger_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Clock::default();
        let mut main_loop = MainLoop::new(clock);
        let coordinator = SyncCoordinator::new(TimingConfig::default(), main_loop.handle());
        let backend = Arc::new(MockBackend::new(Duration::from_millis(300)));
        let mut units = prepared_pair_on(&dir, backend.clone());

        let target = clock.target_after(Duration::from_millis(50));
        for unit in units.iter_mut() {
            unit.arm(target).unwrap();
        }

        let mut pending = coordinator.trigger_synchronized(&mut units).unwrap();
        for unit in &units {
            assert_eq!(unit.status(), UnitStatus::Playing);
            assert_eq!(unit.armed_at(), None);
        }

        main_loop.run_until(target + Duration::from_millis(150));

        let starts: Vec<Instant> = units
            .iter()
            .map(|u| u.actual_start().expect("unit did not start"))
            .collect();
        for start in &starts {
            assert!(signed_ms(*start, target).abs() < 5.0);
        }
        assert!(signed_ms(starts[1], starts[0]).abs() < 5.0);

        // each audio thread waited for the shared target on its own
        let audio_starts: Vec<Instant> = units
            .iter()
            .map(|u| u.audio_start().expect("audio did not start"))
            .collect();
        for start in &audio_starts {
            assert!(*start >= target);
            assert!(signed_ms(*start, target) < 5.0);
        }
        let recorded: Vec<Option<Instant>> = audio_starts.iter().copied().map(Some).collect();
        assert_eq!(backend.audio_starts(), recorded);

        let report = pending.try_report().expect("verification did not run");
        assert!(report.success, "report: {:?}", report);
        assert!(report.audio_ok);
        assert_eq!(report.units_started, 2);
        assert!(report.spread_ms < 5.0);
        for drift in &report.audio_drifts_ms {
            assert!(drift.expect("audio drift missing").abs() < 5.0);
        }
        assert_eq!(coordinator.telemetry().len(), 1);
    }

    #[test]
    fn test_failed_audio_is_recorded_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Clock::default();
        let mut main_loop = MainLoop::new(clock);
        let coordinator = SyncCoordinator::new(TimingConfig::default(), main_loop.handle());
        let backend = Arc::new(MockBackend::failing(MockFailure::DeadOutput));
        let mut units = prepared_pair_on(&dir, backend.clone());

        let mut pending = coordinator
            .play_synchronized(&mut units, Duration::from_millis(30))
            .unwrap();
        let target = pending.target().unwrap();
        main_loop.run_until(target + Duration::from_millis(150));

        let report = pending.try_report().expect("verification did not run");
        assert_eq!(report.units_started, 2);
        assert!(report.max_drift_ms < 5.0);
        assert_eq!(report.audio_drifts_ms, vec![None, None]);
        assert!(!report.audio_ok);
        assert!(!report.success);
        assert_eq!(backend.audio_starts(), vec![None, None]);
        assert_eq!(coordinator.telemetry().success_rate(), Some(0.0));
    }

    #[test]
    fn test_play_synchronized_shares_one_target() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Clock::default();
        let mut main_loop = MainLoop::new(clock);
        let coordinator = SyncCoordinator::new(TimingConfig::default(), main_loop.handle());
        let mut units = prepared_pair(&dir);

        let before = clock.now();
        let mut pending = coordinator
            .play_synchronized(&mut units, Duration::from_millis(40))
            .unwrap();
        assert!(clock.now() - before < Duration::from_millis(40), "call blocked");

        let target = pending.target().unwrap();
        assert_eq!(units[0].target(), Some(target));
        assert_eq!(units[1].target(), Some(target));

        main_loop.run_until(target + Duration::from_millis(150));
        assert!(pending.try_report().unwrap().success);
    }

    #[test]
    fn test_play_synchronized_requires_prepared_units() {
        let dir = tempfile::tempdir().unwrap();
        let main_loop = MainLoop::new(Clock::default());
        let coordinator = SyncCoordinator::new(TimingConfig::default(), main_loop.handle());
        let mut units = prepared_pair(&dir);
        units[1].stop();

        let err = coordinator
            .play_synchronized(&mut units, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { .. }));
        assert_eq!(units[0].status(), UnitStatus::Ready);
    }
}
