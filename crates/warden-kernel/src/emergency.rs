//! [`EmergencyCoordinator`] – owns the active emergency and the drivetrain.
//!
//! At most one emergency is active at a time.  While idle, the coordinator
//! holds the [`Drivetrain`] and lends it to the arbiter through
//! [`EmergencyCoordinator::drivetrain`].  When a hazard that owns the
//! actuator activates, the drivetrain is *moved* into the recovery task and
//! only comes back through the task's join handle, after the task has forced
//! the motors to neutral.  Two writers can therefore never exist at once.
//!
//! # Supersession
//!
//! A newly classified hazard replaces the active one unless the active kind
//! outranks it (`ManualStop > CollisionFront > EdgeDetected >
//! ClientDisconnected > LowBattery`).  The same kind again is a no-op.  The
//! old task is cancelled and awaited before the new one starts.  Manual
//! triggers bypass the rank check, except that an active `ManualStop` is
//! only ever ended by an explicit clear.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_hal::Drivetrain;
use warden_types::{HazardKind, Notification, SafetyConfig, SensorSnapshot, WardenError};

use crate::recovery::{RecoveryOutcome, RecoveryReport, RecoveryRoutine, TickSample, run_recovery};

// ────────────────────────────────────────────────────────────────────────────
// Types
// ────────────────────────────────────────────────────────────────────────────

/// Inputs captured when a recovery routine starts.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub config: SafetyConfig,
    /// Speed the arbiter was commanding when the hazard fired.
    pub commanded_speed: f32,
}

struct ActiveEmergency {
    kind: HazardKind,
    started_at: Instant,
    cancel: CancellationToken,
    task: JoinHandle<RecoveryReport>,
}

/// A recovery that ended on its own, collected by
/// [`EmergencyCoordinator::reap`].
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedRecovery {
    pub kind: HazardKind,
    pub outcome: RecoveryOutcome,
    pub notification: Notification,
}

// ────────────────────────────────────────────────────────────────────────────
// EmergencyCoordinator
// ────────────────────────────────────────────────────────────────────────────

pub struct EmergencyCoordinator {
    drivetrain: Option<Drivetrain>,
    active: Option<ActiveEmergency>,
    samples: watch::Sender<TickSample>,
}

impl EmergencyCoordinator {
    pub fn new(drivetrain: Drivetrain) -> Self {
        let first = TickSample::new(SensorSnapshot::default(), false, Instant::now());
        let (samples, _) = watch::channel(first);
        Self {
            drivetrain: Some(drivetrain),
            active: None,
            samples,
        }
    }

    /// Publish this tick's readings to the running recovery task.
    pub fn publish(&self, sample: TickSample) {
        self.samples.send_replace(sample);
    }

    pub fn active_kind(&self) -> Option<HazardKind> {
        self.active.as_ref().map(|a| a.kind)
    }

    pub fn active_since(&self) -> Option<Instant> {
        self.active.as_ref().map(|a| a.started_at)
    }

    /// Write capability for the arbiter.  `None` while a recovery routine
    /// holds the drivetrain.
    pub fn drivetrain(&mut self) -> Option<&mut Drivetrain> {
        self.drivetrain.as_mut()
    }

    /// Activate `kind` from hazard classification, subject to rank.
    ///
    /// Returns the notifications produced: the superseded kind's clearance
    /// (if any) followed by the new activation.  Empty when nothing changed.
    pub async fn activate(&mut self, kind: HazardKind, ctx: RecoveryContext) -> Vec<Notification> {
        if let Some(active) = &self.active {
            if active.kind == kind {
                return Vec::new();
            }
            if active.kind.rank() > kind.rank() {
                debug!(active = %active.kind, ignored = %kind, "lower-ranked hazard ignored");
                return Vec::new();
            }
        }
        self.start(kind, ctx).await
    }

    /// Operator-forced activation of `kind`; replaces whatever is active
    /// other than a `ManualStop`.
    ///
    /// # Errors
    ///
    /// [`WardenError::InvalidCommand`] when a `ManualStop` is active and
    /// `kind` is something else.  The stop keeps holding.
    pub async fn trigger_manual(
        &mut self,
        kind: HazardKind,
        ctx: RecoveryContext,
    ) -> Result<Vec<Notification>, WardenError> {
        match self.active_kind() {
            Some(active) if active == kind => return Ok(Vec::new()),
            Some(HazardKind::ManualStop) => {
                warn!(requested = %kind, "manual stop active; trigger refused until cleared");
                return Err(WardenError::InvalidCommand(format!(
                    "manual stop is active; clear it before triggering {kind}"
                )));
            }
            _ => {}
        }
        info!(%kind, "manual emergency trigger");
        Ok(self.start(kind, ctx).await)
    }

    /// Cancel the active emergency and wait for its cleanup.
    ///
    /// # Errors
    ///
    /// [`WardenError::InvalidCommand`] when no emergency is active.
    pub async fn clear(&mut self) -> Result<Notification, WardenError> {
        let Some(active) = self.active.take() else {
            return Err(WardenError::InvalidCommand(
                "no active emergency to clear".to_string(),
            ));
        };
        let kind = active.kind;
        self.cancel_and_reclaim(active).await;
        info!(%kind, "emergency cleared by operator");
        Ok(Notification::cleared(kind))
    }

    /// Collect a recovery task that has finished on its own.
    pub async fn reap(&mut self) -> Option<FinishedRecovery> {
        if !self.active.as_ref().is_some_and(|a| a.task.is_finished()) {
            return None;
        }
        let active = self.active.take()?;
        let kind = active.kind;
        let outcome = match active.task.await {
            Ok(report) => {
                self.reclaim(report.drivetrain);
                report.outcome
            }
            Err(e) => self.task_lost(kind, &e),
        };
        info!(%kind, ?outcome, "emergency ended");
        Some(FinishedRecovery {
            kind,
            outcome,
            notification: Notification::cleared(kind),
        })
    }

    /// Cancel any active recovery and leave the drivetrain at neutral.
    pub async fn shutdown(&mut self) {
        if let Some(active) = self.active.take() {
            self.cancel_and_reclaim(active).await;
        }
        if let Some(dt) = self.drivetrain.as_mut() {
            if let Err(e) = dt.stop() {
                error!(error = %e, "failed to stop drivetrain on shutdown");
            }
        }
    }

    async fn start(&mut self, kind: HazardKind, ctx: RecoveryContext) -> Vec<Notification> {
        let mut notes = Vec::with_capacity(2);
        if let Some(previous) = self.active.take() {
            let old = previous.kind;
            self.cancel_and_reclaim(previous).await;
            info!(from = %old, to = %kind, "emergency superseded");
            notes.push(Notification::cleared(old));
        }

        let drivetrain = if kind.owns_actuator() {
            let leased = self.drivetrain.take();
            if leased.is_none() {
                warn!(%kind, "drivetrain unavailable for recovery");
            }
            leased
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let routine = RecoveryRoutine {
            kind,
            config: ctx.config,
            commanded_speed: ctx.commanded_speed,
            samples: self.samples.subscribe(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run_recovery(routine, drivetrain));
        self.active = Some(ActiveEmergency {
            kind,
            started_at: Instant::now(),
            cancel,
            task,
        });
        info!(%kind, "emergency activated");
        notes.push(Notification::activated(kind));
        notes
    }

    async fn cancel_and_reclaim(&mut self, active: ActiveEmergency) {
        active.cancel.cancel();
        match active.task.await {
            Ok(report) => self.reclaim(report.drivetrain),
            Err(e) => {
                self.task_lost(active.kind, &e);
            }
        }
    }

    fn reclaim(&mut self, drivetrain: Option<Drivetrain>) {
        if drivetrain.is_some() {
            self.drivetrain = drivetrain;
        }
    }

    fn task_lost(&self, kind: HazardKind, e: &tokio::task::JoinError) -> RecoveryOutcome {
        error!(%kind, error = %e, "recovery task lost; drivetrain not returned");
        RecoveryOutcome::Faulted(WardenError::RecoveryFault {
            kind,
            details: e.to_string(),
        })
    }
}

impl std::fmt::Debug for EmergencyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyCoordinator")
            .field("active", &self.active_kind())
            .field("drivetrain_available", &self.drivetrain.is_some())
            .finish()
    }
}
