//! Recovery routines – one cancellable task body per [`HazardKind`].
//!
//! A routine runs as its own tokio task.  It sees the world only through
//! [`TickSample`]s published by the control loop on a `watch` channel, yields
//! once per poll interval, and checks its [`CancellationToken`] at every
//! yield.
//!
//! [`run_recovery`] is the task boundary.  Whatever the routine does (finish,
//! get cancelled, return an error, or panic), the drivetrain is forced to
//! neutral and handed back in the [`RecoveryReport`].

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use warden_hal::Drivetrain;
use warden_types::{HazardKind, MotionCommand, SafetyConfig, SensorSnapshot, WardenError};

// ────────────────────────────────────────────────────────────────────────────
// Shared tick data
// ────────────────────────────────────────────────────────────────────────────

/// What a recovery routine learns about the world each tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickSample {
    pub snapshot: SensorSnapshot,
    /// Operator heard from within `client_timeout_s`.
    pub client_live: bool,
    pub at: Instant,
}

impl TickSample {
    pub fn new(snapshot: SensorSnapshot, client_live: bool, at: Instant) -> Self {
        Self {
            snapshot,
            client_live,
            at,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Outcome
// ────────────────────────────────────────────────────────────────────────────

/// How a recovery task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// The hazard's clear condition was met.
    Cleared,
    /// Cancelled by supersession, manual clear, or shutdown.
    Cancelled,
    /// The routine returned an error or panicked.
    Faulted(WardenError),
}

/// Returned through the task's `JoinHandle`.
#[derive(Debug)]
pub struct RecoveryReport {
    pub kind: HazardKind,
    pub outcome: RecoveryOutcome,
    /// The leased drivetrain, back in the coordinator's hands.
    pub drivetrain: Option<Drivetrain>,
}

// ────────────────────────────────────────────────────────────────────────────
// Routine
// ────────────────────────────────────────────────────────────────────────────

/// Everything a routine needs, captured when it starts.
pub struct RecoveryRoutine {
    pub kind: HazardKind,
    pub config: SafetyConfig,
    /// Speed the arbiter was commanding when the hazard fired.
    pub commanded_speed: f32,
    pub samples: watch::Receiver<TickSample>,
    pub cancel: CancellationToken,
}

enum Exit {
    Cleared,
    Cancelled,
}

impl RecoveryRoutine {
    async fn run(&mut self, drivetrain: Option<&mut Drivetrain>) -> Result<Exit, WardenError> {
        if self.kind == HazardKind::LowBattery {
            return Ok(self.hold_low_battery().await);
        }
        let Some(dt) = drivetrain else {
            return Err(WardenError::RecoveryFault {
                kind: self.kind,
                details: "drivetrain not available".to_string(),
            });
        };
        match self.kind {
            HazardKind::CollisionFront => self.back_away_from_obstacle(dt).await,
            HazardKind::EdgeDetected => self.back_away_from_edge(dt).await,
            HazardKind::ClientDisconnected => self.hold_until_client_returns(dt).await,
            HazardKind::ManualStop => self.hold_until_cleared(dt).await,
            HazardKind::LowBattery => Ok(Exit::Cleared),
        }
    }

    async fn back_away_from_obstacle(&mut self, dt: &mut Drivetrain) -> Result<Exit, WardenError> {
        if self.commanded_speed > 0.0 {
            dt.stop()?;
        }
        let clearance = self.config.collision_clearance_cm();
        loop {
            let sample = self.latest();
            if sample.snapshot.distance_cm > clearance {
                info!(distance_cm = sample.snapshot.distance_cm, "obstacle cleared");
                return Ok(Exit::Cleared);
            }
            dt.apply(MotionCommand::straight(-self.config.backup_power))?;
            if !self.pause().await {
                return Ok(Exit::Cancelled);
            }
        }
    }

    async fn back_away_from_edge(&mut self, dt: &mut Drivetrain) -> Result<Exit, WardenError> {
        let min_clear = self.config.edge_recovery_min();
        let mut clear_since: Option<Instant> = None;
        loop {
            let sample = self.latest();
            if sample.snapshot.cliff_detected {
                if clear_since.take().is_some() {
                    debug!("edge re-triggered, debounce reset");
                }
            } else {
                let since = *clear_since.get_or_insert(sample.at);
                if sample.at.saturating_duration_since(since) >= min_clear {
                    info!("edge cleared");
                    return Ok(Exit::Cleared);
                }
            }
            dt.apply(MotionCommand::straight(-self.config.backup_power))?;
            if !self.pause().await {
                return Ok(Exit::Cancelled);
            }
        }
    }

    async fn hold_until_client_returns(&mut self, dt: &mut Drivetrain) -> Result<Exit, WardenError> {
        dt.stop()?;
        loop {
            if self.latest().client_live {
                info!("client reconnected");
                return Ok(Exit::Cleared);
            }
            if !self.pause().await {
                return Ok(Exit::Cancelled);
            }
        }
    }

    async fn hold_until_cleared(&mut self, dt: &mut Drivetrain) -> Result<Exit, WardenError> {
        dt.stop()?;
        self.cancel.cancelled().await;
        Ok(Exit::Cancelled)
    }

    async fn hold_low_battery(&mut self) -> Exit {
        let interval = self.config.low_battery_warning_interval();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Exit::Cancelled,
            _ = tokio::time::sleep(interval) => Exit::Cleared,
        }
    }

    fn latest(&mut self) -> TickSample {
        *self.samples.borrow_and_update()
    }

    /// Yield for one poll interval.  Returns `false` once cancelled.
    async fn pause(&self) -> bool {
        let poll = self.config.poll_interval().max(Duration::from_millis(1));
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(poll) => true,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Task boundary
// ────────────────────────────────────────────────────────────────────────────

/// Task body spawned by the coordinator.
///
/// The routine is run under `catch_unwind`, so a panic is reported as a
/// fault instead of losing the drivetrain with the task.  The drivetrain is
/// stopped on every exit path before it is returned.
pub async fn run_recovery(
    mut routine: RecoveryRoutine,
    mut drivetrain: Option<Drivetrain>,
) -> RecoveryReport {
    let kind = routine.kind;
    let result = AssertUnwindSafe(routine.run(drivetrain.as_mut()))
        .catch_unwind()
        .await;

    let mut outcome = match result {
        Ok(Ok(Exit::Cleared)) => RecoveryOutcome::Cleared,
        Ok(Ok(Exit::Cancelled)) => RecoveryOutcome::Cancelled,
        Ok(Err(e)) => RecoveryOutcome::Faulted(e),
        Err(panic) => RecoveryOutcome::Faulted(WardenError::RecoveryFault {
            kind,
            details: panic_message(panic.as_ref()),
        }),
    };

    if let Some(dt) = drivetrain.as_mut() {
        if let Err(e) = dt.stop() {
            error!(%kind, error = %e, "failed to neutralise drivetrain after recovery");
            if matches!(outcome, RecoveryOutcome::Cleared | RecoveryOutcome::Cancelled) {
                outcome = RecoveryOutcome::Faulted(e);
            }
        }
    }

    if let RecoveryOutcome::Faulted(e) = &outcome {
        error!(%kind, error = %e, "recovery routine faulted");
    } else {
        debug!(%kind, ?outcome, "recovery routine finished");
    }

    RecoveryReport {
        kind,
        outcome,
        drivetrain,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
