//! [`ControlLoop`] – the fixed-cadence safety loop.
//!
//! One cooperative loop owns every piece of kernel state and advances it once
//! per poll interval.  Each [`ControlLoop::tick`]:
//!
//! 1. **Drain** – apply queued [`ControlCommand`]s from the transport
//!    (intents, pings, mode requests, manual emergencies, config updates).
//! 2. **Reap** – collect a recovery routine that finished on its own and
//!    leave `EmergencyControl`.
//! 3. **Sense** – poll the [`HazardMonitor`] and publish the tick sample to
//!    the running recovery routine.
//! 4. **Escalate** – if a hazard was classified and the current mode honors
//!    it, hand it to the [`EmergencyCoordinator`] and enter
//!    `EmergencyControl`.  Only a hazard the coordinator takes is
//!    acknowledged to the monitor; a dropped one is classified again.
//! 5. **Act** – run the [`MotionArbiter`] and write its command, unless a
//!    recovery routine owns the drivetrain.
//! 6. **Report** – publish a [`TelemetrySnapshot`] on [`Topic::Telemetry`].
//!
//! Hazard notifications go to [`Topic::Notifications`]; mode changes and
//! hardware faults go to [`Topic::SystemAlerts`].
//!
//! # Failure handling
//!
//! A tick only fails when the drivetrain rejects a write.  [`ControlLoop::run`]
//! logs the failure and retries with exponential backoff starting at the poll
//! interval and capped at one second.  Nothing here stops the loop except the
//! shutdown token.
//!
//! # Example
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use warden_hal::SimRover;
//! use warden_middleware::EventBus;
//! use warden_runtime::ControlLoop;
//! use warden_types::SafetyConfig;
//!
//! # async fn demo() {
//! let rover = SimRover::new();
//! let (control, handle) = ControlLoop::new(
//!     rover.sensors(),
//!     rover.drivetrain(),
//!     SafetyConfig::default(),
//!     EventBus::default(),
//! );
//! let shutdown = CancellationToken::new();
//! let task = tokio::spawn(control.run(shutdown.clone()));
//! handle.connect().await.ok();
//! shutdown.cancel();
//! task.await.ok();
//! # }
//! ```

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_hal::{Drivetrain, HazardSensors};
use warden_kernel::{
    Arbitration, ClientLivenessTracker, EmergencyCoordinator, FinishedRecovery, HazardMonitor,
    ModeTransition, MotionArbiter, RecoveryContext, RecoveryOutcome, RobotModeMachine, TickSample,
};
use warden_middleware::{EventBus, Topic};
use warden_types::{
    ConfigUpdate, Event, EventPayload, HazardKind, IntentSource, MotionIntent, Notification,
    RobotMode, SafetyConfig, TelemetrySnapshot, WardenError,
};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// `source` stamped on every event this loop publishes.
const EVENT_SOURCE: &str = "warden-runtime::control_loop";

/// Queued transport commands before senders start waiting.
const COMMAND_CAPACITY: usize = 64;

/// Upper bound on the retry delay after repeated tick failures.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Reply channel carried by commands that report success or failure.
pub type Reply<T> = oneshot::Sender<Result<T, WardenError>>;

/// Everything the transport can ask of the safety core.
#[derive(Debug)]
pub enum ControlCommand {
    /// Operator or autonomous motion request.  Also counts as liveness.
    Intent(MotionIntent),
    /// Keep-alive with no motion attached.
    Ping,
    TransportConnected,
    TransportDisconnected,
    RequestMode { target: RobotMode, reply: Reply<RobotMode> },
    /// Select a special mode, or leave it if it is already active.
    ToggleMode { mode: RobotMode, reply: Reply<RobotMode> },
    TriggerEmergency { kind: HazardKind, reply: Reply<()> },
    ClearEmergency { reply: Reply<()> },
    UpdateConfig { update: ConfigUpdate, reply: Reply<()> },
    /// Current telemetry without waiting for the next broadcast.
    Status { reply: Reply<TelemetrySnapshot> },
}

/// Cloneable sender side of the control loop.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    pub async fn send_intent(&self, intent: MotionIntent) -> Result<(), WardenError> {
        self.send(ControlCommand::Intent(intent)).await
    }

    pub async fn ping(&self) -> Result<(), WardenError> {
        self.send(ControlCommand::Ping).await
    }

    pub async fn connect(&self) -> Result<(), WardenError> {
        self.send(ControlCommand::TransportConnected).await
    }

    pub async fn disconnect(&self) -> Result<(), WardenError> {
        self.send(ControlCommand::TransportDisconnected).await
    }

    /// Returns the mode in effect after the request.
    pub async fn request_mode(&self, target: RobotMode) -> Result<RobotMode, WardenError> {
        self.call(|reply| ControlCommand::RequestMode { target, reply }).await
    }

    pub async fn toggle_mode(&self, mode: RobotMode) -> Result<RobotMode, WardenError> {
        self.call(|reply| ControlCommand::ToggleMode { mode, reply }).await
    }

    pub async fn trigger_emergency(&self, kind: HazardKind) -> Result<(), WardenError> {
        self.call(|reply| ControlCommand::TriggerEmergency { kind, reply }).await
    }

    pub async fn clear_emergency(&self) -> Result<(), WardenError> {
        self.call(|reply| ControlCommand::ClearEmergency { reply }).await
    }

    pub async fn update_config(&self, update: ConfigUpdate) -> Result<(), WardenError> {
        self.call(|reply| ControlCommand::UpdateConfig { update, reply }).await
    }

    pub async fn status(&self) -> Result<TelemetrySnapshot, WardenError> {
        self.call(|reply| ControlCommand::Status { reply }).await
    }

    /// Queue a manual stop without waiting.  Safe to call from a signal
    /// handler thread.
    ///
    /// # Errors
    ///
    /// [`WardenError::Channel`] if the queue is full or the loop is gone.
    pub fn emergency_stop_now(&self) -> Result<(), WardenError> {
        let (reply, _) = oneshot::channel();
        self.tx
            .try_send(ControlCommand::TriggerEmergency {
                kind: HazardKind::ManualStop,
                reply,
            })
            .map_err(|e| WardenError::Channel(format!("emergency stop not queued: {e}")))
    }

    async fn send(&self, cmd: ControlCommand) -> Result<(), WardenError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| WardenError::Channel("control loop has stopped".to_string()))
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> ControlCommand,
    ) -> Result<T, WardenError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await
            .map_err(|_| WardenError::Channel("control loop dropped the reply".to_string()))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ControlLoop
// ─────────────────────────────────────────────────────────────────────────────

pub struct ControlLoop {
    config: SafetyConfig,
    liveness: ClientLivenessTracker,
    monitor: HazardMonitor,
    modes: RobotModeMachine,
    coordinator: EmergencyCoordinator,
    arbiter: MotionArbiter,
    bus: EventBus,
    commands: mpsc::Receiver<ControlCommand>,
    // ── Per-tick state ────────────────────────────────────────────────────────
    operator_intent: MotionIntent,
    autonomous_intent: MotionIntent,
    last_arbitration: Option<Arbitration>,
    /// Speed actually written on the last tick; zero while a recovery drives.
    commanded_speed: f32,
    last_tick: Option<Instant>,
}

impl ControlLoop {
    pub fn new(
        sensors: Box<dyn HazardSensors>,
        drivetrain: Drivetrain,
        config: SafetyConfig,
        bus: EventBus,
    ) -> (Self, ControlHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let control = Self {
            config,
            liveness: ClientLivenessTracker::new(),
            monitor: HazardMonitor::new(sensors),
            modes: RobotModeMachine::new(),
            coordinator: EmergencyCoordinator::new(drivetrain),
            arbiter: MotionArbiter::new(),
            bus,
            commands,
            operator_intent: MotionIntent::idle(IntentSource::Operator),
            autonomous_intent: MotionIntent::idle(IntentSource::Autonomous),
            last_arbitration: None,
            commanded_speed: 0.0,
            last_tick: None,
        };
        (control, ControlHandle { tx })
    }

    pub fn mode(&self) -> RobotMode {
        self.modes.current()
    }

    pub fn active_emergency(&self) -> Option<HazardKind> {
        self.coordinator.active_kind()
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Run ticks at `poll_interval_ms` until `shutdown` is cancelled, then
    /// cancel any recovery and leave the drivetrain at neutral.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut period = self.config.poll_interval();
        let mut ticker = tick_interval(period);
        let mut failures: u32 = 0;
        info!(period_ms = period.as_millis() as u64, "control loop started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick(Instant::now()).await {
                Ok(_) => {
                    if failures > 0 {
                        info!(failures, "control loop recovered");
                        failures = 0;
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = backoff_delay(period, failures);
                    warn!(error = %e, failures, delay_ms = delay.as_millis() as u64, "control tick failed");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            let wanted = self.config.poll_interval();
            if wanted != period {
                info!(period_ms = wanted.as_millis() as u64, "poll interval changed");
                period = wanted;
                ticker = tick_interval(period);
            }
        }

        self.coordinator.shutdown().await;
        info!("control loop stopped");
    }

    /// Advance the loop by one tick at `now`.
    ///
    /// # Errors
    ///
    /// [`WardenError::ActuatorFault`] when the arbiter's write fails.  All
    /// other state has been advanced and telemetry published regardless.
    pub async fn tick(&mut self, now: Instant) -> Result<TelemetrySnapshot, WardenError> {
        let dt_s = self
            .last_tick
            .map(|prev| now.saturating_duration_since(prev).as_secs_f32())
            .unwrap_or_else(|| self.config.poll_interval().as_secs_f32());
        self.last_tick = Some(now);

        self.drain_commands(now).await;

        if let Some(finished) = self.coordinator.reap().await {
            self.on_recovery_finished(finished);
        }

        let reading = self.monitor.poll(now, &self.liveness, &self.config);
        let client_live = self.liveness.is_live(now, self.config.client_timeout());
        self.coordinator
            .publish(TickSample::new(reading.snapshot, client_live, now));

        if let Some(kind) = reading.hazard {
            if self.modes.honors(kind) {
                let ctx = self.recovery_context();
                let notes = self.coordinator.activate(kind, ctx).await;
                if !notes.is_empty() {
                    self.monitor.acknowledge(kind, now);
                }
                self.on_activated(kind, notes);
            } else {
                debug!(%kind, mode = %self.modes.current(), "hazard not honored in this mode");
            }
        }

        let intent = self.current_intent();
        let arbitration = self.arbiter.arbitrate(
            &intent,
            self.coordinator.active_kind(),
            &self.config,
            dt_s,
        );
        self.monitor.record_speed(now, arbitration.speed);
        self.last_arbitration = Some(arbitration);

        let mut write_result = Ok(());
        self.commanded_speed = 0.0;
        if !arbitration.deferred {
            if let Some(drivetrain) = self.coordinator.drivetrain() {
                write_result = drivetrain.apply(arbitration.command);
                if write_result.is_ok() {
                    self.commanded_speed = arbitration.speed;
                }
            }
        }

        let snapshot = self.telemetry();
        self.emit(Topic::Telemetry, EventPayload::Telemetry(snapshot.clone()));

        if let Err(e) = write_result {
            self.emit(
                Topic::SystemAlerts,
                EventPayload::HardwareFault {
                    component: "drivetrain".to_string(),
                    message: e.to_string(),
                },
            );
            return Err(e);
        }
        Ok(snapshot)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    async fn drain_commands(&mut self, now: Instant) {
        while let Ok(cmd) = self.commands.try_recv() {
            self.handle_command(cmd, now).await;
        }
    }

    async fn handle_command(&mut self, cmd: ControlCommand, now: Instant) {
        match cmd {
            ControlCommand::Intent(intent) => {
                self.liveness.record_contact(now);
                match intent.source {
                    IntentSource::Operator => {
                        self.operator_intent = intent;
                        let change = self.modes.on_intent();
                        self.note(change);
                    }
                    IntentSource::Autonomous => self.autonomous_intent = intent,
                }
            }
            ControlCommand::Ping => self.liveness.record_contact(now),
            ControlCommand::TransportConnected => {
                self.liveness.record_contact(now);
                let change = self.modes.on_transport_connected();
                self.note(change);
            }
            ControlCommand::TransportDisconnected => {
                info!("transport disconnected");
                self.liveness.forget();
                self.operator_intent = MotionIntent::idle(IntentSource::Operator);
                self.arbiter.reset();
                let change = self.modes.on_transport_disconnected();
                self.note(change);
            }
            ControlCommand::RequestMode { target, reply } => {
                let result = self.modes.request_mode(target);
                self.answer_mode(result, reply).await;
            }
            ControlCommand::ToggleMode { mode, reply } => {
                let result = self.modes.toggle_special(mode);
                self.answer_mode(result, reply).await;
            }
            ControlCommand::TriggerEmergency { kind, reply } => {
                let ctx = self.recovery_context();
                let result = match self.coordinator.trigger_manual(kind, ctx).await {
                    Ok(notes) => {
                        self.on_activated(kind, notes);
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ControlCommand::ClearEmergency { reply } => {
                let result = match self.coordinator.clear().await {
                    Ok(note) => {
                        self.emit_notification(note);
                        let change = self.modes.exit_emergency();
                        self.note(change);
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ControlCommand::UpdateConfig { update, reply } => {
                let field = update.field();
                let result = self.config.apply(update);
                if result.is_ok() {
                    info!(field, "safety config updated");
                }
                let _ = reply.send(result);
            }
            ControlCommand::Status { reply } => {
                let _ = reply.send(Ok(self.telemetry()));
            }
        }
    }

    async fn answer_mode(
        &mut self,
        result: Result<Option<ModeTransition>, WardenError>,
        reply: Reply<RobotMode>,
    ) {
        let result = match result {
            Ok(change) => {
                self.on_mode_selected(change);
                self.release_unhonored_emergency().await;
                Ok(self.modes.current())
            }
            Err(e) => Err(e),
        };
        let _ = reply.send(result);
    }

    fn on_mode_selected(&mut self, change: Option<ModeTransition>) {
        if change.is_some_and(|t| t.to.is_special()) {
            self.autonomous_intent = MotionIntent::idle(IntentSource::Autonomous);
        }
        self.note(change);
    }

    /// End an emergency that the newly selected mode no longer honors.  Only
    /// reachable for `LowBattery`: the mode machine refuses requests while an
    /// actuator-owning emergency is active.
    async fn release_unhonored_emergency(&mut self) {
        let Some(kind) = self.coordinator.active_kind() else {
            return;
        };
        if self.modes.honors(kind) {
            return;
        }
        match self.coordinator.clear().await {
            Ok(note) => {
                info!(%kind, mode = %self.modes.selected(), "emergency released by mode change");
                self.emit_notification(note);
                let change = self.modes.exit_emergency();
                self.on_mode_selected(change);
            }
            Err(e) => warn!(error = %e, %kind, "failed to release emergency"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Emergency bookkeeping
    // ─────────────────────────────────────────────────────────────────────────

    fn recovery_context(&self) -> RecoveryContext {
        RecoveryContext {
            config: self.config.clone(),
            commanded_speed: self.commanded_speed,
        }
    }

    fn on_activated(&mut self, kind: HazardKind, notes: Vec<Notification>) {
        if notes.is_empty() {
            return;
        }
        for note in notes {
            self.emit_notification(note);
        }
        let change = self.modes.enter_emergency(kind);
        self.note(change);
    }

    fn on_recovery_finished(&mut self, finished: FinishedRecovery) {
        if let RecoveryOutcome::Faulted(e) = &finished.outcome {
            self.emit(
                Topic::SystemAlerts,
                EventPayload::HardwareFault {
                    component: format!("recovery::{}", finished.kind),
                    message: e.to_string(),
                },
            );
        }
        self.emit_notification(finished.notification);
        let change = self.modes.exit_emergency();
        self.note(change);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn current_intent(&self) -> MotionIntent {
        match self.modes.intent_source() {
            Some(IntentSource::Operator) => self.operator_intent,
            Some(IntentSource::Autonomous) => self.autonomous_intent,
            None => MotionIntent::idle(IntentSource::Operator),
        }
    }

    fn telemetry(&self) -> TelemetrySnapshot {
        let snapshot = self.monitor.snapshot();
        let (speed, turn) = self
            .last_arbitration
            .map(|a| (a.speed, a.turn))
            .unwrap_or((0.0, 0.0));
        TelemetrySnapshot {
            mode: self.modes.current(),
            active_emergency: self.coordinator.active_kind(),
            distance_cm: snapshot.distance_cm,
            battery_pct: snapshot.battery_pct,
            speed,
            turn,
            acceleration: self.monitor.acceleration(),
            safety_flags: self.config.flags(),
        }
    }

    fn note(&self, change: Option<ModeTransition>) {
        if let Some(ModeTransition { from, to }) = change {
            self.emit(Topic::SystemAlerts, EventPayload::ModeChanged { from, to });
        }
    }

    fn emit_notification(&self, note: Notification) {
        self.emit(Topic::Notifications, EventPayload::Notification(note));
    }

    fn emit(&self, topic: Topic, payload: EventPayload) {
        if let Err(e) = self.bus.publish_to(topic, Event::new(EVENT_SOURCE, payload)) {
            warn!(error = %e, ?topic, "failed to publish event");
        }
    }
}

fn tick_interval(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Delay before retrying after `failures` consecutive failed ticks.
fn backoff_delay(base: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}

impl std::fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoop")
            .field("mode", &self.modes.current())
            .field("active_emergency", &self.coordinator.active_kind())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use warden_hal::SimRover;
    use warden_middleware::TopicReceiver;
    use warden_types::NotificationPhase;

    const POLL: Duration = Duration::from_millis(50);

    fn setup(config: SafetyConfig) -> (ControlLoop, ControlHandle, SimRover) {
        let rover = SimRover::new();
        let (control, handle) =
            ControlLoop::new(rover.sensors(), rover.drivetrain(), config, EventBus::default());
        (control, handle, rover)
    }

    async fn step(control: &mut ControlLoop) -> TelemetrySnapshot {
        tokio::time::sleep(POLL).await;
        control.tick(Instant::now()).await.unwrap()
    }

    /// Tick until `done` holds, failing after `max_ticks`.
    async fn step_until(
        control: &mut ControlLoop,
        handle: &ControlHandle,
        max_ticks: usize,
        done: impl Fn(&ControlLoop) -> bool,
    ) {
        for _ in 0..max_ticks {
            handle.ping().await.unwrap();
            step(control).await;
            if done(control) {
                return;
            }
        }
        panic!("condition not reached after {max_ticks} ticks: {control:?}");
    }

    async fn drive_forward(control: &mut ControlLoop, handle: &ControlHandle, speed: f32) {
        handle.connect().await.unwrap();
        handle
            .send_intent(MotionIntent::new(speed, 0.0, IntentSource::Operator))
            .await
            .unwrap();
        step(control).await;
        assert_eq!(control.mode(), RobotMode::ControlledByClient);
    }

    fn drain(rx: &mut TopicReceiver) -> Vec<Event> {
        std::iter::from_fn(|| rx.try_next()).collect()
    }

    fn notifications(events: &[Event]) -> Vec<(HazardKind, NotificationPhase)> {
        events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Notification(n) => Some((n.kind, n.phase)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn operator_drives_once_connected() {
        let (mut control, handle, rover) = setup(SafetyConfig {
            acceleration_factor: 1.0,
            ..SafetyConfig::default()
        });
        assert_eq!(control.mode(), RobotMode::WaitingForClient);
        drive_forward(&mut control, &handle, 0.5).await;
        assert_eq!(rover.outputs().left_power, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn collision_scenario_round_trips_mode() {
        let (mut control, handle, rover) = setup(SafetyConfig::default());
        let mut notes_rx = control.bus().subscribe_to(Topic::Notifications);
        let mut alerts_rx = control.bus().subscribe_to(Topic::SystemAlerts);
        rover.set_distance(50.0);
        drive_forward(&mut control, &handle, 0.6).await;
        for _ in 0..5 {
            handle.ping().await.unwrap();
            step(&mut control).await;
        }
        assert!(rover.outputs().left_power > 0.0);

        // Obstacle closes to 5 cm: caught on the very next tick.
        rover.set_distance(5.0);
        handle.ping().await.unwrap();
        let t = step(&mut control).await;
        assert_eq!(t.active_emergency, Some(HazardKind::CollisionFront));
        assert_eq!(control.mode(), RobotMode::EmergencyControl);

        // While active, nothing but stops and reverse is written.
        rover.clear_write_log();
        for _ in 0..10 {
            handle.ping().await.unwrap();
            let t = step(&mut control).await;
            assert!(t.speed <= -0.3 + f32::EPSILON);
        }
        let log = rover.write_log();
        assert!(log.iter().all(|cmd| cmd.left_power <= 0.0 && cmd.right_power <= 0.0));
        assert!(log.iter().any(|cmd| cmd.left_power == -30.0));

        // Exactly at threshold + buffer is not enough.
        rover.set_distance(30.0);
        for _ in 0..5 {
            handle.ping().await.unwrap();
            step(&mut control).await;
        }
        assert_eq!(control.active_emergency(), Some(HazardKind::CollisionFront));

        rover.set_distance(35.0);
        step_until(&mut control, &handle, 5, |c| c.active_emergency().is_none()).await;
        assert_eq!(control.mode(), RobotMode::ControlledByClient);

        // Operator control resumes.
        step_until(&mut control, &handle, 10, |_| rover.outputs().left_power > 0.0).await;

        let notes = notifications(&drain(&mut notes_rx));
        assert_eq!(
            notes,
            vec![
                (HazardKind::CollisionFront, NotificationPhase::Activated),
                (HazardKind::CollisionFront, NotificationPhase::Cleared),
            ]
        );
        let modes: Vec<_> = drain(&mut alerts_rx)
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::ModeChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            modes,
            vec![
                RobotMode::WaitingForInput,
                RobotMode::ControlledByClient,
                RobotMode::EmergencyControl,
                RobotMode::ControlledByClient,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gpt_mode_never_sets_an_emergency() {
        let (mut control, handle, rover) = setup(SafetyConfig::default());
        drive_forward(&mut control, &handle, 0.2).await;

        let requester = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.request_mode(RobotMode::GptControlled).await })
        };
        tokio::task::yield_now().await;
        step(&mut control).await;
        assert_eq!(requester.await.unwrap().unwrap(), RobotMode::GptControlled);

        rover.set_distance(3.0);
        rover.set_cliff(true);
        rover.set_battery_voltage(6.0);
        // No pings either: the client goes stale as well.
        for _ in 0..200 {
            let t = step(&mut control).await;
            assert_eq!(t.active_emergency, None);
            assert_eq!(t.mode, RobotMode::GptControlled);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_connected_client_never_triggers_disconnect() {
        let (mut control, _handle, _rover) = setup(SafetyConfig::default());
        for _ in 0..400 {
            let t = step(&mut control).await;
            assert_eq!(t.active_emergency, None);
        }
        assert_eq!(control.mode(), RobotMode::WaitingForClient);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_stopped_and_released_on_return() {
        let (mut control, handle, rover) = setup(SafetyConfig::default());
        drive_forward(&mut control, &handle, 0.5).await;

        // 3 s timeout, no pings.
        for _ in 0..62 {
            step(&mut control).await;
        }
        assert_eq!(control.active_emergency(), Some(HazardKind::ClientDisconnected));
        assert!(rover.outputs().is_neutral());

        handle
            .send_intent(MotionIntent::new(0.5, 0.0, IntentSource::Operator))
            .await
            .unwrap();
        step_until(&mut control, &handle, 5, |c| c.active_emergency().is_none()).await;
        assert_eq!(control.mode(), RobotMode::ControlledByClient);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_disconnect_lands_in_waiting_for_input() {
        let (mut control, handle, _rover) = setup(SafetyConfig::default());
        drive_forward(&mut control, &handle, 0.5).await;

        handle.disconnect().await.unwrap();
        let t = step(&mut control).await;
        // Connection history survives, so the disconnect hazard fires at once.
        assert_eq!(t.active_emergency, Some(HazardKind::ClientDisconnected));
        assert_eq!(t.mode, RobotMode::EmergencyControl);

        handle.connect().await.unwrap();
        step_until(&mut control, &handle, 5, |c| c.active_emergency().is_none()).await;
        assert_eq!(control.mode(), RobotMode::WaitingForInput);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_stop_holds_until_cleared() {
        let (mut control, handle, rover) = setup(SafetyConfig::default());
        drive_forward(&mut control, &handle, 0.5).await;

        handle.emergency_stop_now().unwrap();
        step(&mut control).await;
        assert_eq!(control.active_emergency(), Some(HazardKind::ManualStop));
        for _ in 0..20 {
            handle.ping().await.unwrap();
            step(&mut control).await;
        }
        assert!(rover.outputs().is_neutral());

        let clearer = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.clear_emergency().await })
        };
        tokio::task::yield_now().await;
        step(&mut control).await;
        clearer.await.unwrap().unwrap();
        assert_eq!(control.active_emergency(), None);
        assert_eq!(control.mode(), RobotMode::ControlledByClient);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_without_emergency_is_rejected() {
        let (mut control, handle, _rover) = setup(SafetyConfig::default());
        let clearer = tokio::spawn(async move { handle.clear_emergency().await });
        tokio::task::yield_now().await;
        step(&mut control).await;
        assert!(matches!(
            clearer.await.unwrap(),
            Err(WardenError::InvalidCommand(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn low_battery_halves_operator_power() {
        let (mut control, handle, rover) = setup(SafetyConfig {
            acceleration_factor: 1.0,
            ..SafetyConfig::default()
        });
        drive_forward(&mut control, &handle, 1.0).await;
        assert_eq!(rover.outputs().left_power, 80.0);

        rover.set_battery_voltage(6.8);
        handle.ping().await.unwrap();
        let t = step(&mut control).await;
        assert_eq!(t.active_emergency, Some(HazardKind::LowBattery));
        assert_eq!(t.mode, RobotMode::EmergencyControl);
        assert_eq!(rover.outputs().left_power, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn mode_request_during_low_battery_is_accepted() {
        let (mut control, handle, rover) = setup(SafetyConfig {
            acceleration_factor: 1.0,
            ..SafetyConfig::default()
        });
        let mut notes_rx = control.bus().subscribe_to(Topic::Notifications);
        drive_forward(&mut control, &handle, 1.0).await;
        rover.set_battery_voltage(6.8);
        handle.ping().await.unwrap();
        step(&mut control).await;
        assert_eq!(control.active_emergency(), Some(HazardKind::LowBattery));
        assert_eq!(control.mode(), RobotMode::EmergencyControl);

        let requester = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.request_mode(RobotMode::TrackingMode).await })
        };
        tokio::task::yield_now().await;
        step(&mut control).await;
        assert_eq!(requester.await.unwrap().unwrap(), RobotMode::TrackingMode);
        assert_eq!(control.active_emergency(), None);
        assert_eq!(control.mode(), RobotMode::TrackingMode);
        assert!(rover.outputs().is_neutral());

        // Tracking ignores battery warnings, so the low battery stays quiet.
        for _ in 0..20 {
            handle.ping().await.unwrap();
            let t = step(&mut control).await;
            assert_eq!(t.active_emergency, None);
            assert_eq!(t.mode, RobotMode::TrackingMode);
        }
        assert_eq!(
            notifications(&drain(&mut notes_rx)),
            vec![
                (HazardKind::LowBattery, NotificationPhase::Activated),
                (HazardKind::LowBattery, NotificationPhase::Cleared),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mode_request_during_collision_is_rejected() {
        let (mut control, handle, rover) = setup(SafetyConfig::default());
        drive_forward(&mut control, &handle, 0.5).await;
        rover.set_distance(5.0);
        handle.ping().await.unwrap();
        step(&mut control).await;
        assert_eq!(control.active_emergency(), Some(HazardKind::CollisionFront));

        let requester = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.request_mode(RobotMode::TrackingMode).await })
        };
        tokio::task::yield_now().await;
        step(&mut control).await;
        assert!(matches!(
            requester.await.unwrap(),
            Err(WardenError::ModeTransitionRejected { .. })
        ));
        assert_eq!(control.active_emergency(), Some(HazardKind::CollisionFront));
    }

    #[tokio::test(start_paused = true)]
    async fn low_battery_takes_over_once_collision_clears() {
        let (mut control, handle, rover) = setup(SafetyConfig {
            acceleration_factor: 1.0,
            ..SafetyConfig::default()
        });
        drive_forward(&mut control, &handle, 1.0).await;

        rover.set_distance(5.0);
        handle.ping().await.unwrap();
        step(&mut control).await;
        assert_eq!(control.active_emergency(), Some(HazardKind::CollisionFront));

        // Inside the clearance band the low battery is outranked every tick.
        rover.set_distance(25.0);
        rover.set_battery_voltage(6.8);
        for _ in 0..10 {
            handle.ping().await.unwrap();
            step(&mut control).await;
            assert_eq!(control.active_emergency(), Some(HazardKind::CollisionFront));
        }

        rover.set_distance(100.0);
        step_until(&mut control, &handle, 40, |c| {
            c.active_emergency() == Some(HazardKind::LowBattery)
        })
        .await;
        assert_eq!(rover.outputs().left_power, 40.0);
        assert_eq!(control.mode(), RobotMode::EmergencyControl);
    }

    #[tokio::test(start_paused = true)]
    async fn faulted_recovery_releases_drivetrain_and_loop_keeps_ticking() {
        let (mut control, handle, rover) = setup(SafetyConfig::default());
        let mut notes_rx = control.bus().subscribe_to(Topic::Notifications);
        let mut alerts_rx = control.bus().subscribe_to(Topic::SystemAlerts);
        rover.set_distance(50.0);
        drive_forward(&mut control, &handle, 0.6).await;
        for _ in 0..3 {
            handle.ping().await.unwrap();
            step(&mut control).await;
        }

        rover.set_distance(5.0);
        handle.ping().await.unwrap();
        step(&mut control).await;
        assert_eq!(control.active_emergency(), Some(HazardKind::CollisionFront));

        // The routine's first write fails; its cleanup stop goes through.
        rover.fail_motor_writes(1);
        tokio::time::sleep(POLL).await;
        assert!(rover.outputs().is_neutral());
        handle.ping().await.unwrap();
        control.tick(Instant::now()).await.unwrap();
        assert_eq!(control.active_emergency(), None);
        assert_eq!(control.mode(), RobotMode::ControlledByClient);

        assert!(drain(&mut alerts_rx).iter().any(|e| matches!(
            &e.payload,
            EventPayload::HardwareFault { component, .. } if component == "recovery::collision_front"
        )));
        assert_eq!(
            notifications(&drain(&mut notes_rx)),
            vec![
                (HazardKind::CollisionFront, NotificationPhase::Activated),
                (HazardKind::CollisionFront, NotificationPhase::Cleared),
            ]
        );

        // The obstacle is still there: once the cooldown lapses it is caught
        // again and a fresh routine backs away.
        step_until(&mut control, &handle, 15, |c| {
            c.active_emergency() == Some(HazardKind::CollisionFront)
        })
        .await;
        step_until(&mut control, &handle, 5, |_| rover.outputs().left_power == -30.0).await;
        rover.set_distance(100.0);
        step_until(&mut control, &handle, 5, |c| c.active_emergency().is_none()).await;
        assert_eq!(control.mode(), RobotMode::ControlledByClient);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_cannot_replace_manual_stop() {
        let (mut control, handle, rover) = setup(SafetyConfig::default());
        drive_forward(&mut control, &handle, 0.5).await;
        handle.emergency_stop_now().unwrap();
        step(&mut control).await;
        assert_eq!(control.active_emergency(), Some(HazardKind::ManualStop));

        let trigger = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.trigger_emergency(HazardKind::LowBattery).await })
        };
        tokio::task::yield_now().await;
        step(&mut control).await;
        assert!(matches!(
            trigger.await.unwrap(),
            Err(WardenError::InvalidCommand(_))
        ));
        for _ in 0..5 {
            handle.ping().await.unwrap();
            step(&mut control).await;
        }
        assert_eq!(control.active_emergency(), Some(HazardKind::ManualStop));
        assert!(rover.outputs().is_neutral());
    }

    #[tokio::test(start_paused = true)]
    async fn operator_intent_ignored_in_special_modes() {
        let (mut control, handle, rover) = setup(SafetyConfig {
            acceleration_factor: 1.0,
            ..SafetyConfig::default()
        });
        drive_forward(&mut control, &handle, 0.5).await;

        let requester = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.toggle_mode(RobotMode::CircuitMode).await })
        };
        tokio::task::yield_now().await;
        step(&mut control).await;
        requester.await.unwrap().unwrap();
        assert!(rover.outputs().is_neutral());

        handle
            .send_intent(MotionIntent::new(1.0, 0.0, IntentSource::Operator))
            .await
            .unwrap();
        step(&mut control).await;
        assert!(rover.outputs().is_neutral());

        handle
            .send_intent(MotionIntent::new(0.25, 0.0, IntentSource::Autonomous))
            .await
            .unwrap();
        step(&mut control).await;
        assert_eq!(rover.outputs().left_power, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn actuator_fault_fails_the_tick_and_raises_alert() {
        let (mut control, handle, rover) = setup(SafetyConfig::default());
        let mut alerts_rx = control.bus().subscribe_to(Topic::SystemAlerts);
        drive_forward(&mut control, &handle, 0.5).await;

        rover.fail_motor_writes(1);
        tokio::time::sleep(POLL).await;
        let result = control.tick(Instant::now()).await;
        assert!(matches!(result, Err(WardenError::ActuatorFault { .. })));
        assert!(drain(&mut alerts_rx).iter().any(|e| matches!(
            &e.payload,
            EventPayload::HardwareFault { component, .. } if component == "drivetrain"
        )));
        step(&mut control).await;
    }

    #[tokio::test(start_paused = true)]
    async fn config_updates_validate_and_apply() {
        let (mut control, handle, _rover) = setup(SafetyConfig::default());
        let updater = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let bad = handle.update_config(ConfigUpdate::CollisionThresholdCm(-1.0)).await;
                let good = handle.update_config(ConfigUpdate::CollisionThresholdCm(25.0)).await;
                (bad, good)
            })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
            step(&mut control).await;
        }
        let (bad, good) = updater.await.unwrap();
        assert!(matches!(bad, Err(WardenError::InvalidConfig { .. })));
        assert!(good.is_ok());
        assert_eq!(control.config().collision_threshold_cm, 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_serves_handle_and_stops_cleanly() {
        let (control, handle, rover) = setup(SafetyConfig {
            acceleration_factor: 1.0,
            ..SafetyConfig::default()
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(control.run(shutdown.clone()));

        assert!(handle.request_mode(RobotMode::DemoMode).await.is_err());
        handle.connect().await.unwrap();
        handle
            .send_intent(MotionIntent::new(0.5, 0.0, IntentSource::Operator))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.mode, RobotMode::ControlledByClient);
        assert_eq!(rover.outputs().left_power, 40.0);

        shutdown.cancel();
        task.await.unwrap();
        assert!(rover.outputs().is_neutral());
        assert!(handle.ping().await.is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(50);
        assert_eq!(backoff_delay(base, 1), base);
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 4), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 6), MAX_BACKOFF);
        assert_eq!(backoff_delay(base, u32::MAX), MAX_BACKOFF);
    }
}
