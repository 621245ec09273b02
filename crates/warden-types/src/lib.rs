use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod config;

pub use config::{ConfigUpdate, SafetyConfig};

/// Hardware power range accepted by each drive motor, in percent.
pub const MOTOR_POWER_LIMIT: f32 = 100.0;

/// Mechanical travel of the steering servo either side of centre, in degrees.
pub const STEERING_LIMIT_DEG: f32 = 30.0;

/// Operating mode of the robot.  Exactly one is active at a time and only the
/// kernel's mode machine mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotMode {
    /// Boot state: no transport-level connection has ever been made.
    WaitingForClient,
    /// Connected, but no motion intent has been received yet.
    WaitingForInput,
    /// The remote operator drives the robot.
    ControlledByClient,
    /// A recovery routine (or a hazard constraint) is in charge.
    EmergencyControl,
    /// An AI action sequence is running and must not be interrupted.
    GptControlled,
    /// Autonomous line/circuit following.
    CircuitMode,
    /// Scripted demonstration routine.
    DemoMode,
    /// Vision-based target tracking.
    TrackingMode,
}

impl RobotMode {
    /// `true` for the exclusive modes an operator switches on explicitly.
    pub fn is_special(self) -> bool {
        matches!(
            self,
            RobotMode::GptControlled
                | RobotMode::CircuitMode
                | RobotMode::DemoMode
                | RobotMode::TrackingMode
        )
    }
}

impl fmt::Display for RobotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RobotMode::WaitingForClient => "waiting_for_client",
            RobotMode::WaitingForInput => "waiting_for_input",
            RobotMode::ControlledByClient => "controlled_by_client",
            RobotMode::EmergencyControl => "emergency_control",
            RobotMode::GptControlled => "gpt_controlled",
            RobotMode::CircuitMode => "circuit_mode",
            RobotMode::DemoMode => "demo_mode",
            RobotMode::TrackingMode => "tracking_mode",
        };
        f.write_str(name)
    }
}

impl FromStr for RobotMode {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "waiting_for_client" => Ok(RobotMode::WaitingForClient),
            "waiting_for_input" => Ok(RobotMode::WaitingForInput),
            "controlled_by_client" | "manual" => Ok(RobotMode::ControlledByClient),
            "emergency_control" => Ok(RobotMode::EmergencyControl),
            "gpt_controlled" | "gpt" => Ok(RobotMode::GptControlled),
            "circuit_mode" | "circuit" => Ok(RobotMode::CircuitMode),
            "demo_mode" | "demo" => Ok(RobotMode::DemoMode),
            "tracking_mode" | "tracking" => Ok(RobotMode::TrackingMode),
            other => Err(WardenError::InvalidCommand(format!(
                "unknown robot mode '{other}'"
            ))),
        }
    }
}

/// A detected unsafe physical condition requiring a motion override.
///
/// "No hazard" is expressed as `Option::<HazardKind>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HazardKind {
    CollisionFront,
    EdgeDetected,
    ClientDisconnected,
    LowBattery,
    /// Operator-forced stop; never produced by sensor classification.
    ManualStop,
}

impl HazardKind {
    pub const ALL: [HazardKind; 5] = [
        HazardKind::CollisionFront,
        HazardKind::EdgeDetected,
        HazardKind::ClientDisconnected,
        HazardKind::LowBattery,
        HazardKind::ManualStop,
    ];

    /// Precedence used when one emergency would replace another.  Higher wins.
    pub fn rank(self) -> u8 {
        match self {
            HazardKind::ManualStop => 5,
            HazardKind::CollisionFront => 4,
            HazardKind::EdgeDetected => 3,
            HazardKind::ClientDisconnected => 2,
            HazardKind::LowBattery => 1,
        }
    }

    /// `true` for kinds the hazard monitor can raise from sensor data.
    pub fn is_auto_detected(self) -> bool {
        !matches!(self, HazardKind::ManualStop)
    }

    /// `true` when the recovery routine for this kind takes the actuator.
    /// Low battery only scales the operator's speed.
    pub fn owns_actuator(self) -> bool {
        !matches!(self, HazardKind::LowBattery)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HazardKind::CollisionFront => "collision_front",
            HazardKind::EdgeDetected => "edge_detected",
            HazardKind::ClientDisconnected => "client_disconnected",
            HazardKind::LowBattery => "low_battery",
            HazardKind::ManualStop => "manual_stop",
        }
    }

    /// Key the notification collaborator maps to speech or sound on activation.
    pub fn message_key(self) -> String {
        format!("hazard.{}", self.as_str())
    }

    /// Key announced when the hazard clears.
    pub fn clear_message_key(self) -> String {
        format!("hazard.{}.cleared", self.as_str())
    }
}

impl fmt::Display for HazardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HazardKind {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        HazardKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| WardenError::InvalidCommand(format!("unknown hazard kind '{s}'")))
    }
}

/// Latest hazard-relevant sensor readings, refreshed once per poll.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub distance_cm: f32,
    pub cliff_detected: bool,
    pub battery_pct: f32,
}

impl Default for SensorSnapshot {
    /// Optimistic readings used until the first successful poll.
    fn default() -> Self {
        Self {
            distance_cm: 400.0,
            cliff_detected: false,
            battery_pct: 100.0,
        }
    }
}

/// Who produced a [`MotionIntent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    /// The remote operator's joystick / keyboard.
    Operator,
    /// The vision / AI pipeline.
    Autonomous,
}

/// Requested motion, normalised to `[-1, 1]` on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionIntent {
    pub speed: f32,
    pub turn: f32,
    pub source: IntentSource,
}

impl MotionIntent {
    /// Build an intent, clamping `speed` and `turn` into `[-1, 1]`.
    /// Non-finite inputs collapse to zero.
    pub fn new(speed: f32, turn: f32, source: IntentSource) -> Self {
        Self {
            speed: unit(speed),
            turn: unit(turn),
            source,
        }
    }

    pub fn idle(source: IntentSource) -> Self {
        Self::new(0.0, 0.0, source)
    }
}

fn unit(v: f32) -> f32 {
    if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 }
}

/// Left or right drive motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

/// The only value ever written to the drivetrain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionCommand {
    pub left_power: f32,
    pub right_power: f32,
    pub steering_angle_deg: f32,
}

impl MotionCommand {
    /// Motors stopped, steering centred.
    pub const NEUTRAL: MotionCommand = MotionCommand {
        left_power: 0.0,
        right_power: 0.0,
        steering_angle_deg: 0.0,
    };

    /// Both wheels at `power`, steering centred.
    pub fn straight(power: f32) -> Self {
        Self {
            left_power: power,
            right_power: power,
            steering_angle_deg: 0.0,
        }
    }

    /// Clamp every field into the hardware range.
    pub fn clamped(self) -> Self {
        Self {
            left_power: self.left_power.clamp(-MOTOR_POWER_LIMIT, MOTOR_POWER_LIMIT),
            right_power: self.right_power.clamp(-MOTOR_POWER_LIMIT, MOTOR_POWER_LIMIT),
            steering_angle_deg: self
                .steering_angle_deg
                .clamp(-STEERING_LIMIT_DEG, STEERING_LIMIT_DEG),
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.left_power == 0.0 && self.right_power == 0.0 && self.steering_angle_deg == 0.0
    }
}

/// Safety feature toggles included in every telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyFlags {
    pub collision_avoidance: bool,
    pub edge_detection: bool,
    pub auto_stop: bool,
}

/// Per-tick state broadcast to the telemetry collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub mode: RobotMode,
    pub active_emergency: Option<HazardKind>,
    pub distance_cm: f32,
    pub battery_pct: f32,
    pub speed: f32,
    pub turn: f32,
    pub acceleration: f32,
    pub safety_flags: SafetyFlags,
}

/// Lifecycle step of a hazard announced to the notification collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPhase {
    Activated,
    Cleared,
}

/// One hazard activation or clearance.  The core never renders speech itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: HazardKind,
    pub phase: NotificationPhase,
    pub message_key: String,
}

impl Notification {
    pub fn activated(kind: HazardKind) -> Self {
        Self {
            kind,
            phase: NotificationPhase::Activated,
            message_key: kind.message_key(),
        }
    }

    pub fn cleared(kind: HazardKind) -> Self {
        Self {
            kind,
            phase: NotificationPhase::Cleared,
            message_key: kind.clear_message_key(),
        }
    }
}

/// Unified event wrapper for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "warden-runtime::control_loop"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current wall-clock time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Notification(Notification),
    Telemetry(TelemetrySnapshot),
    ModeChanged { from: RobotMode, to: RobotMode },
    HardwareFault { component: String, message: String },
}

/// Error type shared by every Warden crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WardenError {
    #[error("Sensor fault on {sensor}: {details}")]
    SensorFault { sensor: String, details: String },

    #[error("Actuator fault: {details}")]
    ActuatorFault { details: String },

    #[error("Invalid configuration for {field}: {details}")]
    InvalidConfig { field: String, details: String },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Mode transition rejected: {from} -> {to}")]
    ModeTransitionRejected { from: RobotMode, to: RobotMode },

    #[error("Recovery routine for {kind} failed: {details}")]
    RecoveryFault { kind: HazardKind, details: String },

    #[error("Channel error: {0}")]
    Channel(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hazard_kind_parses_snake_case_names() {
        assert_eq!(
            "collision_front".parse::<HazardKind>().unwrap(),
            HazardKind::CollisionFront
        );
        assert_eq!(" Manual_Stop ".parse::<HazardKind>().unwrap(), HazardKind::ManualStop);
    }

    #[test]
    fn unknown_hazard_kind_is_an_invalid_command() {
        let err = "lava".parse::<HazardKind>().unwrap_err();
        assert!(matches!(err, WardenError::InvalidCommand(msg) if msg.contains("lava")));
    }

    #[test]
    fn manual_stop_outranks_every_auto_hazard() {
        for kind in HazardKind::ALL.into_iter().filter(|k| k.is_auto_detected()) {
            assert!(HazardKind::ManualStop.rank() > kind.rank());
        }
        assert!(HazardKind::CollisionFront.rank() > HazardKind::EdgeDetected.rank());
        assert!(HazardKind::EdgeDetected.rank() > HazardKind::ClientDisconnected.rank());
        assert!(HazardKind::ClientDisconnected.rank() > HazardKind::LowBattery.rank());
    }

    #[test]
    fn only_low_battery_leaves_the_actuator_alone() {
        let owners: Vec<_> = HazardKind::ALL
            .into_iter()
            .filter(|k| !k.owns_actuator())
            .collect();
        assert_eq!(owners, vec![HazardKind::LowBattery]);
    }

    #[test]
    fn message_keys_are_namespaced() {
        assert_eq!(HazardKind::EdgeDetected.message_key(), "hazard.edge_detected");
        assert_eq!(
            Notification::cleared(HazardKind::EdgeDetected).message_key,
            "hazard.edge_detected.cleared"
        );
    }

    #[test]
    fn robot_mode_parses_short_aliases() {
        assert_eq!("gpt".parse::<RobotMode>().unwrap(), RobotMode::GptControlled);
        assert_eq!("circuit".parse::<RobotMode>().unwrap(), RobotMode::CircuitMode);
        assert!("flying".parse::<RobotMode>().is_err());
        assert!(RobotMode::TrackingMode.is_special());
        assert!(!RobotMode::EmergencyControl.is_special());
    }

    #[test]
    fn motion_intent_clamps_inputs() {
        let intent = MotionIntent::new(3.0, -7.0, IntentSource::Operator);
        assert_eq!(intent.speed, 1.0);
        assert_eq!(intent.turn, -1.0);
        let nan = MotionIntent::new(f32::NAN, 0.5, IntentSource::Autonomous);
        assert_eq!(nan.speed, 0.0);
    }

    #[test]
    fn motion_command_clamps_to_hardware_range() {
        let cmd = MotionCommand {
            left_power: 150.0,
            right_power: -180.0,
            steering_angle_deg: 75.0,
        }
        .clamped();
        assert_eq!(cmd.left_power, MOTOR_POWER_LIMIT);
        assert_eq!(cmd.right_power, -MOTOR_POWER_LIMIT);
        assert_eq!(cmd.steering_angle_deg, STEERING_LIMIT_DEG);
        assert!(MotionCommand::NEUTRAL.is_neutral());
    }

    #[test]
    fn notification_event_roundtrip() {
        let event = Event::new(
            "warden-runtime::control_loop",
            EventPayload::Notification(Notification::activated(HazardKind::CollisionFront)),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        match back.payload {
            EventPayload::Notification(n) => {
                assert_eq!(n.kind, HazardKind::CollisionFront);
                assert_eq!(n.phase, NotificationPhase::Activated);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn warden_error_display() {
        let err = WardenError::ModeTransitionRejected {
            from: RobotMode::EmergencyControl,
            to: RobotMode::DemoMode,
        };
        assert!(err.to_string().contains("emergency_control -> demo_mode"));

        let err = WardenError::SensorFault {
            sensor: "ultrasonic".to_string(),
            details: "echo timeout".to_string(),
        };
        assert!(err.to_string().contains("ultrasonic"));
    }
}
