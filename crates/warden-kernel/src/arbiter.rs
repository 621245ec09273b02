//! [`MotionArbiter`] – turns the winning intent into a [`MotionCommand`].
//!
//! Pipeline, in order:
//!
//! 1. **Acceleration limit**: with `acceleration_factor < 1.0` the change in
//!    speed per second is capped at `2.0 / (1.1 - acceleration_factor)`.
//! 2. **Emergency constraint**: `CollisionFront` pins speed to at most
//!    `-0.3`; `LowBattery` halves it.  Turn is left alone.
//! 3. **Drive mode**: turn in place, enhanced turning, or uniform wheels.
//! 4. **Hardware clamp**.
//!
//! The result says whether the arbiter must *defer*: while a recovery that
//! owns the actuator is active the command is computed (for telemetry) but
//! must not be written.

use warden_types::{HazardKind, MotionCommand, MotionIntent, SafetyConfig};

/// Speed ceiling imposed while a front collision is active.
const COLLISION_SPEED_CEILING: f32 = -0.3;

/// Speed multiplier while the battery is low.
const LOW_BATTERY_SCALE: f32 = 0.5;

/// Turn magnitude below which steering is treated as straight ahead.
const TURN_DEADBAND: f32 = 0.1;

/// Speed magnitude below which the robot counts as stationary for turning
/// in place.
const STATIONARY_SPEED: f32 = 0.1;

/// Largest fraction by which enhanced turning slows the inner wheel.
const INNER_WHEEL_REDUCTION: f32 = 0.9;

/// Output of one [`MotionArbiter::arbitrate`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Arbitration {
    pub command: MotionCommand,
    /// Normalised speed after limiting and emergency constraints.
    pub speed: f32,
    pub turn: f32,
    /// A recovery routine owns the actuator; do not write `command`.
    pub deferred: bool,
}

#[derive(Debug, Default, Clone)]
pub struct MotionArbiter {
    last_speed: f32,
}

impl MotionArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Speed after the acceleration limit on the previous call.
    pub fn last_speed(&self) -> f32 {
        self.last_speed
    }

    /// Forget the ramp state, e.g. after the operator disconnects.
    pub fn reset(&mut self) {
        self.last_speed = 0.0;
    }

    /// Arbitrate one tick.  `dt_s` is the time since the previous call.
    pub fn arbitrate(
        &mut self,
        intent: &MotionIntent,
        active: Option<HazardKind>,
        config: &SafetyConfig,
        dt_s: f32,
    ) -> Arbitration {
        let deferred = active.is_some_and(HazardKind::owns_actuator);

        let limited = limit_acceleration(self.last_speed, intent.speed, config.acceleration_factor, dt_s);
        // While deferred the recovery routine is driving; ramp up from rest
        // once it hands control back.
        self.last_speed = if deferred { 0.0 } else { limited };

        let speed = match active {
            Some(HazardKind::CollisionFront) => limited.min(COLLISION_SPEED_CEILING),
            Some(HazardKind::LowBattery) => limited * LOW_BATTERY_SCALE,
            _ => limited,
        };
        let turn = intent.turn;

        Arbitration {
            command: drive_command(speed, turn, config).clamped(),
            speed,
            turn,
            deferred,
        }
    }
}

/// Move from `last` toward `requested`, limited by the acceleration factor.
fn limit_acceleration(last: f32, requested: f32, factor: f32, dt_s: f32) -> f32 {
    if factor >= 1.0 {
        return requested;
    }
    let max_accel = 2.0 / (1.1 - factor);
    let max_delta = max_accel * dt_s.max(0.0);
    last + (requested - last).clamp(-max_delta, max_delta)
}

/// Map normalised `speed` and `turn` onto wheel power and steering.
fn drive_command(speed: f32, turn: f32, config: &SafetyConfig) -> MotionCommand {
    let turning = turn.abs() > TURN_DEADBAND;

    if config.turn_in_place && turning && speed.abs() < STATIONARY_SPEED {
        let power = turn * config.max_speed;
        return MotionCommand {
            left_power: power,
            right_power: -power,
            steering_angle_deg: 0.0,
        };
    }

    let power = speed * config.max_speed;
    let steering_angle_deg = turn * config.max_turn_angle_deg;

    if config.enhanced_turning && turning {
        let inner = power * (1.0 - turn.abs() * INNER_WHEEL_REDUCTION);
        let (left_power, right_power) = if turn > 0.0 { (power, inner) } else { (inner, power) };
        return MotionCommand {
            left_power,
            right_power,
            steering_angle_deg,
        };
    }

    MotionCommand {
        left_power: power,
        right_power: power,
        steering_angle_deg,
    }
}
