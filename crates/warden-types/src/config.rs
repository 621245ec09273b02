//! [`SafetyConfig`] – the single value object every safety component reads.
//!
//! Configuration persistence is owned by the caller (the CLI keeps it in a
//! TOML file).  This module only guarantees that a value which reaches the
//! kernel is valid: [`SafetyConfig::apply`] rejects bad updates and keeps the
//! prior value, and [`SafetyConfig::sanitized`] repairs a deserialized config
//! field by field.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{MOTOR_POWER_LIMIT, STEERING_LIMIT_DEG, SafetyFlags, WardenError};

/// Thresholds, timers, and feature toggles for hazard detection and motion
/// arbitration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Obstacle distance below which a front collision is declared.
    pub collision_threshold_cm: f32,
    /// Extra clearance beyond the threshold required before a collision clears.
    pub safe_distance_buffer_cm: f32,
    /// Grayscale reading at or below which a line sensor is looking over an edge.
    pub edge_threshold: u16,
    /// How long the cliff must read clear, continuously, before edge recovery ends.
    pub edge_recovery_min_s: f32,
    /// Silence after which the operator is considered disconnected.
    pub client_timeout_s: f32,
    /// Minimum spacing between two hazard classifications.
    pub hazard_cooldown_s: f32,
    pub low_battery_pct: f32,
    pub low_battery_warning_interval_s: f32,
    pub collision_avoidance_enabled: bool,
    pub edge_detection_enabled: bool,
    pub auto_stop_enabled: bool,
    /// Acceleration smoothing in `(0.1, 1.0]`; `1.0` disables the limit.
    pub acceleration_factor: f32,
    /// Wheel power, in percent, that a full-scale intent maps to.
    pub max_speed: f32,
    /// Steering angle, in degrees, that a full-scale turn maps to.
    pub max_turn_angle_deg: f32,
    pub turn_in_place: bool,
    pub enhanced_turning: bool,
    /// Reverse power used by the collision and edge recovery routines.
    pub backup_power: f32,
    pub poll_interval_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            collision_threshold_cm: 20.0,
            safe_distance_buffer_cm: 10.0,
            edge_threshold: 200,
            edge_recovery_min_s: 1.0,
            client_timeout_s: 3.0,
            hazard_cooldown_s: 0.5,
            low_battery_pct: 20.0,
            low_battery_warning_interval_s: 60.0,
            collision_avoidance_enabled: true,
            edge_detection_enabled: true,
            auto_stop_enabled: true,
            acceleration_factor: 0.8,
            max_speed: 80.0,
            max_turn_angle_deg: 30.0,
            turn_in_place: false,
            enhanced_turning: true,
            backup_power: 30.0,
            poll_interval_ms: 50,
        }
    }
}

/// A single-field change to a [`SafetyConfig`], as delivered by transport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum ConfigUpdate {
    CollisionThresholdCm(f32),
    SafeDistanceBufferCm(f32),
    EdgeThreshold(u16),
    EdgeRecoveryMinS(f32),
    ClientTimeoutS(f32),
    HazardCooldownS(f32),
    LowBatteryPct(f32),
    LowBatteryWarningIntervalS(f32),
    CollisionAvoidanceEnabled(bool),
    EdgeDetectionEnabled(bool),
    AutoStopEnabled(bool),
    AccelerationFactor(f32),
    MaxSpeed(f32),
    MaxTurnAngleDeg(f32),
    TurnInPlace(bool),
    EnhancedTurning(bool),
    BackupPower(f32),
    PollIntervalMs(u64),
}

impl ConfigUpdate {
    /// Name of the config field this update targets.
    pub fn field(&self) -> &'static str {
        match self {
            ConfigUpdate::CollisionThresholdCm(_) => "collision_threshold_cm",
            ConfigUpdate::SafeDistanceBufferCm(_) => "safe_distance_buffer_cm",
            ConfigUpdate::EdgeThreshold(_) => "edge_threshold",
            ConfigUpdate::EdgeRecoveryMinS(_) => "edge_recovery_min_s",
            ConfigUpdate::ClientTimeoutS(_) => "client_timeout_s",
            ConfigUpdate::HazardCooldownS(_) => "hazard_cooldown_s",
            ConfigUpdate::LowBatteryPct(_) => "low_battery_pct",
            ConfigUpdate::LowBatteryWarningIntervalS(_) => "low_battery_warning_interval_s",
            ConfigUpdate::CollisionAvoidanceEnabled(_) => "collision_avoidance_enabled",
            ConfigUpdate::EdgeDetectionEnabled(_) => "edge_detection_enabled",
            ConfigUpdate::AutoStopEnabled(_) => "auto_stop_enabled",
            ConfigUpdate::AccelerationFactor(_) => "acceleration_factor",
            ConfigUpdate::MaxSpeed(_) => "max_speed",
            ConfigUpdate::MaxTurnAngleDeg(_) => "max_turn_angle_deg",
            ConfigUpdate::TurnInPlace(_) => "turn_in_place",
            ConfigUpdate::EnhancedTurning(_) => "enhanced_turning",
            ConfigUpdate::BackupPower(_) => "backup_power",
            ConfigUpdate::PollIntervalMs(_) => "poll_interval_ms",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match *self {
            ConfigUpdate::CollisionThresholdCm(v)
            | ConfigUpdate::EdgeRecoveryMinS(v)
            | ConfigUpdate::ClientTimeoutS(v)
            | ConfigUpdate::LowBatteryWarningIntervalS(v) => positive(v),
            ConfigUpdate::SafeDistanceBufferCm(v) | ConfigUpdate::HazardCooldownS(v) => {
                non_negative(v)
            }
            ConfigUpdate::EdgeThreshold(v) => {
                if v > 0 { Ok(()) } else { Err("must be greater than 0".to_string()) }
            }
            ConfigUpdate::PollIntervalMs(v) => {
                if v > 0 { Ok(()) } else { Err("must be greater than 0".to_string()) }
            }
            ConfigUpdate::LowBatteryPct(v) => within(v, 0.0, 100.0),
            ConfigUpdate::AccelerationFactor(v) => {
                if v.is_finite() && v > 0.1 && v <= 1.0 {
                    Ok(())
                } else {
                    Err(format!("{v} is outside (0.1, 1.0]"))
                }
            }
            ConfigUpdate::MaxSpeed(v) | ConfigUpdate::BackupPower(v) => {
                positive(v).and_then(|()| within(v, 0.0, MOTOR_POWER_LIMIT))
            }
            ConfigUpdate::MaxTurnAngleDeg(v) => {
                positive(v).and_then(|()| within(v, 0.0, STEERING_LIMIT_DEG))
            }
            ConfigUpdate::CollisionAvoidanceEnabled(_)
            | ConfigUpdate::EdgeDetectionEnabled(_)
            | ConfigUpdate::AutoStopEnabled(_)
            | ConfigUpdate::TurnInPlace(_)
            | ConfigUpdate::EnhancedTurning(_) => Ok(()),
        }
    }
}

fn positive(v: f32) -> Result<(), String> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(format!("{v} must be a positive number"))
    }
}

fn non_negative(v: f32) -> Result<(), String> {
    if v.is_finite() && v >= 0.0 {
        Ok(())
    } else {
        Err(format!("{v} must not be negative"))
    }
}

fn within(v: f32, min: f32, max: f32) -> Result<(), String> {
    if v.is_finite() && (min..=max).contains(&v) {
        Ok(())
    } else {
        Err(format!("{v} is outside [{min}, {max}]"))
    }
}

fn seconds(v: f32) -> Duration {
    Duration::try_from_secs_f32(v).unwrap_or(Duration::ZERO)
}

impl SafetyConfig {
    /// Apply one field change.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::InvalidConfig`] when the new value is out of
    /// range.  The prior value is kept and a warning is logged.
    pub fn apply(&mut self, update: ConfigUpdate) -> Result<(), WardenError> {
        if let Err(details) = update.validate() {
            warn!(field = update.field(), %details, "rejected safety config update");
            return Err(WardenError::InvalidConfig {
                field: update.field().to_string(),
                details,
            });
        }
        match update {
            ConfigUpdate::CollisionThresholdCm(v) => self.collision_threshold_cm = v,
            ConfigUpdate::SafeDistanceBufferCm(v) => self.safe_distance_buffer_cm = v,
            ConfigUpdate::EdgeThreshold(v) => self.edge_threshold = v,
            ConfigUpdate::EdgeRecoveryMinS(v) => self.edge_recovery_min_s = v,
            ConfigUpdate::ClientTimeoutS(v) => self.client_timeout_s = v,
            ConfigUpdate::HazardCooldownS(v) => self.hazard_cooldown_s = v,
            ConfigUpdate::LowBatteryPct(v) => self.low_battery_pct = v,
            ConfigUpdate::LowBatteryWarningIntervalS(v) => self.low_battery_warning_interval_s = v,
            ConfigUpdate::CollisionAvoidanceEnabled(v) => self.collision_avoidance_enabled = v,
            ConfigUpdate::EdgeDetectionEnabled(v) => self.edge_detection_enabled = v,
            ConfigUpdate::AutoStopEnabled(v) => self.auto_stop_enabled = v,
            ConfigUpdate::AccelerationFactor(v) => self.acceleration_factor = v,
            ConfigUpdate::MaxSpeed(v) => self.max_speed = v,
            ConfigUpdate::MaxTurnAngleDeg(v) => self.max_turn_angle_deg = v,
            ConfigUpdate::TurnInPlace(v) => self.turn_in_place = v,
            ConfigUpdate::EnhancedTurning(v) => self.enhanced_turning = v,
            ConfigUpdate::BackupPower(v) => self.backup_power = v,
            ConfigUpdate::PollIntervalMs(v) => self.poll_interval_ms = v,
        }
        Ok(())
    }

    /// Return a copy in which every invalid field has been replaced by its
    /// default.  Each replacement is logged.
    pub fn sanitized(&self) -> SafetyConfig {
        let mut clean = SafetyConfig::default();
        for update in self.as_updates() {
            // A rejected update leaves the default in place.
            let _ = clean.apply(update);
        }
        clean
    }

    fn as_updates(&self) -> [ConfigUpdate; 18] {
        [
            ConfigUpdate::CollisionThresholdCm(self.collision_threshold_cm),
            ConfigUpdate::SafeDistanceBufferCm(self.safe_distance_buffer_cm),
            ConfigUpdate::EdgeThreshold(self.edge_threshold),
            ConfigUpdate::EdgeRecoveryMinS(self.edge_recovery_min_s),
            ConfigUpdate::ClientTimeoutS(self.client_timeout_s),
            ConfigUpdate::HazardCooldownS(self.hazard_cooldown_s),
            ConfigUpdate::LowBatteryPct(self.low_battery_pct),
            ConfigUpdate::LowBatteryWarningIntervalS(self.low_battery_warning_interval_s),
            ConfigUpdate::CollisionAvoidanceEnabled(self.collision_avoidance_enabled),
            ConfigUpdate::EdgeDetectionEnabled(self.edge_detection_enabled),
            ConfigUpdate::AutoStopEnabled(self.auto_stop_enabled),
            ConfigUpdate::AccelerationFactor(self.acceleration_factor),
            ConfigUpdate::MaxSpeed(self.max_speed),
            ConfigUpdate::MaxTurnAngleDeg(self.max_turn_angle_deg),
            ConfigUpdate::TurnInPlace(self.turn_in_place),
            ConfigUpdate::EnhancedTurning(self.enhanced_turning),
            ConfigUpdate::BackupPower(self.backup_power),
            ConfigUpdate::PollIntervalMs(self.poll_interval_ms),
        ]
    }

    /// Distance a collision recovery must exceed before it clears.
    pub fn collision_clearance_cm(&self) -> f32 {
        self.collision_threshold_cm + self.safe_distance_buffer_cm
    }

    pub fn client_timeout(&self) -> Duration {
        seconds(self.client_timeout_s)
    }

    pub fn hazard_cooldown(&self) -> Duration {
        seconds(self.hazard_cooldown_s)
    }

    pub fn edge_recovery_min(&self) -> Duration {
        seconds(self.edge_recovery_min_s)
    }

    pub fn low_battery_warning_interval(&self) -> Duration {
        seconds(self.low_battery_warning_interval_s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn flags(&self) -> SafetyFlags {
        SafetyFlags {
            collision_avoidance: self.collision_avoidance_enabled,
            edge_detection: self.edge_detection_enabled,
            auto_stop: self.auto_stop_enabled,
        }
    }
}
