//! [`HazardMonitor`] – per-tick sensor refresh and hazard classification.
//!
//! Each call to [`HazardMonitor::poll`] refreshes the [`SensorSnapshot`] from
//! the HAL and classifies at most one [`HazardKind`].  Classification order is
//! strict and the first match wins:
//!
//! 1. client never connected → nothing (no auto-hazard before first contact)
//! 2. obstacle closer than `collision_threshold_cm` → `CollisionFront`
//! 3. cliff under any line sensor → `EdgeDetected`
//! 4. operator silent for longer than `client_timeout_s` → `ClientDisconnected`
//! 5. battery under `low_battery_pct`, at most once per warning interval →
//!    `LowBattery`
//!
//! A classified hazard only counts once the caller acts on it and calls
//! [`HazardMonitor::acknowledge`].  From then on the monitor stays quiet for
//! `hazard_cooldown_s`, whatever the sensors say, and an acknowledged
//! `LowBattery` is not raised again until the warning interval has passed.
//! A hazard the caller drops (outranked, or not honored in the current mode)
//! is classified again on the next poll.
//!
//! Sensor faults never stop polling: the faulty field keeps its last
//! known-good value and a warning is logged.

use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::{debug, warn};
use warden_hal::{HazardSensors, cliff_detected, voltage_to_percent};
use warden_types::{HazardKind, SafetyConfig, SensorSnapshot};

use crate::liveness::ClientLivenessTracker;

/// Number of speed samples kept for the acceleration estimate.
const SPEED_WINDOW: usize = 5;

/// Result of one [`HazardMonitor::poll`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HazardReading {
    pub snapshot: SensorSnapshot,
    pub hazard: Option<HazardKind>,
}

pub struct HazardMonitor {
    sensors: Box<dyn HazardSensors>,
    snapshot: SensorSnapshot,
    last_hazard_at: Option<Instant>,
    last_low_battery_warning: Option<Instant>,
    speed_window: VecDeque<(Instant, f32)>,
}

impl HazardMonitor {
    pub fn new(sensors: Box<dyn HazardSensors>) -> Self {
        Self {
            sensors,
            snapshot: SensorSnapshot::default(),
            last_hazard_at: None,
            last_low_battery_warning: None,
            speed_window: VecDeque::with_capacity(SPEED_WINDOW),
        }
    }

    /// The snapshot produced by the most recent poll.
    pub fn snapshot(&self) -> SensorSnapshot {
        self.snapshot
    }

    /// Refresh sensors and classify at most one hazard.
    pub fn poll(
        &mut self,
        now: Instant,
        liveness: &ClientLivenessTracker,
        config: &SafetyConfig,
    ) -> HazardReading {
        self.refresh(config);
        let hazard = self.classify(now, liveness, config);
        if let Some(kind) = hazard {
            debug!(%kind, distance_cm = self.snapshot.distance_cm, "hazard classified");
        }
        HazardReading {
            snapshot: self.snapshot,
            hazard,
        }
    }

    /// Record that `kind` was acted on at `now`: starts the cooldown and, for
    /// `LowBattery`, the warning interval.
    pub fn acknowledge(&mut self, kind: HazardKind, now: Instant) {
        self.last_hazard_at = Some(now);
        if kind == HazardKind::LowBattery {
            self.last_low_battery_warning = Some(now);
        }
    }

    fn classify(
        &self,
        now: Instant,
        liveness: &ClientLivenessTracker,
        config: &SafetyConfig,
    ) -> Option<HazardKind> {
        if let Some(last) = self.last_hazard_at {
            if now.saturating_duration_since(last) < config.hazard_cooldown() {
                return None;
            }
        }
        if !liveness.has_connected() {
            return None;
        }

        let snap = &self.snapshot;
        if config.collision_avoidance_enabled && snap.distance_cm < config.collision_threshold_cm {
            return Some(HazardKind::CollisionFront);
        }
        if config.edge_detection_enabled && snap.cliff_detected {
            return Some(HazardKind::EdgeDetected);
        }
        if config.auto_stop_enabled && liveness.is_stale(now, config.client_timeout()) {
            return Some(HazardKind::ClientDisconnected);
        }
        if snap.battery_pct < config.low_battery_pct {
            let due = self.last_low_battery_warning.is_none_or(|warned| {
                now.saturating_duration_since(warned) >= config.low_battery_warning_interval()
            });
            if due {
                return Some(HazardKind::LowBattery);
            }
        }
        None
    }

    fn refresh(&mut self, config: &SafetyConfig) {
        match self.sensors.read_distance() {
            Ok(distance) if distance.is_finite() && distance >= 0.0 => {
                self.snapshot.distance_cm = distance;
            }
            Ok(distance) => {
                warn!(distance, "implausible ultrasonic reading, keeping last value");
            }
            Err(e) => warn!(error = %e, "distance read failed, keeping last value"),
        }

        match self.sensors.read_grayscale() {
            Ok(triplet) => {
                self.snapshot.cliff_detected = cliff_detected(triplet, config.edge_threshold);
            }
            Err(e) => warn!(error = %e, "grayscale read failed, keeping last value"),
        }

        match self.sensors.read_battery_voltage() {
            Ok(volts) if volts.is_finite() => {
                self.snapshot.battery_pct = voltage_to_percent(volts);
            }
            Ok(volts) => warn!(volts, "implausible battery voltage, keeping last value"),
            Err(e) => warn!(error = %e, "battery read failed, keeping last value"),
        }
    }

    // ── Acceleration ────────────────────────────────────────────────────────

    /// Feed the commanded speed for this tick into the rolling window.
    pub fn record_speed(&mut self, now: Instant, speed: f32) {
        if self.speed_window.len() == SPEED_WINDOW {
            self.speed_window.pop_front();
        }
        self.speed_window.push_back((now, speed));
    }

    /// Δspeed/Δt across the rolling window, in speed units per second.
    ///
    /// Informational only; nothing gates on it.
    pub fn acceleration(&self) -> f32 {
        let (Some(&(t0, s0)), Some(&(t1, s1))) =
            (self.speed_window.front(), self.speed_window.back())
        else {
            return 0.0;
        };
        let dt = t1.saturating_duration_since(t0).as_secs_f32();
        if dt > 0.0 { (s1 - s0) / dt } else { 0.0 }
    }
}

impl std::fmt::Debug for HazardMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HazardMonitor")
            .field("snapshot", &self.snapshot)
            .field("last_hazard_at", &self.last_hazard_at)
            .finish_non_exhaustive()
    }
}
