//! In-process simulated rover for tests and the CLI, no hardware required.
//!
//! [`SimRover`] owns a small shared world (obstacle distance, line-sensor
//! readings, battery voltage) and hands out a [`HazardSensors`] view and a
//! [`Drivetrain`] over the same state.  Tests and the operator REPL mutate the
//! world through the rover handle while the safety core runs against it.
//!
//! # Example
//!
//! ```rust
//! use warden_hal::sim::SimRover;
//! use warden_types::MotionCommand;
//!
//! let rover = SimRover::new().with_distance(80.0);
//! let mut drivetrain = rover.drivetrain();
//! drivetrain.apply(MotionCommand::straight(40.0)).expect("sim drive must succeed");
//! assert_eq!(rover.outputs().left_power, 40.0);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use warden_types::{MotionCommand, Side, WardenError};

use crate::actuator::DriveActuator;
use crate::drivetrain::Drivetrain;
use crate::sensor::HazardSensors;

/// Grayscale value of ordinary floor under a line sensor.
pub const FLOOR_GRAYSCALE: u16 = 900;

/// Grayscale value when a sensor hangs over a drop.
pub const DROP_GRAYSCALE: u16 = 20;

/// Most recent complete writes kept in the write log.
pub const WRITE_LOG_CAPACITY: usize = 256;

// ────────────────────────────────────────────────────────────────────────────
// Shared world
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SimWorld {
    distance_cm: f32,
    grayscale: [u16; 3],
    battery_volts: f32,
    failing_distance_reads: u32,
    failing_grayscale_reads: u32,
    failing_motor_writes: u32,
    panicking_motor_writes: u32,
    outputs: MotionCommand,
    writes: VecDeque<MotionCommand>,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self {
            distance_cm: 200.0,
            grayscale: [FLOOR_GRAYSCALE; 3],
            battery_volts: 8.0,
            failing_distance_reads: 0,
            failing_grayscale_reads: 0,
            failing_motor_writes: 0,
            panicking_motor_writes: 0,
            outputs: MotionCommand::NEUTRAL,
            writes: VecDeque::with_capacity(WRITE_LOG_CAPACITY),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimRover
// ────────────────────────────────────────────────────────────────────────────

/// Handle on a simulated rover.  Clone it cheaply; all clones share the same
/// world.
#[derive(Clone, Default)]
pub struct SimRover {
    world: Arc<Mutex<SimWorld>>,
}

impl SimRover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_distance(self, distance_cm: f32) -> Self {
        self.set_distance(distance_cm);
        self
    }

    pub fn with_battery_voltage(self, volts: f32) -> Self {
        self.set_battery_voltage(volts);
        self
    }

    /// Sensor view to hand to the hazard monitor.
    pub fn sensors(&self) -> Box<dyn HazardSensors> {
        Box::new(SimSensors {
            world: Arc::clone(&self.world),
        })
    }

    /// A fresh [`Drivetrain`] over the simulated motors.  Only create one per
    /// rover; two would break the single-writer rule the core relies on.
    pub fn drivetrain(&self) -> Drivetrain {
        Drivetrain::new(Box::new(SimMotors {
            world: Arc::clone(&self.world),
        }))
    }

    pub fn set_distance(&self, distance_cm: f32) {
        self.world().distance_cm = distance_cm;
    }

    /// Put the rover's nose over a drop (`true`) or back on the floor.
    pub fn set_cliff(&self, over_edge: bool) {
        let value = if over_edge { DROP_GRAYSCALE } else { FLOOR_GRAYSCALE };
        self.world().grayscale = [FLOOR_GRAYSCALE, value, FLOOR_GRAYSCALE];
    }

    pub fn set_battery_voltage(&self, volts: f32) {
        self.world().battery_volts = volts;
    }

    /// Make the next `count` distance reads fail with a sensor fault.
    pub fn fail_distance_reads(&self, count: u32) {
        self.world().failing_distance_reads = count;
    }

    /// Make the next `count` grayscale reads fail with a sensor fault.
    pub fn fail_grayscale_reads(&self, count: u32) {
        self.world().failing_grayscale_reads = count;
    }

    /// Make the next `count` motor writes fail with an actuator fault.
    pub fn fail_motor_writes(&self, count: u32) {
        self.world().failing_motor_writes = count;
    }

    /// Make the next `count` motor writes panic, as a misbehaving driver
    /// would.  The world lock is released first, so the rover stays usable.
    pub fn panic_on_motor_writes(&self, count: u32) {
        self.world().panicking_motor_writes = count;
    }

    /// Current motor and steering outputs.
    pub fn outputs(&self) -> MotionCommand {
        self.world().outputs
    }

    /// The last [`WRITE_LOG_CAPACITY`] complete writes, oldest first.
    pub fn write_log(&self) -> Vec<MotionCommand> {
        self.world().writes.iter().copied().collect()
    }

    pub fn clear_write_log(&self) {
        self.world().writes.clear();
    }

    fn world(&self) -> MutexGuard<'_, SimWorld> {
        lock(&self.world)
    }
}

fn lock(world: &Mutex<SimWorld>) -> MutexGuard<'_, SimWorld> {
    // A panicking test thread must not wedge the rest of the simulation.
    world.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ────────────────────────────────────────────────────────────────────────────
// Sensor and motor views
// ────────────────────────────────────────────────────────────────────────────

struct SimSensors {
    world: Arc<Mutex<SimWorld>>,
}

impl HazardSensors for SimSensors {
    fn read_distance(&mut self) -> Result<f32, WardenError> {
        let mut world = lock(&self.world);
        if world.failing_distance_reads > 0 {
            world.failing_distance_reads -= 1;
            return Err(WardenError::SensorFault {
                sensor: "ultrasonic".to_string(),
                details: "echo timeout".to_string(),
            });
        }
        Ok(world.distance_cm)
    }

    fn read_grayscale(&mut self) -> Result<[u16; 3], WardenError> {
        let mut world = lock(&self.world);
        if world.failing_grayscale_reads > 0 {
            world.failing_grayscale_reads -= 1;
            return Err(WardenError::SensorFault {
                sensor: "grayscale".to_string(),
                details: "adc read failed".to_string(),
            });
        }
        Ok(world.grayscale)
    }

    fn read_battery_voltage(&mut self) -> Result<f32, WardenError> {
        Ok(lock(&self.world).battery_volts)
    }
}

struct SimMotors {
    world: Arc<Mutex<SimWorld>>,
}

impl DriveActuator for SimMotors {
    fn write_motor(&mut self, side: Side, power: f32) -> Result<(), WardenError> {
        let mut world = lock(&self.world);
        if world.panicking_motor_writes > 0 {
            world.panicking_motor_writes -= 1;
            drop(world);
            panic!("simulated {side:?} motor driver panic");
        }
        if world.failing_motor_writes > 0 {
            world.failing_motor_writes -= 1;
            return Err(WardenError::ActuatorFault {
                details: format!("{side:?} motor PWM write failed"),
            });
        }
        match side {
            Side::Left => world.outputs.left_power = power,
            Side::Right => {
                world.outputs.right_power = power;
                // The right motor is written last by `Drivetrain`, so this
                // marks the end of one complete command.
                let snapshot = world.outputs;
                if world.writes.len() == WRITE_LOG_CAPACITY {
                    world.writes.pop_front();
                }
                world.writes.push_back(snapshot);
            }
        }
        Ok(())
    }

    fn write_steering(&mut self, angle_deg: f32) -> Result<(), WardenError> {
        lock(&self.world).outputs.steering_angle_deg = angle_deg;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
