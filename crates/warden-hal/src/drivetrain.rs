//! [`Drivetrain`] – the actuator write capability.
//!
//! A `Drivetrain` wraps the raw [`DriveActuator`] and is deliberately neither
//! `Clone` nor shareable: the component that currently holds the value is the
//! only one able to move the robot.  The emergency coordinator moves it into a
//! recovery task and gets it back from the task's join handle, which is how
//! "one writer at any instant" holds without a lock.
//!
//! # Command mapping
//!
//! A [`MotionCommand`] is clamped to the hardware range and written as
//! steering first, then left and right motor power.

use tracing::{debug, error};
use warden_types::{MotionCommand, Side, WardenError};

use crate::actuator::DriveActuator;

/// Exclusive handle on the rover's motors and steering servo.
pub struct Drivetrain {
    actuator: Box<dyn DriveActuator>,
    last_command: MotionCommand,
}

impl Drivetrain {
    pub fn new(actuator: Box<dyn DriveActuator>) -> Self {
        Self {
            actuator,
            last_command: MotionCommand::NEUTRAL,
        }
    }

    /// Clamp `command` into the hardware range and write it.
    ///
    /// # Errors
    ///
    /// Returns the first [`WardenError::ActuatorFault`] raised by the driver.
    /// Later writes are skipped, and the last successfully applied command is
    /// left unchanged.
    pub fn apply(&mut self, command: MotionCommand) -> Result<(), WardenError> {
        let command = command.clamped();
        self.actuator.write_steering(command.steering_angle_deg)?;
        self.actuator.write_motor(Side::Left, command.left_power)?;
        self.actuator.write_motor(Side::Right, command.right_power)?;
        debug!(?command, "drivetrain command applied");
        self.last_command = command;
        Ok(())
    }

    /// Force motors off and steering to centre.
    ///
    /// Unlike [`apply`][Self::apply], every output is attempted even if an
    /// earlier one fails, so a stuck servo cannot keep the motors running.
    ///
    /// # Errors
    ///
    /// Returns the first fault encountered after all writes were attempted.
    pub fn stop(&mut self) -> Result<(), WardenError> {
        let results = [
            self.actuator.write_motor(Side::Left, 0.0),
            self.actuator.write_motor(Side::Right, 0.0),
            self.actuator.write_steering(0.0),
        ];
        let mut first_fault = None;
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "drivetrain stop write failed");
                first_fault.get_or_insert(e);
            }
        }
        match first_fault {
            Some(e) => Err(e),
            None => {
                self.last_command = MotionCommand::NEUTRAL;
                Ok(())
            }
        }
    }

    /// The most recent command that reached the hardware in full.
    pub fn last_command(&self) -> MotionCommand {
        self.last_command
    }
}

impl std::fmt::Debug for Drivetrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drivetrain")
            .field("last_command", &self.last_command)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    // ------------------------------------------------------------------
    // Test double
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct Outputs {
        left: f32,
        right: f32,
        steering: f32,
        writes: usize,
    }

    struct RecordingActuator {
        outputs: Arc<Mutex<Outputs>>,
        fail_steering: bool,
    }

    impl DriveActuator for RecordingActuator {
        fn write_motor(&mut self, side: Side, power: f32) -> Result<(), WardenError> {
            let mut out = self.outputs.lock().unwrap();
            out.writes += 1;
            match side {
                Side::Left => out.left = power,
                Side::Right => out.right = power,
            }
            Ok(())
        }

        fn write_steering(&mut self, angle_deg: f32) -> Result<(), WardenError> {
            if self.fail_steering {
                return Err(WardenError::ActuatorFault {
                    details: "servo not responding".to_string(),
                });
            }
            let mut out = self.outputs.lock().unwrap();
            out.writes += 1;
            out.steering = angle_deg;
            Ok(())
        }
    }

    fn drivetrain(fail_steering: bool) -> (Drivetrain, Arc<Mutex<Outputs>>) {
        let outputs = Arc::new(Mutex::new(Outputs::default()));
        let actuator = RecordingActuator {
            outputs: Arc::clone(&outputs),
            fail_steering,
        };
        (Drivetrain::new(Box::new(actuator)), outputs)
    }

    #[test]
    fn apply_writes_all_three_outputs() {
        let (mut dt, outputs) = drivetrain(false);
        dt.apply(MotionCommand {
            left_power: 40.0,
            right_power: 20.0,
            steering_angle_deg: -10.0,
        })
        .unwrap();
        let out = outputs.lock().unwrap();
        assert_eq!((out.left, out.right, out.steering), (40.0, 20.0, -10.0));
        assert_eq!(out.writes, 3);
    }

    #[test]
    fn apply_clamps_to_hardware_range() {
        let (mut dt, outputs) = drivetrain(false);
        dt.apply(MotionCommand {
            left_power: 250.0,
            right_power: -250.0,
            steering_angle_deg: 90.0,
        })
        .unwrap();
        let out = outputs.lock().unwrap();
        assert_eq!((out.left, out.right, out.steering), (100.0, -100.0, 30.0));
        assert_eq!(dt.last_command().left_power, 100.0);
    }

    #[test]
    fn stop_still_cuts_motors_when_servo_fails() {
        let (mut dt, outputs) = drivetrain(true);
        outputs.lock().unwrap().left = 55.0;
        outputs.lock().unwrap().right = 55.0;
        assert!(dt.stop().is_err());
        let out = outputs.lock().unwrap();
        assert_eq!((out.left, out.right), (0.0, 0.0));
    }

    #[test]
    fn failed_apply_keeps_previous_last_command() {
        let (mut dt, _outputs) = drivetrain(true);
        let result = dt.apply(MotionCommand::straight(50.0));
        assert!(matches!(result, Err(WardenError::ActuatorFault { .. })));
        assert!(dt.last_command().is_neutral());
    }
}
