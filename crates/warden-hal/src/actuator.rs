//! Raw `DriveActuator` trait for the rover's two drive motors and steering
//! servo.
//!
//! Drivers implement this trait and hand it to a
//! [`Drivetrain`][crate::drivetrain::Drivetrain].  Nothing else in the
//! workspace calls these methods directly, so the single-writer rule is
//! enforced by whoever owns the `Drivetrain`.

use warden_types::{Side, WardenError};

/// Low-level motor and steering output.
pub trait DriveActuator: Send {
    /// Drive one motor at `power` percent, `-100.0..=100.0`.  Negative is
    /// reverse.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::ActuatorFault`] if the PWM write fails.
    fn write_motor(&mut self, side: Side, power: f32) -> Result<(), WardenError>;

    /// Point the steering servo at `angle_deg` from centre.  Positive is
    /// right.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::ActuatorFault`] if the servo write fails.
    fn write_steering(&mut self, angle_deg: f32) -> Result<(), WardenError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal in-process actuator used only for tests.
    #[derive(Default)]
    struct MockActuator {
        left: f32,
        right: f32,
        steering: f32,
    }

    impl DriveActuator for MockActuator {
        fn write_motor(&mut self, side: Side, power: f32) -> Result<(), WardenError> {
            match side {
                Side::Left => self.left = power,
                Side::Right => self.right = power,
            }
            Ok(())
        }

        fn write_steering(&mut self, angle_deg: f32) -> Result<(), WardenError> {
            self.steering = angle_deg;
            Ok(())
        }
    }

    #[test]
    fn mock_actuator_records_each_side() {
        let mut act = MockActuator::default();
        act.write_motor(Side::Left, 40.0).unwrap();
        act.write_motor(Side::Right, -25.0).unwrap();
        act.write_steering(12.5).unwrap();
        assert_eq!(act.left, 40.0);
        assert_eq!(act.right, -25.0);
        assert_eq!(act.steering, 12.5);
    }
}
