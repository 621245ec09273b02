//! `warden-hal` – Hardware access boundary
//!
//! The safety core never touches PWM pins or ADC registers itself.  It talks
//! to the two traits in this crate, and the rest of the workspace only ever
//! sees [`HazardSensors`] and [`Drivetrain`].
//!
//! # Modules
//!
//! - [`sensor`] – [`HazardSensors`][sensor::HazardSensors]: ultrasonic
//!   distance, grayscale line sensors, battery voltage.
//! - [`battery`] – voltage to state-of-charge conversion.
//! - [`actuator`] – [`DriveActuator`][actuator::DriveActuator]: raw motor and
//!   steering servo writes.
//! - [`drivetrain`] – [`Drivetrain`][drivetrain::Drivetrain]: the single,
//!   non-cloneable write capability for the actuator.  Whoever holds the
//!   value is the only writer.
//! - [`sim`] – [`SimRover`][sim::SimRover]: an in-process rover for tests and
//!   the CLI, no hardware required.

pub mod actuator;
pub mod battery;
pub mod drivetrain;
pub mod sensor;
pub mod sim;

pub use actuator::DriveActuator;
pub use battery::voltage_to_percent;
pub use drivetrain::Drivetrain;
pub use sensor::{HazardSensors, cliff_detected};
pub use sim::SimRover;
