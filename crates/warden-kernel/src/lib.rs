//! `warden-kernel` – Safety & Motion Authority
//!
//! The brainstem of the rover.  It does not plan; it decides who may move the
//! wheels and takes over when something is about to go wrong.
//!
//! # Modules
//!
//! - [`liveness`] – [`ClientLivenessTracker`][liveness::ClientLivenessTracker]:
//!   remembers when the remote operator was last heard from.
//! - [`hazard_monitor`] – [`HazardMonitor`][hazard_monitor::HazardMonitor]:
//!   refreshes the sensor snapshot every tick and classifies at most one
//!   [`HazardKind`][warden_types::HazardKind].
//! - [`mode_machine`] – [`RobotModeMachine`][mode_machine::RobotModeMachine]:
//!   the robot's operating mode and which hazards each mode honors.
//! - [`emergency`] – [`EmergencyCoordinator`][emergency::EmergencyCoordinator]:
//!   the single active emergency, its recovery task, and the drivetrain it
//!   leases.
//! - [`recovery`] – the recovery routine for each hazard kind.
//! - [`arbiter`] – [`MotionArbiter`][arbiter::MotionArbiter]: acceleration
//!   limiting, emergency constraints, and the differential-steering mix.

pub mod arbiter;
pub mod emergency;
pub mod hazard_monitor;
pub mod liveness;
pub mod mode_machine;
pub mod recovery;

pub use arbiter::{Arbitration, MotionArbiter};
pub use emergency::{EmergencyCoordinator, FinishedRecovery, RecoveryContext};
pub use hazard_monitor::{HazardMonitor, HazardReading};
pub use liveness::ClientLivenessTracker;
pub use mode_machine::{ModeTransition, RobotModeMachine};
pub use recovery::{RecoveryOutcome, TickSample};
