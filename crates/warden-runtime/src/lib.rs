//! `warden-runtime` – The Safety Loop
//!
//! Wires the kernel components into one fixed-cadence control loop and sets
//! up process-wide observability.
//!
//! # Modules
//!
//! - [`control_loop`] – [`ControlLoop`][control_loop::ControlLoop]:
//!   polls the [`HazardMonitor`][warden_kernel::HazardMonitor] every tick,
//!   escalates honored hazards to the
//!   [`EmergencyCoordinator`][warden_kernel::EmergencyCoordinator], keeps the
//!   [`RobotModeMachine`][warden_kernel::RobotModeMachine] in lockstep, and
//!   writes the [`MotionArbiter`][warden_kernel::MotionArbiter]'s command.
//!   Transport talks to it through a cloneable
//!   [`ControlHandle`][control_loop::ControlHandle].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to Jaeger, Grafana Tempo, or any OTLP-compatible collector.

pub mod control_loop;
pub mod telemetry;

pub use control_loop::{ControlCommand, ControlHandle, ControlLoop};
pub use telemetry::{init_tracing, LogFormat, TracerProviderGuard};
