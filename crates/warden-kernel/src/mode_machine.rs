//! [`RobotModeMachine`] – the single owner of the robot's [`RobotMode`].
//!
//! The machine decides two things for the rest of the kernel:
//!
//! - which mode the robot is in, and therefore who may drive it
//!   ([`RobotModeMachine::intent_source`]);
//! - whether a classified hazard is *honored* in that mode
//!   ([`RobotModeMachine::honors`]).
//!
//! `EmergencyControl` is entered and left in lockstep with the emergency
//! coordinator.  The mode that was active when the emergency started is
//! remembered and restored on exit, and hazard eligibility while in
//! `EmergencyControl` follows that remembered mode.  Operator mode requests
//! are refused only while the emergency owns the actuator; during a
//! `LowBattery` warning an accepted request replaces the remembered mode.
//!
//! # Transitions
//!
//! | From | Event | To |
//! |------|-------|----|
//! | `WaitingForClient` | transport connected | `WaitingForInput` |
//! | `WaitingForInput` | first motion intent | `ControlledByClient` |
//! | any non-emergency | operator selects a special mode | that mode |
//! | `EmergencyControl` (`LowBattery`) | operator selects a mode | remembered mode replaced |
//! | special mode | operator selects `ControlledByClient` | `ControlledByClient` |
//! | any | honored hazard activates | `EmergencyControl` |
//! | `EmergencyControl` | emergency clears | remembered mode |
//! | any | transport disconnected | `WaitingForInput` |

use tracing::{info, warn};
use warden_types::{HazardKind, IntentSource, RobotMode, WardenError};

/// A mode change, reported so the caller can publish it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTransition {
    pub from: RobotMode,
    pub to: RobotMode,
}

#[derive(Debug, Clone)]
pub struct RobotModeMachine {
    mode: RobotMode,
    /// Mode to restore when the active emergency clears.
    resume: Option<RobotMode>,
    /// Kind of the emergency behind `EmergencyControl`.
    emergency: Option<HazardKind>,
    transport_connected: bool,
}

impl Default for RobotModeMachine {
    fn default() -> Self {
        Self {
            mode: RobotMode::WaitingForClient,
            resume: None,
            emergency: None,
            transport_connected: false,
        }
    }
}

impl RobotModeMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> RobotMode {
        self.mode
    }

    /// The mode that [`exit_emergency`][Self::exit_emergency] will restore,
    /// or `None` outside `EmergencyControl`.
    pub fn resume_mode(&self) -> Option<RobotMode> {
        self.resume
    }

    /// The mode whose rules currently apply: the remembered mode while in
    /// `EmergencyControl`, otherwise the current one.
    fn effective(&self) -> RobotMode {
        self.resume.unwrap_or(self.mode)
    }

    // ── Transport events ────────────────────────────────────────────────────

    pub fn on_transport_connected(&mut self) -> Option<ModeTransition> {
        self.transport_connected = true;
        if self.mode == RobotMode::WaitingForClient {
            return self.set(RobotMode::WaitingForInput);
        }
        None
    }

    /// Any mode falls back to `WaitingForInput`.  During an emergency the
    /// machine stays in `EmergencyControl` and lands there once it clears.
    pub fn on_transport_disconnected(&mut self) -> Option<ModeTransition> {
        self.transport_connected = false;
        if self.mode == RobotMode::EmergencyControl {
            self.resume = Some(RobotMode::WaitingForInput);
            return None;
        }
        self.set(RobotMode::WaitingForInput)
    }

    /// A motion intent arrived.  The first one hands control to the operator.
    ///
    /// An intent implies a live transport, so one arriving before the
    /// connect event is treated as both.
    pub fn on_intent(&mut self) -> Option<ModeTransition> {
        self.transport_connected = true;
        match self.mode {
            RobotMode::WaitingForClient | RobotMode::WaitingForInput => {
                self.set(RobotMode::ControlledByClient)
            }
            RobotMode::EmergencyControl => {
                if matches!(
                    self.resume,
                    Some(RobotMode::WaitingForClient | RobotMode::WaitingForInput)
                ) {
                    self.resume = Some(RobotMode::ControlledByClient);
                }
                None
            }
            _ => None,
        }
    }

    // ── Operator requests ───────────────────────────────────────────────────

    /// Switch to `target` on operator request.
    ///
    /// # Errors
    ///
    /// While an emergency that leaves the actuator alone is active, an
    /// accepted request only replaces the remembered mode and `Ok(None)` is
    /// returned; the robot lands in `target` once the emergency clears.
    ///
    /// # Errors
    ///
    /// [`WardenError::ModeTransitionRejected`] when `target` is not
    /// operator-selectable, an emergency owns the actuator, or no transport
    /// has connected yet.  The mode is left unchanged.
    pub fn request_mode(&mut self, target: RobotMode) -> Result<Option<ModeTransition>, WardenError> {
        let selectable = target.is_special() || target == RobotMode::ControlledByClient;
        if !selectable || self.actuator_held() || !self.transport_connected {
            warn!(from = %self.mode, to = %target, "mode request rejected");
            return Err(WardenError::ModeTransitionRejected {
                from: self.mode,
                to: target,
            });
        }
        if target == self.effective() {
            return Ok(None);
        }
        if self.mode == RobotMode::EmergencyControl {
            info!(from = ?self.resume, to = %target, "resume mode replaced during emergency");
            self.resume = Some(target);
            return Ok(None);
        }
        Ok(self.set(target))
    }

    /// The mode the operator sees as selected: the remembered mode during an
    /// emergency, otherwise the current one.
    pub fn selected(&self) -> RobotMode {
        self.effective()
    }

    fn actuator_held(&self) -> bool {
        self.mode == RobotMode::EmergencyControl
            && self.emergency.is_none_or(HazardKind::owns_actuator)
    }

    /// Select `mode`, or return to `ControlledByClient` if it is already the
    /// current mode.
    ///
    /// # Errors
    ///
    /// As [`request_mode`][Self::request_mode]; `mode` must be a special mode.
    pub fn toggle_special(&mut self, mode: RobotMode) -> Result<Option<ModeTransition>, WardenError> {
        if !mode.is_special() {
            return Err(WardenError::ModeTransitionRejected {
                from: self.mode,
                to: mode,
            });
        }
        if self.effective() == mode {
            self.request_mode(RobotMode::ControlledByClient)
        } else {
            self.request_mode(mode)
        }
    }

    // ── Emergency lockstep ──────────────────────────────────────────────────

    /// Whether a hazard of `kind` should activate in the current mode.
    pub fn honors(&self, kind: HazardKind) -> bool {
        if kind == HazardKind::ManualStop {
            return true;
        }
        match self.effective() {
            RobotMode::GptControlled => false,
            RobotMode::CircuitMode | RobotMode::DemoMode | RobotMode::TrackingMode => {
                matches!(kind, HazardKind::CollisionFront | HazardKind::EdgeDetected)
            }
            _ => true,
        }
    }

    /// Enter `EmergencyControl` for `kind`, remembering the current mode.
    /// Calling it again while already in an emergency (supersession) records
    /// the new kind and keeps the original remembered mode.
    pub fn enter_emergency(&mut self, kind: HazardKind) -> Option<ModeTransition> {
        self.emergency = Some(kind);
        if self.mode == RobotMode::EmergencyControl {
            return None;
        }
        self.resume = Some(self.mode);
        self.set(RobotMode::EmergencyControl)
    }

    /// Leave `EmergencyControl` for the remembered mode.
    pub fn exit_emergency(&mut self) -> Option<ModeTransition> {
        self.emergency = None;
        if self.mode != RobotMode::EmergencyControl {
            return None;
        }
        let back = self.resume.take().unwrap_or(RobotMode::WaitingForInput);
        self.set(back)
    }

    /// Who is allowed to drive in the current mode.  `None` means nobody:
    /// the arbiter holds the robot still.
    pub fn intent_source(&self) -> Option<IntentSource> {
        match self.effective() {
            RobotMode::ControlledByClient => Some(IntentSource::Operator),
            mode if mode.is_special() => Some(IntentSource::Autonomous),
            _ => None,
        }
    }

    fn set(&mut self, to: RobotMode) -> Option<ModeTransition> {
        let from = self.mode;
        if from == to {
            return None;
        }
        self.mode = to;
        info!(%from, %to, "robot mode changed");
        Some(ModeTransition { from, to })
    }
}
