//! [`ClientLivenessTracker`] – remote operator heartbeat monitor.
//!
//! Every inbound intent or ping from the transport should call
//! [`ClientLivenessTracker::record_contact`].  The tracker remembers the time
//! of the most recent contact and considers the client *stale* once the
//! configured timeout has been exceeded.
//!
//! A client that has never made contact is never stale: the disconnect hazard
//! can only fire after a first contact.

use std::time::Duration;

use tokio::time::Instant;

// ────────────────────────────────────────────────────────────────────────────
// ClientLivenessTracker
// ────────────────────────────────────────────────────────────────────────────

/// Tracks the last time the remote operator was heard from.
///
/// Time is always passed in by the caller, so the control loop and tests can
/// drive it from a paused tokio clock.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tokio::time::Instant;
/// use warden_kernel::liveness::ClientLivenessTracker;
///
/// let mut liveness = ClientLivenessTracker::new();
/// let start = Instant::now();
/// assert!(!liveness.is_stale(start + Duration::from_secs(60), Duration::from_secs(3)));
///
/// liveness.record_contact(start);
/// assert!(liveness.is_live(start + Duration::from_secs(1), Duration::from_secs(3)));
/// assert!(liveness.is_stale(start + Duration::from_secs(4), Duration::from_secs(3)));
/// ```
#[derive(Debug, Default, Clone)]
pub struct ClientLivenessTracker {
    has_connected: bool,
    last_seen: Option<Instant>,
}

impl ClientLivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound intent or ping at `now`.
    pub fn record_contact(&mut self, now: Instant) {
        self.has_connected = true;
        self.last_seen = Some(now);
    }

    /// `true` once any contact has ever been recorded.
    pub fn has_connected(&self) -> bool {
        self.has_connected
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// `true` when the last contact is older than `timeout`.
    ///
    /// Never stale before first contact.  After [`forget`][Self::forget] the
    /// client is stale immediately, since it was connected and is now gone.
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        if !self.has_connected {
            return false;
        }
        match self.last_seen {
            Some(seen) => now.saturating_duration_since(seen) > timeout,
            None => true,
        }
    }

    /// `true` when a contact arrived within `timeout` of `now`.
    pub fn is_live(&self, now: Instant, timeout: Duration) -> bool {
        self.last_seen
            .is_some_and(|seen| now.saturating_duration_since(seen) <= timeout)
    }

    /// Drop the last-contact timestamp on transport disconnect.
    ///
    /// `has_connected` survives so the disconnect hazard can still fire.
    pub fn forget(&mut self) {
        self.last_seen = None;
    }
}
