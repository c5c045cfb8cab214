//! Gateway discovery state machine.
//!
//! ```text
//!   start / timeout / rediscovery
//! Idle ──────────────────────────▶ Broadcasting
//!   ▲                                  │ GET_PAN_GATEWAY written
//!   │ PAN_GATEWAY from a new peer      ▼
//!   │ (timeout re-armed)               │
//!   └────────────────────────── AwaitingResponse
//! ```
//!
//! The machine only tracks what should happen; the engine builds the
//! broadcast packet and writes it when the socket is writable.

use lifx_core::Millis;
use serde::Serialize;

/// Where discovery currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryState {
    #[default]
    Idle,
    /// A GET_PAN_GATEWAY broadcast is waiting to be written.
    Broadcasting,
    AwaitingResponse,
}

#[derive(Debug, Default)]
pub struct Discovery {
    state: DiscoveryState,
    timeout_at: Option<Millis>,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn timeout_at(&self) -> Option<Millis> {
        self.timeout_at
    }

    /// Requests a broadcast and arms the next timeout `interval` from now.
    pub fn start(&mut self, now: Millis, interval: Millis) {
        self.state = DiscoveryState::Broadcasting;
        self.timeout_at = Some(now.saturating_add(interval));
    }

    /// Requests an immediate broadcast, keeping the armed timeout.
    pub fn request_broadcast(&mut self) {
        self.state = DiscoveryState::Broadcasting;
    }

    pub fn broadcast_pending(&self) -> bool {
        self.state == DiscoveryState::Broadcasting
    }

    /// The broadcast went out (or could not be sent and will be retried on
    /// the next timeout).
    pub fn broadcast_done(&mut self) {
        if self.state == DiscoveryState::Broadcasting {
            self.state = DiscoveryState::AwaitingResponse;
        }
    }

    /// A previously unknown gateway answered: the pending timeout is
    /// replaced by one `interval` from now.
    pub fn gateway_found(&mut self, now: Millis, interval: Millis) {
        self.state = DiscoveryState::Idle;
        self.timeout_at = Some(now.saturating_add(interval));
    }

    pub fn is_due(&self, now: Millis) -> bool {
        self.timeout_at.is_some_and(|at| now >= at)
    }

    pub fn stop(&mut self) {
        self.state = DiscoveryState::Idle;
        self.timeout_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_cycle() {
        let mut discovery = Discovery::new();
        assert_eq!(discovery.state(), DiscoveryState::Idle);
        assert!(!discovery.is_due(0));

        discovery.start(100, 2000);
        assert!(discovery.broadcast_pending());
        assert_eq!(discovery.timeout_at(), Some(2100));

        discovery.broadcast_done();
        assert_eq!(discovery.state(), DiscoveryState::AwaitingResponse);
        assert!(!discovery.is_due(2099));
        assert!(discovery.is_due(2100));

        discovery.gateway_found(500, 10_000);
        assert_eq!(discovery.state(), DiscoveryState::Idle);
        assert!(!discovery.broadcast_pending());
        // Re-armed so new gateways keep being found
        assert_eq!(discovery.timeout_at(), Some(10_500));
        assert!(!discovery.is_due(2100));
    }

    #[test]
    fn test_broadcast_done_only_after_request() {
        let mut discovery = Discovery::new();
        discovery.broadcast_done();
        assert_eq!(discovery.state(), DiscoveryState::Idle);

        discovery.request_broadcast();
        assert!(discovery.broadcast_pending());
        assert_eq!(discovery.timeout_at(), None);

        discovery.stop();
        assert!(!discovery.broadcast_pending());
    }
}
