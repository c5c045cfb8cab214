//! Liveness sweep.
//!
//! Runs on the engine every `watchdog_interval_ms` while something is known.
//! Bulbs that stopped reporting their state and gateways that stopped
//! answering are closed; closing anything triggers a discovery broadcast so
//! devices that came back are found again.

use std::net::SocketAddr;

use tracing::{info, warn};

use lifx_core::{DeviceAddr, Millis};

use crate::engine::Engine;
use crate::event::CloseReason;

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub closed_bulbs: Vec<DeviceAddr>,
    pub closed_gateways: Vec<SocketAddr>,
    pub refreshed_gateways: Vec<SocketAddr>,
    /// A discovery broadcast was requested.
    pub rediscover: bool,
}

impl Engine {
    /// True when there is anything for the watchdog to look at.
    pub fn needs_watchdog(&self) -> bool {
        !self.bulbs.is_empty() || !self.gateways.is_empty()
    }

    /// Closes stale bulbs and gateways, forces a refresh on slow ones.
    pub fn watchdog_sweep(&mut self, now: Millis) -> SweepReport {
        let timeout = self.config.device_timeout_ms;
        let force_refresh = self.config.force_refresh_ms;
        let mut report = SweepReport::default();

        // A gateway that stopped answering altogether never updates its
        // latency, so silence counts as lag too. A gateway without bulbs has
        // nothing to report and is judged on latency alone. Taken before any
        // bulb is closed below.
        let gateway_lags: Vec<(SocketAddr, Millis)> = self
            .gateways
            .values()
            .map(|gw| {
                let silence = if gw.bulbs().is_empty() {
                    0
                } else {
                    now.saturating_sub(gw.last_pkt_at())
                };
                (gw.peer(), gw.latency().max(silence))
            })
            .collect();

        let stale_bulbs: Vec<(DeviceAddr, Millis)> = self
            .bulbs
            .iter()
            .map(|bulb| (bulb.addr, bulb.lag(now)))
            .filter(|(_, lag)| *lag >= timeout)
            .collect();
        for (addr, lag) in stale_bulbs {
            if let Some(bulb) = self.bulbs.get(&addr) {
                info!(
                    bulb = %addr,
                    label = %bulb.state.label,
                    lag_ms = lag,
                    "closing bulb that didn't send a state update"
                );
            }
            self.close_bulb(&addr, CloseReason::Timeout);
            report.closed_bulbs.push(addr);
        }

        for (peer, lag) in gateway_lags {
            if lag >= timeout {
                warn!(gateway = %peer, lag_ms = lag, "closing gateway that timed out");
                self.close_gateway(&peer, CloseReason::Timeout);
                report.closed_gateways.push(peer);
            } else if lag >= force_refresh {
                warn!(gateway = %peer, lag_ms = lag, "gateway is lagging, forcing a refresh");
                self.force_refresh(&peer);
                report.refreshed_gateways.push(peer);
            }
        }

        if !report.closed_bulbs.is_empty() || !report.closed_gateways.is_empty() {
            info!("sending a discovery packet after closing stale devices");
            self.request_rediscovery();
            report.rediscover = true;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifx_core::{PowerLevel, TagMask};

    use crate::engine::tests::{bulb_addr, engine, light_status, peer, with_bulbs, SITE_A};
    use crate::event::EngineEvent;

    #[test]
    fn test_stale_bulb_closed_and_rediscovery_requested() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[1, 2], 0);
        // bulb2 keeps reporting, and so does the gateway
        let fresh = light_status(SITE_A, bulb_addr(2), "bulb2", PowerLevel::Off, TagMask::EMPTY);
        engine.handle_datagram(peer(1), &fresh, 2900);
        engine.drain_events();

        let report = engine.watchdog_sweep(3000);
        assert_eq!(report.closed_bulbs, vec![bulb_addr(1)]);
        assert!(report.closed_gateways.is_empty());
        assert!(report.rediscover);
        assert!(engine.discovery().broadcast_pending());
        assert!(engine.bulbs().get(&bulb_addr(1)).is_none());
        assert!(!engine.gateway(&peer(1)).unwrap().bulbs().contains(&bulb_addr(1)));
        assert_eq!(
            engine.drain_events(),
            vec![EngineEvent::BulbClosed {
                addr: bulb_addr(1),
                reason: CloseReason::Timeout
            }]
        );
    }

    #[test]
    fn test_nothing_stale() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[1], 1000);
        let report = engine.watchdog_sweep(1500);
        assert_eq!(report, SweepReport::default());
        assert!(!engine.discovery().broadcast_pending());
    }

    #[test]
    fn test_lagging_gateway_gets_forced_refresh() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[1], 0);
        let report = engine.watchdog_sweep(2100);
        assert_eq!(report.refreshed_gateways, vec![peer(1)]);
        assert!(report.closed_bulbs.is_empty());
        assert!(engine.gateway(&peer(1)).unwrap().pending_refresh());
        assert!(!report.rediscover);
    }

    #[test]
    fn test_quiet_gateway_without_bulbs_kept() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[], 0);
        let report = engine.watchdog_sweep(10_000);
        assert_eq!(report, SweepReport::default());
        assert!(engine.gateway(&peer(1)).is_some());
        assert!(!engine.discovery().broadcast_pending());
    }

    #[test]
    fn test_silent_gateway_closed() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[1], 0);
        let report = engine.watchdog_sweep(3000);
        assert_eq!(report.closed_gateways, vec![peer(1)]);
        assert!(engine.gateway(&peer(1)).is_none());
        assert!(engine.bulbs().is_empty());
        assert!(!engine.needs_watchdog());
    }

    #[test]
    fn test_high_latency_gateway_closed() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[], 0);
        {
            let gw = engine.gateways.get_mut(&peer(1)).unwrap();
            gw.last_req_at = 1000;
            gw.last_pkt_at = 4500;
        }
        let report = engine.watchdog_sweep(4600);
        assert_eq!(report.closed_gateways, vec![peer(1)]);
    }
}
