//! The device protocol engine.
//!
//! `Engine` owns every registry (bulbs, gateways, tags), the discovery state
//! machine and the configuration. It never reads the clock or touches a
//! socket: callers pass the current time to every entry point and hand a
//! [`DatagramSink`] to [`Engine::flush`]. The actor drives it from a single
//! task; tests drive it directly.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()`, `panic!()` or unchecked indexing. Packets
//! that cannot be decoded are logged and dropped.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use rand::Rng;
use tracing::{debug, info, warn};

use lifx_core::{DeviceAddr, LightState, Millis, PowerLevel, SiteId, TagMask};
use lifx_protocol::{
    Datagram, OutboundPacket, PacketHeader, PacketKind, PacketType, Payload, Target,
};

use crate::bulb::{Bulb, BulbIp, BulbRegistry, BulbView, HARDWARE_INFO_POLL_MS};
use crate::config::EngineConfig;
use crate::discovery::Discovery;
use crate::event::{CloseReason, EngineEvent};
use crate::gateway::{DatagramSink, Gateway, GatewayError};
use crate::tagging::TagRegistry;

/// Picks a random non-zero client id.
fn random_client_id() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

// ============================================================================
// Engine
// ============================================================================

/// Owner of all device state.
#[derive(Debug)]
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) client_id: u32,
    pub(crate) bulbs: BulbRegistry,
    /// Gateways keyed by peer address: several gateways can share a site.
    pub(crate) gateways: BTreeMap<SocketAddr, Gateway>,
    pub(crate) tags: TagRegistry,
    pub(crate) discovery: Discovery,
    events: Vec<EngineEvent>,
}

impl Engine {
    /// Creates an engine with a random client id.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_client_id(config, random_client_id())
    }

    /// Creates an engine with a fixed client id, zero being replaced.
    pub fn with_client_id(config: EngineConfig, client_id: u32) -> Self {
        let client_id = if client_id == 0 {
            random_client_id()
        } else {
            client_id
        };
        Self {
            config,
            client_id,
            bulbs: BulbRegistry::new(),
            gateways: BTreeMap::new(),
            tags: TagRegistry::new(),
            discovery: Discovery::new(),
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn bulbs(&self) -> &BulbRegistry {
        &self.bulbs
    }

    pub fn gateway(&self, peer: &SocketAddr) -> Option<&Gateway> {
        self.gateways.get(peer)
    }

    pub fn gateways(&self) -> impl Iterator<Item = &Gateway> {
        self.gateways.values()
    }

    pub fn tags(&self) -> &TagRegistry {
        &self.tags
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Events since the last call, tag events included.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = std::mem::take(&mut self.events);
        events.extend(self.tags.drain_events());
        events
    }

    /// Snapshot of a bulb.
    pub fn bulb_view(&self, addr: &DeviceAddr) -> Option<BulbView> {
        let bulb = self.bulbs.get(addr)?;
        let gw = self.gateways.get(&bulb.gateway);
        let site = gw.map(Gateway::site).unwrap_or_default();
        let tags = gw
            .map(|gw| gw.tag_labels_of(bulb.state.tags))
            .unwrap_or_default();
        Some(BulbView::new(bulb, site, tags))
    }

    /// Snapshot of every bulb.
    pub fn bulb_views(&self) -> Vec<BulbView> {
        self.bulbs
            .iter()
            .filter_map(|bulb| self.bulb_view(&bulb.addr))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    fn discovery_interval(&self) -> Millis {
        if self.gateways.is_empty() {
            self.config.active_discovery_interval_ms
        } else {
            self.config.passive_discovery_interval_ms
        }
    }

    /// Broadcasts a discovery packet and arms the discovery timeout.
    pub fn start_discovery(&mut self, now: Millis) {
        let interval = self.discovery_interval();
        debug!(interval_ms = interval, "starting discovery");
        self.discovery.start(now, interval);
    }

    /// Broadcasts a discovery packet as soon as possible.
    pub fn request_rediscovery(&mut self) {
        self.discovery.request_broadcast();
    }

    fn on_discovery_timeout(&mut self, now: Millis) {
        if self.gateways.is_empty() {
            debug!(
                interval_ms = self.config.active_discovery_interval_ms,
                "discovery found nothing, restarting it"
            );
        } else {
            debug!("sending periodic discovery packet");
        }
        self.start_discovery(now);
    }

    /// The GET_PAN_GATEWAY broadcast.
    pub fn discovery_packet(&self) -> Result<OutboundPacket, lifx_protocol::WireError> {
        OutboundPacket::new(
            PacketType::GetPanGateway,
            Target::AllDevices,
            None,
            self.client_id,
            Payload::Empty,
        )
    }

    // ------------------------------------------------------------------------
    // Inbound datagrams
    // ------------------------------------------------------------------------

    /// Processes one datagram received from `peer` at `now`.
    pub fn handle_datagram(&mut self, peer: SocketAddr, bytes: &[u8], now: Millis) {
        let datagram = match Datagram::parse(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(peer = %peer, error = %e, "dropping invalid packet");
                return;
            }
        };
        let header = datagram.header;

        if !header.version().is_supported() {
            warn!(
                peer = %peer,
                version = %header.version(),
                "unsupported protocol version, trying anyway"
            );
        }
        // Our own discovery broadcast coming back
        if header.packet_type == PacketType::GetPanGateway.code() {
            return;
        }
        let Some(packet_type) = header.known_type() else {
            warn!(peer = %peer, packet_type = header.packet_type, "unknown packet type");
            return;
        };
        if !header.is_addressable() {
            warn!(peer = %peer, packet = %packet_type, "dropping non-addressable packet");
            return;
        }

        if packet_type == PacketType::PanGateway && !self.gateways.contains_key(&peer) {
            self.open_gateway(peer, header.site, now);
        }
        let Some(gw) = self.gateways.get_mut(&peer) else {
            warn!(peer = %peer, packet = %packet_type, "packet from unknown gateway");
            return;
        };
        if packet_type != PacketType::PanGateway && header.site != gw.site() {
            warn!(
                peer = %peer,
                packet = %packet_type,
                site = %header.site,
                expected = %gw.site(),
                "dropping packet with mismatched site"
            );
            return;
        }
        gw.last_pkt_at = now;

        match packet_type.kind() {
            PacketKind::Unimplemented => {
                info!(peer = %peer, packet = %packet_type, "unimplemented packet");
            }
            PacketKind::RequestOnly => {
                debug!(peer = %peer, packet = %packet_type, "ignoring request packet");
            }
            PacketKind::Handled => match Payload::decode(packet_type, datagram.payload) {
                Ok(payload) => self.dispatch(peer, &header, packet_type, payload, now),
                Err(e) => warn!(peer = %peer, error = %e, "dropping undecodable packet"),
            },
        }
    }

    fn open_gateway(&mut self, peer: SocketAddr, site: SiteId, now: Millis) {
        let gw = Gateway::new(
            peer,
            site,
            self.client_id,
            now,
            self.config.min_refresh_interval_ms,
        );
        info!(peer = %peer, site = %site, "gateway discovered");
        self.gateways.insert(peer, gw);
        let interval = self.discovery_interval();
        self.discovery.gateway_found(now, interval);
        self.events.push(EngineEvent::GatewayOpened { peer, site });
    }

    /// Routes a decoded packet to its handler.
    fn dispatch(
        &mut self,
        peer: SocketAddr,
        header: &PacketHeader,
        packet_type: PacketType,
        payload: Payload,
        now: Millis,
    ) {
        let addr = header.device_addr();
        match payload {
            Payload::PanGateway(p) => {
                debug!(peer = %peer, service = p.service, port = p.port, "PAN_GATEWAY");
            }
            Payload::LightStatus(state) => self.handle_light_status(peer, addr, state, now),
            Payload::Power(power) => self.handle_power_state(peer, addr, power, now),
            Payload::Tags(tags) => self.handle_tags(peer, addr, tags, now),
            Payload::TagLabels(p) => {
                let Some(gw) = self.gateways.get_mut(&peer) else {
                    return;
                };
                for id in p.tags.iter() {
                    if !p.label.is_empty() {
                        self.tags.allocate(gw, Some(id), p.label);
                    }
                }
            }
            Payload::Label(label) => {
                if let Some(bulb) = self.get_or_open_bulb(peer, addr, now) {
                    bulb.set_label(label);
                }
            }
            Payload::IpState(state) => {
                let ip = match packet_type {
                    PacketType::MeshInfo => BulbIp::Mcu,
                    _ => BulbIp::Wifi,
                };
                if let Some(bulb) = self.get_or_open_bulb(peer, addr, now) {
                    bulb.set_ip_state(ip, state, now);
                }
            }
            Payload::Firmware(info) => {
                let ip = match packet_type {
                    PacketType::MeshFirmware => BulbIp::Mcu,
                    _ => BulbIp::Wifi,
                };
                if let Some(bulb) = self.get_or_open_bulb(peer, addr, now) {
                    bulb.set_ip_firmware(ip, info, now);
                }
            }
            Payload::Product(info) => {
                if let Some(bulb) = self.get_or_open_bulb(peer, addr, now) {
                    bulb.set_product_info(info);
                    debug!(bulb = %addr, vendor = bulb.vendor(), model = bulb.model(), "product info");
                }
            }
            Payload::Runtime(info) => {
                if let Some(bulb) = self.get_or_open_bulb(peer, addr, now) {
                    bulb.set_runtime_info(info, now);
                }
            }
            Payload::AmbientLight(p) => {
                if let Some(bulb) = self.get_or_open_bulb(peer, addr, now) {
                    bulb.ambient_light = Some(p.illuminance);
                }
            }
            Payload::Empty | Payload::LightColor(_) | Payload::Waveform(_) => {
                debug!(peer = %peer, packet = %packet_type, "nothing to do");
            }
        }
    }

    /// Looks a bulb up, creating it on the gateway it was heard from.
    ///
    /// A bulb that moved to another gateway is re-homed.
    fn get_or_open_bulb(
        &mut self,
        peer: SocketAddr,
        addr: DeviceAddr,
        now: Millis,
    ) -> Option<&mut Bulb> {
        let homed_elsewhere = self
            .bulbs
            .get(&addr)
            .is_some_and(|bulb| bulb.gateway != peer);
        if homed_elsewhere {
            info!(bulb = %addr, gateway = %peer, "bulb moved to another gateway");
            self.close_bulb(&addr, CloseReason::GatewayClosed);
        }
        if !self.bulbs.contains(&addr) {
            let gw = self.gateways.get_mut(&peer)?;
            gw.bulbs.insert(addr);
            self.bulbs.insert(Bulb::new(addr, peer, now));
            info!(bulb = %addr, gateway = %peer, "bulb discovered");
            self.events.push(EngineEvent::BulbOpened { addr, gateway: peer });
        }
        self.bulbs.get_mut(&addr)
    }

    fn handle_light_status(
        &mut self,
        peer: SocketAddr,
        addr: DeviceAddr,
        state: LightState,
        now: Millis,
    ) {
        debug!(
            bulb = %addr,
            hue = state.color.hue,
            saturation = state.color.saturation,
            brightness = state.color.brightness,
            kelvin = state.color.kelvin,
            power = %state.power,
            label = %state.label,
            tags = %state.tags,
            "LIGHT_STATUS"
        );
        if self.get_or_open_bulb(peer, addr, now).is_none() {
            return;
        }
        let retransmit_delay = self.config.power_retransmit_delay_ms;
        let min_refresh = self.config.min_refresh_interval_ms;
        let (Some(bulb), Some(gw)) = (self.bulbs.get_mut(&addr), self.gateways.get_mut(&peer))
        else {
            return;
        };

        let change = bulb.set_light_state(state, gw.last_pkt_at);
        if change.power_changed {
            send_logged(gw, PacketType::GetInfo, Target::Device(addr), Payload::Empty);
        }
        self.tags
            .update_refcounts(gw, change.old_tags, change.new_tags);

        if let Some(dirty_at) = bulb.dirty_at {
            if bulb.last_light_state_at > dirty_at
                && gw.last_pkt_at.saturating_sub(dirty_at) > retransmit_delay
            {
                if bulb.state.power == bulb.expected_power {
                    debug!(bulb = %addr, "power change confirmed");
                    bulb.dirty_at = None;
                } else {
                    warn!(bulb = %addr, power = %bulb.expected_power, "retransmitting power change");
                    send_logged(
                        gw,
                        PacketType::SetPowerState,
                        Target::Device(addr),
                        Payload::Power(bulb.expected_power),
                    );
                }
            }
        }

        let latency = gw.latency();
        if latency < min_refresh {
            if gw.refresh_at.is_none() {
                let delay = min_refresh - latency;
                debug!(gateway = %peer, latency, delay, "scheduling next refresh");
                gw.refresh_at = Some(now.saturating_add(delay));
            }
        } else if !gw.pending_refresh_req {
            debug!(gateway = %peer, latency, "refreshing now");
            if let Err(e) = gw.send_get_all_light_state() {
                warn!(gateway = %peer, error = %e, "cannot refresh");
            }
        }
    }

    fn handle_power_state(&mut self, peer: SocketAddr, addr: DeviceAddr, power: PowerLevel, now: Millis) {
        let Some(bulb) = self.get_or_open_bulb(peer, addr, now) else {
            return;
        };
        if bulb.set_power_state(power) {
            if let Some(gw) = self.gateways.get_mut(&peer) {
                send_logged(gw, PacketType::GetInfo, Target::Device(addr), Payload::Empty);
            }
        }
    }

    fn handle_tags(&mut self, peer: SocketAddr, addr: DeviceAddr, tags: TagMask, now: Millis) {
        let Some(bulb) = self.get_or_open_bulb(peer, addr, now) else {
            return;
        };
        let old = bulb.set_tags(tags);
        if let Some(gw) = self.gateways.get_mut(&peer) {
            self.tags.update_refcounts(gw, old, tags);
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<Millis> {
        let refreshes = self.gateways.values().filter_map(Gateway::refresh_deadline);
        let polls = self.bulbs.iter().filter_map(|b| b.next_info_poll_at);
        refreshes
            .chain(polls)
            .chain(self.discovery.timeout_at())
            .min()
    }

    /// Fires every deadline that is due at `now`.
    pub fn on_timers(&mut self, now: Millis) {
        if self.discovery.is_due(now) {
            self.on_discovery_timeout(now);
        }

        for gw in self.gateways.values_mut() {
            if gw.refresh_at.is_some_and(|at| now >= at) {
                gw.refresh_at = None;
                if let Err(e) = gw.send_get_all_light_state() {
                    warn!(gateway = %gw.peer(), error = %e, "cannot refresh");
                }
            }
        }

        let due: Vec<DeviceAddr> = self
            .bulbs
            .iter()
            .filter(|b| b.next_info_poll_at.is_some_and(|at| now >= at))
            .map(|b| b.addr)
            .collect();
        for addr in due {
            self.fetch_hardware_info(addr, now);
        }
    }

    /// Asks a bulb for whatever hardware info is still unknown, and keeps
    /// polling until nothing is missing.
    fn fetch_hardware_info(&mut self, addr: DeviceAddr, now: Millis) {
        let Some(bulb) = self.bulbs.get_mut(&addr) else {
            return;
        };
        let Some(gw) = self.gateways.get_mut(&bulb.gateway) else {
            bulb.next_info_poll_at = None;
            return;
        };

        let mut requests = Vec::new();
        if bulb.product.vendor_id == 0 {
            requests.push(PacketType::GetVersion);
        }
        if bulb.mcu.firmware.version == 0 {
            requests.push(PacketType::GetMeshFirmware);
        }
        if bulb.wants_wifi_firmware(now) {
            requests.push(PacketType::GetWifiFirmwareState);
        }

        if requests.is_empty() {
            debug!(bulb = %addr, "hardware info complete");
            bulb.next_info_poll_at = None;
            return;
        }
        for packet_type in requests {
            send_logged(gw, packet_type, Target::Device(addr), Payload::Empty);
        }
        bulb.next_info_poll_at = Some(now.saturating_add(HARDWARE_INFO_POLL_MS));
    }

    /// Forces an immediate refresh of a gateway.
    pub fn force_refresh(&mut self, peer: &SocketAddr) {
        if let Some(gw) = self.gateways.get_mut(peer) {
            gw.refresh_at = None;
            if let Err(e) = gw.send_get_all_light_state() {
                warn!(gateway = %peer, error = %e, "cannot refresh");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// True when something is waiting to be written.
    pub fn has_pending_writes(&self) -> bool {
        self.discovery.broadcast_pending()
            || self.gateways.values().any(Gateway::has_pending_writes)
    }

    /// Writes the pending discovery broadcast and every gateway queue.
    ///
    /// A gateway whose write fails hard is closed and rediscovery requested.
    pub fn flush<S: DatagramSink + ?Sized>(&mut self, sink: &mut S, now: Millis) {
        if self.discovery.broadcast_pending() {
            self.flush_discovery(sink);
        }

        let mut failed = Vec::new();
        for gw in self.gateways.values_mut() {
            if let Err(e) = gw.flush(sink, now) {
                warn!(gateway = %gw.peer(), error = %e, "closing gateway");
                failed.push(gw.peer());
            }
        }
        for peer in failed {
            self.close_gateway(&peer, CloseReason::SocketError);
        }
        // Closing may have requested a new broadcast
        if self.discovery.broadcast_pending() {
            self.flush_discovery(sink);
        }
    }

    fn flush_discovery<S: DatagramSink + ?Sized>(&mut self, sink: &mut S) {
        let packet = match self.discovery_packet() {
            Ok(packet) => packet.encode(),
            Err(e) => {
                warn!(error = %e, "cannot build discovery packet");
                self.discovery.broadcast_done();
                return;
            }
        };
        loop {
            match sink.send_to(&packet, self.config.broadcast) {
                Ok(n) if n == packet.len() => {
                    debug!(to = %self.config.broadcast, "GET_PAN_GATEWAY broadcast");
                    self.discovery.broadcast_done();
                }
                Ok(_) => {
                    warn!("can't broadcast discovery packet: short write");
                    self.discovery.broadcast_done();
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!(error = %e, "can't broadcast discovery packet");
                    self.discovery.broadcast_done();
                }
            }
            return;
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Closes a bulb, releasing its tag refcounts on its gateway.
    pub(crate) fn close_bulb(&mut self, addr: &DeviceAddr, reason: CloseReason) {
        let Some(bulb) = self.bulbs.remove(addr) else {
            return;
        };
        if let Some(gw) = self.gateways.get_mut(&bulb.gateway) {
            gw.bulbs.remove(addr);
            self.tags
                .update_refcounts(gw, bulb.state.tags, TagMask::EMPTY);
        }
        info!(
            bulb = %addr,
            label = %bulb.state.label,
            gateway = %bulb.gateway,
            reason = %reason,
            "closed bulb"
        );
        self.events.push(EngineEvent::BulbClosed {
            addr: *addr,
            reason,
        });
    }

    /// Closes a gateway session with its bulbs and tag ids.
    ///
    /// Anything but a shutdown requests a new discovery broadcast.
    pub fn close_gateway(&mut self, peer: &SocketAddr, reason: CloseReason) {
        let bulbs: Vec<DeviceAddr> = match self.gateways.get(peer) {
            Some(gw) => gw.bulbs().iter().copied().collect(),
            None => return,
        };
        let bulb_reason = match reason {
            CloseReason::Shutdown => CloseReason::Shutdown,
            _ => CloseReason::GatewayClosed,
        };
        for addr in bulbs {
            self.close_bulb(&addr, bulb_reason);
        }
        let Some(mut gw) = self.gateways.remove(peer) else {
            return;
        };
        self.tags.release_gateway(&mut gw);
        info!(gateway = %peer, site = %gw.site(), reason = %reason, "closed gateway");
        self.events.push(EngineEvent::GatewayClosed {
            peer: *peer,
            site: gw.site(),
            reason,
        });
        if reason != CloseReason::Shutdown {
            self.request_rediscovery();
        }
    }

    /// Closes everything.
    pub fn shutdown(&mut self) {
        let peers: Vec<SocketAddr> = self.gateways.keys().copied().collect();
        for peer in peers {
            self.close_gateway(&peer, CloseReason::Shutdown);
        }
        self.discovery.stop();
    }
}

/// Queues a packet, logging instead of failing when it is dropped.
pub(crate) fn send_logged(gw: &mut Gateway, packet_type: PacketType, target: Target, payload: Payload) {
    if let Err(e) = gw.send(packet_type, target, payload) {
        match e {
            GatewayError::QueueFull { .. } => {}
            other => warn!(gateway = %gw.peer(), error = %other, "cannot send packet"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lifx_core::{Hsbk, Label, TagId};
    use lifx_protocol::{HeaderTarget, IpFirmwareInfo, PanGateway, ProductInfo, TagLabels};

    use crate::gateway::tests::RecordingSink;

    // ========================================================================
    // Test Helpers
    // ========================================================================

    pub(crate) const SITE_A: SiteId = SiteId::new([0xa; 6]);
    pub(crate) const SITE_B: SiteId = SiteId::new([0xb; 6]);

    pub(crate) fn peer(n: u8) -> SocketAddr {
        format!("192.168.0.{n}:56700").parse().unwrap()
    }

    pub(crate) fn bulb_addr(n: u8) -> DeviceAddr {
        DeviceAddr::new([0xd0, 0x73, 0xd5, 0, 0, n])
    }

    pub(crate) fn engine() -> Engine {
        Engine::with_client_id(EngineConfig::default(), 0x1234_5678)
    }

    /// Encodes a packet as a gateway would send it.
    pub(crate) fn inbound(
        packet_type: PacketType,
        site: SiteId,
        from: Option<DeviceAddr>,
        payload: Payload,
    ) -> Vec<u8> {
        let target = match from {
            Some(addr) => Target::Device(addr),
            None => Target::Site,
        };
        OutboundPacket::new(packet_type, target, Some(site), 0, payload)
            .unwrap()
            .encode()
    }

    pub(crate) fn pan_gateway(site: SiteId) -> Vec<u8> {
        inbound(
            PacketType::PanGateway,
            site,
            None,
            Payload::PanGateway(PanGateway {
                service: PanGateway::SERVICE_UDP,
                port: 56700,
            }),
        )
    }

    pub(crate) fn light_status(
        site: SiteId,
        addr: DeviceAddr,
        label: &str,
        power: PowerLevel,
        tags: TagMask,
    ) -> Vec<u8> {
        inbound(
            PacketType::LightStatus,
            site,
            Some(addr),
            Payload::LightStatus(LightState {
                color: Hsbk::new(0, 0, 0xffff, 3500),
                dim: 0,
                power,
                label: Label::new(label).unwrap(),
                tags,
            }),
        )
    }

    /// Engine with a gateway at `peer(n)` on `site` and bulbs `addrs`.
    pub(crate) fn with_bulbs(engine: &mut Engine, n: u8, site: SiteId, addrs: &[u8], now: Millis) {
        engine.handle_datagram(peer(n), &pan_gateway(site), now);
        for a in addrs {
            let packet = light_status(site, bulb_addr(*a), &format!("bulb{a}"), PowerLevel::Off, TagMask::EMPTY);
            engine.handle_datagram(peer(n), &packet, now);
        }
    }

    /// Flushes everything and returns the decoded packets per destination.
    pub(crate) fn sent(engine: &mut Engine, now: Millis) -> Vec<(SocketAddr, PacketHeader, Payload)> {
        let mut sink = RecordingSink::default();
        engine.flush(&mut sink, now);
        sink.sent
            .iter()
            .map(|(to, bytes)| {
                let d = Datagram::parse(bytes).unwrap();
                let packet_type = d.header.known_type().unwrap();
                (*to, d.header, Payload::decode(packet_type, d.payload).unwrap())
            })
            .collect()
    }

    fn types(packets: &[(SocketAddr, PacketHeader, Payload)]) -> Vec<PacketType> {
        packets
            .iter()
            .map(|(_, h, _)| h.known_type().unwrap())
            .collect()
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    #[test]
    fn test_pan_gateway_opens_gateway() {
        let mut engine = engine();
        engine.start_discovery(0);
        engine.handle_datagram(peer(1), &pan_gateway(SITE_A), 10);

        let gw = engine.gateway(&peer(1)).unwrap();
        assert_eq!(gw.site(), SITE_A);
        assert_eq!(gw.refresh_deadline(), Some(210));
        assert_eq!(
            engine.drain_events(),
            vec![EngineEvent::GatewayOpened {
                peer: peer(1),
                site: SITE_A
            }]
        );
        assert_eq!(engine.discovery().state(), crate::discovery::DiscoveryState::Idle);
        // Active timeout replaced by the passive one
        let passive = engine.config().passive_discovery_interval_ms;
        assert_eq!(engine.discovery().timeout_at(), Some(10 + passive));
        engine.on_timers(2000);
        assert!(!engine.discovery().broadcast_pending());
    }

    #[test]
    fn test_malformed_packets_are_dropped() {
        let mut engine = engine();
        let mut bytes = pan_gateway(SITE_A);

        engine.handle_datagram(peer(1), &bytes[..20], 0);
        bytes.push(0);
        engine.handle_datagram(peer(1), &bytes, 0);
        assert!(engine.gateway(&peer(1)).is_none());
    }

    #[test]
    fn test_unknown_type_and_unknown_gateway_dropped() {
        let mut engine = engine();
        let mut bytes = inbound(PacketType::GetInfo, SITE_A, None, Payload::Empty);
        bytes[32] = 0xff;
        bytes[33] = 0xff;
        engine.handle_datagram(peer(1), &bytes, 0);
        assert!(engine.gateway(&peer(1)).is_none());

        let status = light_status(SITE_A, bulb_addr(1), "a", PowerLevel::On, TagMask::EMPTY);
        engine.handle_datagram(peer(1), &status, 0);
        assert!(engine.bulbs().is_empty());
    }

    #[test]
    fn test_own_broadcast_is_ignored() {
        let mut engine = engine();
        let echo = engine.discovery_packet().unwrap().encode();
        engine.handle_datagram(peer(1), &echo, 0);
        assert_eq!(engine.gateways().count(), 0);
    }

    #[test]
    fn test_site_mismatch_dropped() {
        let mut engine = engine();
        engine.handle_datagram(peer(1), &pan_gateway(SITE_A), 0);
        let status = light_status(SITE_B, bulb_addr(1), "a", PowerLevel::On, TagMask::EMPTY);
        engine.handle_datagram(peer(1), &status, 50);
        assert!(engine.bulbs().is_empty());
        assert_eq!(engine.gateway(&peer(1)).unwrap().last_pkt_at(), 0);
    }

    #[test]
    fn test_light_status_opens_bulb() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[1], 100);

        let bulb = engine.bulbs().get(&bulb_addr(1)).unwrap();
        assert_eq!(bulb.gateway, peer(1));
        assert!(bulb.state.label.matches("bulb1"));
        assert_eq!(bulb.last_light_state_at, 100);
        assert!(engine.gateway(&peer(1)).unwrap().bulbs().contains(&bulb_addr(1)));

        let view = engine.bulb_view(&bulb_addr(1)).unwrap();
        assert_eq!(view.site, SITE_A);
        assert_eq!(view.label, "bulb1");
    }

    #[test]
    fn test_power_change_requests_info() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[1], 0);
        let _ = sent(&mut engine, 0);

        let on = inbound(PacketType::PowerState, SITE_A, Some(bulb_addr(1)), Payload::Power(PowerLevel::On));
        engine.handle_datagram(peer(1), &on, 10);
        let packets = sent(&mut engine, 10);
        assert_eq!(types(&packets), vec![PacketType::GetInfo]);
        assert_eq!(
            packets[0].1.header_target(),
            HeaderTarget::Device(bulb_addr(1))
        );
        assert_eq!(engine.bulbs().get(&bulb_addr(1)).unwrap().state.power, PowerLevel::On);
    }

    #[test]
    fn test_tag_labels_bind_tags() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[], 0);
        let labels = inbound(
            PacketType::TagLabels,
            SITE_A,
            None,
            Payload::TagLabels(TagLabels {
                tags: TagMask::from_bits(1 << 42),
                label: Label::new("foo").unwrap(),
            }),
        );
        engine.handle_datagram(peer(1), &labels, 10);

        let id = TagId::new(42).unwrap();
        let gw = engine.gateway(&peer(1)).unwrap();
        assert!(gw.tag_ids().contains(id));
        assert_eq!(gw.tag_id_of(&Label::new("foo").unwrap()), Some(id));
        let tag = engine.tags().find(&Label::new("foo").unwrap()).unwrap();
        assert_eq!(tag.id_on(peer(1)), Some(id));
    }

    #[test]
    fn test_info_handlers() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[1], 0);
        let from = Some(bulb_addr(1));

        let version = inbound(
            PacketType::VersionState,
            SITE_A,
            from,
            Payload::Product(ProductInfo { vendor_id: 1, product_id: 3, version: 0 }),
        );
        engine.handle_datagram(peer(1), &version, 5);
        let fw = inbound(
            PacketType::WifiFirmwareState,
            SITE_A,
            from,
            Payload::Firmware(IpFirmwareInfo { built_at: 0, installed_at: 0, version: 9 }),
        );
        engine.handle_datagram(peer(1), &fw, 6);
        let label = inbound(PacketType::BulbLabel, SITE_A, from, Payload::Label(Label::new("hall").unwrap()));
        engine.handle_datagram(peer(1), &label, 7);

        let bulb = engine.bulbs().get(&bulb_addr(1)).unwrap();
        assert_eq!(bulb.model(), "GU10 (Color 650)");
        assert_eq!(bulb.vendor(), "LIFX");
        assert_eq!(bulb.wifi.firmware.version, 9);
        assert_eq!(bulb.mcu.firmware.version, 0);
        assert!(bulb.state.label.matches("hall"));
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    #[test]
    fn test_refresh_sent_immediately_when_latency_high() {
        let mut engine = engine();
        engine.handle_datagram(peer(1), &pan_gateway(SITE_A), 0);
        {
            let gw = engine.gateways.get_mut(&peer(1)).unwrap();
            gw.refresh_at = None;
            gw.last_req_at = 1000;
        }
        // LIGHT_STATUS 250ms after the last request: latency exceeds the
        // minimum interval, so the refresh goes out now.
        let status = light_status(SITE_A, bulb_addr(1), "a", PowerLevel::Off, TagMask::EMPTY);
        engine.handle_datagram(peer(1), &status, 1250);

        let gw = engine.gateway(&peer(1)).unwrap();
        assert_eq!(gw.latency(), 250);
        assert!(gw.pending_refresh());
        assert_eq!(gw.refresh_deadline(), None);
        let packets = sent(&mut engine, 1250);
        assert!(types(&packets).contains(&PacketType::GetLightState));
    }

    #[test]
    fn test_refresh_scheduled_when_latency_low() {
        let mut engine = engine();
        engine.handle_datagram(peer(1), &pan_gateway(SITE_A), 0);
        {
            let gw = engine.gateways.get_mut(&peer(1)).unwrap();
            gw.refresh_at = None;
            gw.last_req_at = 1000;
        }
        let status = light_status(SITE_A, bulb_addr(1), "a", PowerLevel::Off, TagMask::EMPTY);
        engine.handle_datagram(peer(1), &status, 1050);

        let gw = engine.gateway(&peer(1)).unwrap();
        assert_eq!(gw.refresh_deadline(), Some(1050 + 150));
        assert!(!gw.pending_refresh());

        engine.on_timers(1200);
        assert!(engine.gateway(&peer(1)).unwrap().pending_refresh());
    }

    #[test]
    fn test_first_refresh_fires_after_open() {
        let mut engine = engine();
        engine.handle_datagram(peer(1), &pan_gateway(SITE_A), 0);
        assert_eq!(engine.next_deadline(), Some(200));
        engine.on_timers(200);
        let packets = sent(&mut engine, 200);
        assert_eq!(types(&packets), vec![PacketType::GetLightState]);
        let header = &packets[0].1;
        assert!(header.is_tagged() && header.is_addressable());
        assert_eq!(header.site, SITE_A);
        assert!(!engine.gateway(&peer(1)).unwrap().pending_refresh());
    }

    // ========================================================================
    // Hardware info and power retransmission
    // ========================================================================

    #[test]
    fn test_hardware_info_poll() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[1], 0);
        let _ = sent(&mut engine, 0);

        engine.on_timers(0);
        let packets = sent(&mut engine, 0);
        let t = types(&packets);
        assert!(t.contains(&PacketType::GetVersion));
        assert!(t.contains(&PacketType::GetMeshFirmware));
        assert!(!t.contains(&PacketType::GetWifiFirmwareState));
        assert_eq!(
            engine.bulbs().get(&bulb_addr(1)).unwrap().next_info_poll_at,
            Some(HARDWARE_INFO_POLL_MS)
        );

        {
            let bulb = engine.bulbs.get_mut(&bulb_addr(1)).unwrap();
            bulb.product.vendor_id = 1;
            bulb.mcu.firmware.version = 1;
        }
        engine.on_timers(HARDWARE_INFO_POLL_MS);
        assert_eq!(engine.bulbs().get(&bulb_addr(1)).unwrap().next_info_poll_at, None);
    }

    #[test]
    fn test_power_retransmit() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[1], 0);
        {
            let bulb = engine.bulbs.get_mut(&bulb_addr(1)).unwrap();
            bulb.dirty_at = Some(100);
            bulb.expected_power = PowerLevel::On;
            bulb.next_info_poll_at = None;
        }
        let _ = sent(&mut engine, 0);

        // Too early: nothing resent
        let off = light_status(SITE_A, bulb_addr(1), "bulb1", PowerLevel::Off, TagMask::EMPTY);
        engine.handle_datagram(peer(1), &off, 300);
        let packets = sent(&mut engine, 300);
        assert!(!types(&packets).contains(&PacketType::SetPowerState));

        // Still off 400ms later: resend
        engine.handle_datagram(peer(1), &off, 600);
        let packets = sent(&mut engine, 600);
        let resend = packets
            .iter()
            .find(|(_, h, _)| h.known_type() == Some(PacketType::SetPowerState))
            .unwrap();
        assert_eq!(resend.2, Payload::Power(PowerLevel::On));
        assert_eq!(resend.1.header_target(), HeaderTarget::Device(bulb_addr(1)));

        // Applied: dirty flag cleared
        let on = light_status(SITE_A, bulb_addr(1), "bulb1", PowerLevel::On, TagMask::EMPTY);
        engine.handle_datagram(peer(1), &on, 700);
        assert_eq!(engine.bulbs().get(&bulb_addr(1)).unwrap().dirty_at, None);
    }

    // ========================================================================
    // Flush and close
    // ========================================================================

    #[test]
    fn test_discovery_broadcast_flushed() {
        let mut engine = engine();
        engine.start_discovery(0);
        assert!(engine.has_pending_writes());
        let packets = sent(&mut engine, 0);
        assert_eq!(packets.len(), 1);
        let (to, header, _) = &packets[0];
        assert_eq!(*to, engine.config().broadcast);
        assert_eq!(header.known_type(), Some(PacketType::GetPanGateway));
        assert!(header.is_tagged());
        assert!(!header.is_addressable());
        assert!(!engine.has_pending_writes());
        assert_eq!(engine.discovery().timeout_at(), Some(2000));
    }

    #[test]
    fn test_write_error_closes_gateway() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[1, 2], 0);
        engine.force_refresh(&peer(1));
        engine.drain_events();

        let mut sink = RecordingSink::default();
        sink.script
            .push_back(Err(std::io::ErrorKind::ConnectionRefused.into()));
        engine.flush(&mut sink, 10);

        assert!(engine.gateway(&peer(1)).is_none());
        assert!(engine.bulbs().is_empty());
        let events = engine.drain_events();
        assert!(events.contains(&EngineEvent::GatewayClosed {
            peer: peer(1),
            site: SITE_A,
            reason: CloseReason::SocketError
        }));
        // Rediscovery was broadcast in the same flush
        assert!(sink
            .sent
            .iter()
            .any(|(to, _)| *to == engine.config().broadcast));
    }

    #[test]
    fn test_close_gateway_releases_tags() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[1], 0);
        let labels = inbound(
            PacketType::TagLabels,
            SITE_A,
            None,
            Payload::TagLabels(TagLabels {
                tags: TagMask::from_bits(1),
                label: Label::new("desk").unwrap(),
            }),
        );
        engine.handle_datagram(peer(1), &labels, 0);
        let tagged = light_status(SITE_A, bulb_addr(1), "bulb1", PowerLevel::Off, TagMask::from_bits(1));
        engine.handle_datagram(peer(1), &tagged, 0);
        assert_eq!(engine.tags().len(), 1);

        engine.close_gateway(&peer(1), CloseReason::Timeout);
        assert!(engine.tags().is_empty());
        assert!(engine.bulbs().is_empty());
        assert!(engine.discovery().broadcast_pending());
    }

    #[test]
    fn test_shutdown_does_not_rediscover() {
        let mut engine = engine();
        with_bulbs(&mut engine, 1, SITE_A, &[1], 0);
        engine.shutdown();
        assert_eq!(engine.gateways().count(), 0);
        assert!(!engine.discovery().broadcast_pending());
    }
}
