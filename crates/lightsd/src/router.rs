//! Target resolution and packet routing.
//!
//! A target is one of:
//!
//! | Form            | Resolves to                                        |
//! |-----------------|----------------------------------------------------|
//! | `*`             | every bulb of every live gateway                   |
//! | `#name`         | bulbs carrying the id `name` has on their gateway  |
//! | `d073d5012a3b`  | the bulb with that hardware address, if known      |
//! | anything else   | bulbs whose label is exactly that string           |
//!
//! A hex literal that names no known bulb falls back to a label match.
//! Resolution groups bulbs per gateway so that each gateway gets the
//! cheapest addressing mode: the whole site, one tag, or one packet per
//! device.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use tracing::{debug, info};

use lifx_core::{DeviceAddr, Label, Millis, TagMask};
use lifx_protocol::{PacketType, Payload, Target};

use crate::bulb::BulbRegistry;
use crate::commands::CommandError;
use crate::engine::Engine;
use crate::gateway::{Gateway, GatewayError};

// ============================================================================
// Targets
// ============================================================================

/// A parsed target string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    All,
    Tag(Label),
    Device(DeviceAddr),
    Label(Label),
}

impl TargetSpec {
    /// Parses `raw`. Hex literals are only taken as addresses when they name
    /// a bulb in `bulbs`.
    pub fn parse(raw: &str, bulbs: &BulbRegistry) -> Result<Self, CommandError> {
        let invalid = || CommandError::InvalidTarget(raw.to_string());

        if raw == "*" {
            return Ok(Self::All);
        }
        if let Some(name) = raw.strip_prefix('#') {
            if name.is_empty() {
                return Err(invalid());
            }
            return Label::new(name).map(Self::Tag).map_err(|_| invalid());
        }
        let first = raw.chars().next().ok_or_else(invalid)?;
        if first.is_ascii_hexdigit() {
            match DeviceAddr::from_hex(raw) {
                Ok(addr) if bulbs.contains(&addr) => return Ok(Self::Device(addr)),
                _ => debug!(
                    value = raw,
                    "looked like a device address but didn't yield any device, trying as a label"
                ),
            }
        }
        Label::new(raw).map(Self::Label).map_err(|_| invalid())
    }
}

// ============================================================================
// Selection
// ============================================================================

/// Bulbs selected on one gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewaySelection {
    /// Set by the wildcard: the whole site is addressed even if no bulb is
    /// known yet.
    pub whole_gateway: bool,
    pub bulbs: BTreeSet<DeviceAddr>,
}

/// Result of resolving a list of targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    gateways: BTreeMap<SocketAddr, GatewaySelection>,
    /// `#tags` that matched no known tag.
    unknown_tags: Vec<String>,
}

impl Selection {
    /// Every selected bulb, each exactly once.
    pub fn devices(&self) -> impl Iterator<Item = DeviceAddr> + '_ {
        self.gateways.values().flat_map(|sel| sel.bulbs.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.gateways.values().map(|sel| sel.bulbs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn gateway(&self, peer: &SocketAddr) -> Option<&GatewaySelection> {
        self.gateways.get(peer)
    }

    pub fn gateways(&self) -> impl Iterator<Item = (&SocketAddr, &GatewaySelection)> {
        self.gateways.iter()
    }

    pub fn unknown_tags(&self) -> &[String] {
        &self.unknown_tags
    }

    fn add(&mut self, gateway: SocketAddr, addr: DeviceAddr) {
        self.gateways.entry(gateway).or_default().bulbs.insert(addr);
    }

    /// Fails on the first tag that resolved to nothing.
    fn check_complete(&self) -> Result<(), CommandError> {
        match self.unknown_tags.first() {
            Some(tag) => Err(CommandError::UnknownTag(tag.clone())),
            None => Ok(()),
        }
    }
}

/// How a packet is addressed on one gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Addressing {
    AllDevices,
    Tag(TagMask),
    Devices(Vec<DeviceAddr>),
}

/// Picks the addressing mode for `selection` on `gw`.
fn addressing_for(gw: &Gateway, selection: &GatewaySelection, bulbs: &BulbRegistry) -> Addressing {
    if selection.whole_gateway
        || (!selection.bulbs.is_empty() && selection.bulbs == *gw.bulbs())
    {
        return Addressing::AllDevices;
    }
    for id in gw.tag_ids().iter() {
        let carrying: BTreeSet<DeviceAddr> = gw
            .bulbs()
            .iter()
            .copied()
            .filter(|addr| {
                bulbs
                    .get(addr)
                    .is_some_and(|bulb| bulb.state.tags.contains(id))
            })
            .collect();
        if !carrying.is_empty() && carrying == selection.bulbs {
            return Addressing::Tag(id.value());
        }
    }
    Addressing::Devices(selection.bulbs.iter().copied().collect())
}

/// Tally of a routed command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReport {
    pub queued: usize,
    pub dropped: usize,
}

impl RouteReport {
    fn record(&mut self, result: Result<(), GatewayError>) -> Result<(), CommandError> {
        match result {
            Ok(()) => self.queued += 1,
            Err(GatewayError::QueueFull { .. }) => self.dropped += 1,
            Err(e) => return Err(CommandError::InvalidArgument(e.to_string())),
        }
        Ok(())
    }

    fn check(self) -> Result<Self, CommandError> {
        if self.queued == 0 && self.dropped > 0 {
            return Err(CommandError::QueueFull);
        }
        Ok(self)
    }
}

// ============================================================================
// Routing
// ============================================================================

impl Engine {
    /// Resolves `targets` against the current registries.
    ///
    /// Duplicates collapse: a bulb reached by several targets is selected
    /// once. Invalid target strings fail the whole resolution.
    pub fn resolve<T: AsRef<str>>(&self, targets: &[T]) -> Result<Selection, CommandError> {
        let mut selection = Selection::default();

        for raw in targets {
            let raw = raw.as_ref();
            match TargetSpec::parse(raw, &self.bulbs)? {
                TargetSpec::All => {
                    for (peer, gw) in &self.gateways {
                        let entry = selection.gateways.entry(*peer).or_default();
                        entry.whole_gateway = true;
                        entry.bulbs.extend(gw.bulbs().iter().copied());
                    }
                }
                TargetSpec::Tag(label) => {
                    let Some(tag) = self.tags.find(&label) else {
                        debug!(tag = raw, "invalid target tag");
                        selection.unknown_tags.push(label.to_string_lossy());
                        continue;
                    };
                    for (peer, id) in &tag.bindings {
                        let Some(gw) = self.gateways.get(peer) else {
                            continue;
                        };
                        for addr in gw.bulbs() {
                            let carries = self
                                .bulbs
                                .get(addr)
                                .is_some_and(|bulb| bulb.state.tags.contains(*id));
                            if carries {
                                selection.add(*peer, *addr);
                            }
                        }
                    }
                }
                TargetSpec::Device(addr) => {
                    if let Some(bulb) = self.bulbs.get(&addr) {
                        selection.add(bulb.gateway, addr);
                    }
                }
                TargetSpec::Label(label) => {
                    let matching: Vec<(SocketAddr, DeviceAddr)> = self
                        .bulbs
                        .find_by_label(&label)
                        .map(|bulb| (bulb.gateway, bulb.addr))
                        .collect();
                    for (peer, addr) in matching {
                        selection.add(peer, addr);
                    }
                }
            }
        }

        Ok(selection)
    }

    /// Sends a packet to every bulb of `selection`.
    ///
    /// Fails when some `#tag` was unknown (the rest is still sent) or when
    /// every packet was dropped on full queues.
    pub fn route(
        &mut self,
        selection: &Selection,
        packet_type: PacketType,
        payload: Payload,
        now: Millis,
    ) -> Result<RouteReport, CommandError> {
        let mut report = RouteReport::default();

        for (peer, sel) in &selection.gateways {
            let Some(gw) = self.gateways.get_mut(peer) else {
                continue;
            };
            match addressing_for(gw, sel, &self.bulbs) {
                Addressing::AllDevices => {
                    info!(gateway = %peer, packet = %packet_type, "broadcasting");
                    report.record(gw.send(packet_type, Target::AllDevices, payload))?;
                    let covered: Vec<DeviceAddr> = gw.bulbs().iter().copied().collect();
                    mark_dirty(&mut self.bulbs, &covered, &payload, now);
                }
                Addressing::Tag(mask) => {
                    info!(gateway = %peer, packet = %packet_type, tags = %mask, "sending to tag");
                    report.record(gw.send(packet_type, Target::Tags(mask), payload))?;
                    let covered: Vec<DeviceAddr> = sel.bulbs.iter().copied().collect();
                    mark_dirty(&mut self.bulbs, &covered, &payload, now);
                }
                Addressing::Devices(addrs) => {
                    for addr in addrs {
                        report.record(gw.send(packet_type, Target::Device(addr), payload))?;
                        if let Some(bulb) = self.bulbs.get(&addr) {
                            info!(
                                bulb = %addr,
                                label = %bulb.state.label,
                                packet = %packet_type,
                                "sending to device"
                            );
                        }
                        mark_dirty(&mut self.bulbs, &[addr], &payload, now);
                    }
                }
            }
        }

        let report = report.check()?;
        selection.check_complete()?;
        Ok(report)
    }

    /// Resolves `targets` and routes one packet to them.
    pub fn send_to_targets<T: AsRef<str>>(
        &mut self,
        targets: &[T],
        packet_type: PacketType,
        payload: Payload,
        now: Millis,
    ) -> Result<RouteReport, CommandError> {
        let selection = self.resolve(targets)?;
        self.route(&selection, packet_type, payload, now)
    }

    /// Sends a packet to one known bulb through its gateway.
    pub fn send_to_device(
        &mut self,
        addr: DeviceAddr,
        packet_type: PacketType,
        payload: Payload,
        now: Millis,
    ) -> Result<(), GatewayError> {
        let Some(bulb) = self.bulbs.get(&addr) else {
            return Ok(());
        };
        let Some(gw) = self.gateways.get_mut(&bulb.gateway) else {
            return Ok(());
        };
        info!(
            bulb = %addr,
            label = %bulb.state.label,
            packet = %packet_type,
            "sending to device"
        );
        gw.send(packet_type, Target::Device(addr), payload)?;
        mark_dirty(&mut self.bulbs, &[addr], &payload, now);
        Ok(())
    }
}

/// Records the power a SET_POWER_STATE is expected to produce.
fn mark_dirty(bulbs: &mut BulbRegistry, addrs: &[DeviceAddr], payload: &Payload, now: Millis) {
    let Payload::Power(power) = payload else {
        return;
    };
    for addr in addrs {
        if let Some(bulb) = bulbs.get_mut(addr) {
            bulb.dirty_at = Some(now);
            bulb.expected_power = *power;
        }
    }
}
