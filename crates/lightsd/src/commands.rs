//! Command API.
//!
//! What a front end can ask of the engine. Every command takes a list of
//! target strings (see [`crate::router`]) and the current time, and either
//! succeeds or returns a [`CommandError`]. Queries return snapshots.

use std::net::SocketAddr;

use thiserror::Error;
use tracing::{info, warn};

use lifx_core::{DeviceAddr, Hsbk, Label, Millis, PowerLevel, TagId};
use lifx_protocol::{
    LightColor, PacketType, Payload, TagLabels, Target, Waveform, WaveformPayload,
};

use crate::bulb::BulbView;
use crate::engine::Engine;
use crate::gateway::GatewayError;
use crate::router::RouteReport;
use crate::tagging::{TagBindingView, TagView};

// ============================================================================
// Errors
// ============================================================================

/// Why a command failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Empty target, bare `#`, or a label that cannot exist.
    #[error("invalid target: {0:?}")]
    InvalidTarget(String),

    #[error("unknown tag: {0}")]
    UnknownTag(String),

    /// Every packet was dropped because the gateway queues were full.
    #[error("gateway queues are full")]
    QueueFull,

    #[error("no tag id left on gateway {0}")]
    NoTagIdAvailable(SocketAddr),

    #[error("invalid label: {0}")]
    InvalidLabel(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ============================================================================
// Arguments
// ============================================================================

/// Parameters of a waveform effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformParams {
    pub waveform: Waveform,
    pub color: Hsbk,
    pub period_ms: u32,
    /// Number of periods; fractional values are allowed.
    pub cycles: f32,
    /// Duty cycle for pulses, -32767..=32767 mapping to 0..100%.
    pub skew_ratio: i16,
    /// Return to the original color at the end.
    pub transient: bool,
}

fn validate_color(color: &Hsbk) -> Result<(), CommandError> {
    color
        .validate()
        .map_err(|e| CommandError::InvalidArgument(e.to_string()))
}

fn parse_label(label: &str) -> Result<Label, CommandError> {
    if label.is_empty() {
        return Err(CommandError::InvalidLabel("empty label".to_string()));
    }
    Label::new(label).map_err(|e| CommandError::InvalidLabel(e.to_string()))
}

// ============================================================================
// Commands
// ============================================================================

impl Engine {
    pub fn power_on<T: AsRef<str>>(&mut self, targets: &[T], now: Millis) -> Result<RouteReport, CommandError> {
        self.send_to_targets(targets, PacketType::SetPowerState, Payload::Power(PowerLevel::On), now)
    }

    pub fn power_off<T: AsRef<str>>(&mut self, targets: &[T], now: Millis) -> Result<RouteReport, CommandError> {
        self.send_to_targets(targets, PacketType::SetPowerState, Payload::Power(PowerLevel::Off), now)
    }

    /// Flips the power of every resolved bulb, one device packet each.
    pub fn power_toggle<T: AsRef<str>>(&mut self, targets: &[T], now: Millis) -> Result<(), CommandError> {
        let selection = self.resolve(targets)?;
        let mut queued = 0usize;
        let mut dropped = 0usize;

        for addr in selection.devices().collect::<Vec<_>>() {
            let Some(power) = self.bulbs.get(&addr).map(|b| b.state.power.toggled()) else {
                continue;
            };
            match self.send_to_device(addr, PacketType::SetPowerState, Payload::Power(power), now) {
                Ok(()) => queued += 1,
                Err(GatewayError::QueueFull { .. }) => dropped += 1,
                Err(e) => return Err(CommandError::InvalidArgument(e.to_string())),
            }
        }
        if queued == 0 && dropped > 0 {
            return Err(CommandError::QueueFull);
        }
        match selection.unknown_tags().first() {
            Some(tag) => Err(CommandError::UnknownTag(tag.clone())),
            None => Ok(()),
        }
    }

    pub fn set_light<T: AsRef<str>>(
        &mut self,
        targets: &[T],
        color: Hsbk,
        transition_ms: u32,
        now: Millis,
    ) -> Result<RouteReport, CommandError> {
        validate_color(&color)?;
        let payload = Payload::LightColor(LightColor {
            stream: 0,
            color,
            transition_ms,
        });
        self.send_to_targets(targets, PacketType::SetLightColor, payload, now)
    }

    pub fn set_waveform<T: AsRef<str>>(
        &mut self,
        targets: &[T],
        params: WaveformParams,
        now: Millis,
    ) -> Result<RouteReport, CommandError> {
        validate_color(&params.color)?;
        if !params.cycles.is_finite() || params.cycles < 0.0 {
            return Err(CommandError::InvalidArgument(format!(
                "cycles must be a positive number, got {}",
                params.cycles
            )));
        }
        let payload = Payload::Waveform(WaveformPayload {
            stream: 0,
            transient: params.transient,
            color: params.color,
            period_ms: params.period_ms,
            cycles: params.cycles,
            skew_ratio: params.skew_ratio,
            waveform: params.waveform,
        });
        self.send_to_targets(targets, PacketType::SetWaveform, payload, now)
    }

    /// Adds the tag `label` to every resolved bulb.
    ///
    /// Ids are allocated first, on every gateway carrying a resolved bulb; a
    /// wildcard reaching a gateway with no bulbs does not bind it. If any
    /// gateway is out of ids every binding of the label is released and nothing is
    /// sent. Otherwise each bound gateway is (re)told the label of its id
    /// and bulbs lacking the bit get SET_TAGS.
    pub fn tag<T: AsRef<str>>(&mut self, targets: &[T], label: &str, now: Millis) -> Result<(), CommandError> {
        let label = parse_label(label)?;
        let selection = self.resolve(targets)?;

        for (peer, _) in selection.gateways().filter(|(_, sel)| !sel.bulbs.is_empty()) {
            let Some(gw) = self.gateways.get_mut(peer) else {
                continue;
            };
            if gw.tag_id_of(&label).is_some() {
                continue;
            }
            if self.tags.allocate(gw, None, label).is_none() {
                warn!(gateway = %peer, tag = %label, "no tag id left");
                self.rollback_tag(&label);
                return Err(CommandError::NoTagIdAvailable(*peer));
            }
        }

        let bindings = self
            .tags
            .find(&label)
            .map(|tag| tag.bindings.clone())
            .unwrap_or_default();
        for (peer, id) in bindings {
            let Some(gw) = self.gateways.get_mut(&peer) else {
                continue;
            };
            let payload = Payload::TagLabels(TagLabels {
                tags: id.value(),
                label,
            });
            if let Err(e) = gw.send(PacketType::SetTagLabels, Target::Site, payload) {
                warn!(gateway = %peer, tag = %label, error = %e, "cannot label tag");
                self.rollback_tag(&label);
                return Err(CommandError::QueueFull);
            }
            info!(tag = %label, tag_id = %id, gateway = %peer, "created tag");
        }

        let updates: Vec<(DeviceAddr, lifx_core::TagMask)> = selection
            .devices()
            .filter_map(|addr| {
                let bulb = self.bulbs.get(&addr)?;
                let id = self.gateways.get(&bulb.gateway)?.tag_id_of(&label)?;
                (!bulb.state.tags.contains(id)).then(|| (addr, bulb.state.tags.with(id)))
            })
            .collect();
        self.send_tags(updates, now)?;
        selection_outcome(&selection)
    }

    /// Removes the tag `label` from every resolved bulb carrying it.
    ///
    /// An unknown label is not an error: there is nothing to remove.
    pub fn untag<T: AsRef<str>>(&mut self, targets: &[T], label: &str, now: Millis) -> Result<(), CommandError> {
        let label = parse_label(label)?;
        if self.tags.find(&label).is_none() {
            return Ok(());
        }
        let selection = self.resolve(targets)?;

        let updates: Vec<(DeviceAddr, lifx_core::TagMask)> = selection
            .devices()
            .filter_map(|addr| {
                let bulb = self.bulbs.get(&addr)?;
                let id = self.gateways.get(&bulb.gateway)?.tag_id_of(&label)?;
                bulb.state
                    .tags
                    .contains(id)
                    .then(|| (addr, bulb.state.tags.without(id)))
            })
            .collect();
        self.send_tags(updates, now)?;
        selection_outcome(&selection)
    }

    fn send_tags(&mut self, updates: Vec<(DeviceAddr, lifx_core::TagMask)>, now: Millis) -> Result<(), CommandError> {
        let attempted = updates.len();
        let mut dropped = 0usize;
        for (addr, tags) in updates {
            match self.send_to_device(addr, PacketType::SetTags, Payload::Tags(tags), now) {
                Ok(()) => {}
                Err(GatewayError::QueueFull { .. }) => dropped += 1,
                Err(e) => return Err(CommandError::InvalidArgument(e.to_string())),
            }
        }
        if attempted > 0 && dropped == attempted {
            return Err(CommandError::QueueFull);
        }
        Ok(())
    }

    /// Releases every binding of `label`.
    fn rollback_tag(&mut self, label: &Label) {
        let bindings: Vec<(SocketAddr, TagId)> = self
            .tags
            .find(label)
            .map(|tag| tag.bindings.clone())
            .unwrap_or_default();
        for (peer, id) in bindings {
            if let Some(gw) = self.gateways.get_mut(&peer) {
                self.tags.deallocate(gw, id);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Every known tag, sorted by label, with its bindings.
    pub fn list_tags(&self) -> Vec<TagView> {
        self.tags
            .iter_sorted()
            .into_iter()
            .map(|tag| TagView {
                label: tag.label.to_string_lossy(),
                bindings: tag
                    .bindings
                    .iter()
                    .filter_map(|(peer, id)| {
                        let gw = self.gateways.get(peer)?;
                        Some(TagBindingView {
                            gateway: *peer,
                            site: gw.site(),
                            tag_id: *id,
                        })
                    })
                    .collect(),
            })
            .collect()
    }

    /// Snapshot of every resolved bulb.
    pub fn get_light_state<T: AsRef<str>>(&self, targets: &[T]) -> Result<Vec<BulbView>, CommandError> {
        let selection = self.resolve(targets)?;
        Ok(selection
            .devices()
            .filter_map(|addr| self.bulb_view(&addr))
            .collect())
    }
}

fn selection_outcome(selection: &crate::router::Selection) -> Result<(), CommandError> {
    match selection.unknown_tags().first() {
        Some(tag) => Err(CommandError::UnknownTag(tag.clone())),
        None => Ok(()),
    }
}
