//! Bulbs and the bulb registry.
//!
//! A bulb is identified by its 6-byte hardware address and always belongs to
//! exactly one gateway, referenced by the gateway's peer address. Mutators
//! here only touch the bulb itself; anything that has to send packets or
//! update gateway tag refcounts is done by the engine with the returned
//! change description.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use lifx_core::{DeviceAddr, Hsbk, Label, LightState, Millis, PowerLevel, SiteId, TagMask};
use lifx_protocol::{IpFirmwareInfo, IpState, ProductInfo, RuntimeInfo};

/// Vendor id of the only manufacturer we know about.
pub const VENDOR_ID_LIFX: u32 = 1;

/// Hardware info is polled at this interval until complete.
pub const HARDWARE_INFO_POLL_MS: Millis = 5000;

/// Wi-Fi firmware is only asked for while MCU info is this fresh.
pub const WIFI_FIRMWARE_FETCH_WINDOW_MS: Millis = 20_000;

/// Human readable vendor name.
pub fn vendor_name(vendor_id: u32) -> &'static str {
    match vendor_id {
        VENDOR_ID_LIFX => "LIFX",
        _ => "Unknown",
    }
}

/// Human readable model name.
pub fn model_name(vendor_id: u32, product_id: u32) -> &'static str {
    if vendor_id != VENDOR_ID_LIFX {
        return "Unknown";
    }
    match product_id {
        0x1 | 0x2 => "A21 (Original)",
        0x3 => "GU10 (Color 650)",
        0xa => "A19 (White 800)",
        _ => "Unknown",
    }
}

// ============================================================================
// Bulb
// ============================================================================

/// Which of the two network interfaces of a bulb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulbIp {
    /// The mesh radio.
    Mcu,
    Wifi,
}

/// State and firmware of one bulb interface.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IpInfo {
    pub state: IpState,
    pub state_updated_at: Option<Millis>,
    pub firmware: IpFirmwareInfo,
    pub firmware_updated_at: Option<Millis>,
}

/// What changed when a new light state was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightStateChange {
    pub old_tags: TagMask,
    pub new_tags: TagMask,
    pub power_changed: bool,
}

/// One physical bulb.
#[derive(Debug, Clone)]
pub struct Bulb {
    pub addr: DeviceAddr,
    /// Peer address of the owning gateway.
    pub gateway: SocketAddr,
    pub state: LightState,
    pub last_light_state_at: Millis,
    /// When a power change was last sent, until the bulb confirms it.
    pub dirty_at: Option<Millis>,
    pub expected_power: PowerLevel,
    pub mcu: IpInfo,
    pub wifi: IpInfo,
    pub product: ProductInfo,
    pub runtime: RuntimeInfo,
    pub runtime_updated_at: Option<Millis>,
    /// Lux, once reported.
    pub ambient_light: Option<f32>,
    /// Next hardware-info poll, `None` once everything is known.
    pub next_info_poll_at: Option<Millis>,
}

impl Bulb {
    /// Creates a bulb first seen at `now`. The hardware-info poll fires
    /// immediately.
    pub fn new(addr: DeviceAddr, gateway: SocketAddr, now: Millis) -> Self {
        Self {
            addr,
            gateway,
            state: LightState::default(),
            last_light_state_at: now,
            dirty_at: None,
            expected_power: PowerLevel::Off,
            mcu: IpInfo::default(),
            wifi: IpInfo::default(),
            product: ProductInfo::default(),
            runtime: RuntimeInfo::default(),
            runtime_updated_at: None,
            ambient_light: None,
            next_info_poll_at: Some(now),
        }
    }

    /// Replaces the light state.
    pub fn set_light_state(&mut self, state: LightState, received_at: Millis) -> LightStateChange {
        let change = LightStateChange {
            old_tags: self.state.tags,
            new_tags: state.tags,
            power_changed: state.power != self.state.power,
        };
        self.last_light_state_at = received_at;
        self.state = state;
        change
    }

    /// Sets the power level, returning true if it changed.
    pub fn set_power_state(&mut self, power: PowerLevel) -> bool {
        let changed = power != self.state.power;
        self.state.power = power;
        changed
    }

    /// Sets the tags, returning the previous mask.
    pub fn set_tags(&mut self, tags: TagMask) -> TagMask {
        std::mem::replace(&mut self.state.tags, tags)
    }

    pub fn set_label(&mut self, label: Label) {
        self.state.label = label;
    }

    fn ip_mut(&mut self, ip: BulbIp) -> &mut IpInfo {
        match ip {
            BulbIp::Mcu => &mut self.mcu,
            BulbIp::Wifi => &mut self.wifi,
        }
    }

    pub fn set_ip_state(&mut self, ip: BulbIp, state: IpState, received_at: Millis) {
        let info = self.ip_mut(ip);
        info.state = state;
        info.state_updated_at = Some(received_at);
    }

    pub fn set_ip_firmware(&mut self, ip: BulbIp, firmware: IpFirmwareInfo, received_at: Millis) {
        let info = self.ip_mut(ip);
        info.firmware = firmware;
        info.firmware_updated_at = Some(received_at);
    }

    pub fn set_product_info(&mut self, product: ProductInfo) {
        self.product = product;
    }

    pub fn set_runtime_info(&mut self, runtime: RuntimeInfo, received_at: Millis) {
        self.runtime = runtime;
        self.runtime_updated_at = Some(received_at);
    }

    pub fn vendor(&self) -> &'static str {
        vendor_name(self.product.vendor_id)
    }

    pub fn model(&self) -> &'static str {
        model_name(self.product.vendor_id, self.product.product_id)
    }

    /// Whether the Wi-Fi firmware is worth asking for: unknown, and the MCU
    /// answered recently (older bulbs never answer the Wi-Fi query).
    pub fn wants_wifi_firmware(&self, now: Millis) -> bool {
        self.wifi.firmware.version == 0
            && self
                .mcu
                .state_updated_at
                .is_some_and(|at| now.saturating_sub(at) < WIFI_FIRMWARE_FETCH_WINDOW_MS)
    }

    /// Time since the last light state.
    pub fn lag(&self, now: Millis) -> Millis {
        now.saturating_sub(self.last_light_state_at)
    }
}

// ============================================================================
// Bulb Registry
// ============================================================================

/// Directory of bulbs keyed by hardware address.
#[derive(Debug, Default)]
pub struct BulbRegistry {
    bulbs: BTreeMap<DeviceAddr, Bulb>,
}

impl BulbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: &DeviceAddr) -> Option<&Bulb> {
        self.bulbs.get(addr)
    }

    pub fn get_mut(&mut self, addr: &DeviceAddr) -> Option<&mut Bulb> {
        self.bulbs.get_mut(addr)
    }

    pub fn contains(&self, addr: &DeviceAddr) -> bool {
        self.bulbs.contains_key(addr)
    }

    /// Inserts a new bulb. An existing bulb with the same address is replaced.
    pub fn insert(&mut self, bulb: Bulb) {
        self.bulbs.insert(bulb.addr, bulb);
    }

    pub fn remove(&mut self, addr: &DeviceAddr) -> Option<Bulb> {
        self.bulbs.remove(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bulb> {
        self.bulbs.values()
    }

    /// Every bulb whose label is exactly `label`.
    pub fn find_by_label<'a>(&'a self, label: &'a Label) -> impl Iterator<Item = &'a Bulb> + 'a {
        self.bulbs
            .values()
            .filter(move |b| b.state.label.trimmed() == label.trimmed())
    }

    pub fn len(&self) -> usize {
        self.bulbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bulbs.is_empty()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Read-only snapshot of a bulb handed out by the command API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulbView {
    pub addr: DeviceAddr,
    pub label: String,
    pub power: PowerLevel,
    pub color: Hsbk,
    /// Hue in degrees, saturation and brightness in `0.0..=1.0`.
    pub hsbk: (f64, f64, f64, u16),
    pub dim: u16,
    pub tags: Vec<String>,
    pub gateway: SocketAddr,
    pub site: SiteId,
    pub vendor: &'static str,
    pub model: &'static str,
    pub mcu_firmware_version: u32,
    pub wifi_firmware_version: u32,
    pub mcu_firmware_built_at: Option<DateTime<Utc>>,
    pub ambient_light: Option<f32>,
}

impl BulbView {
    /// Builds a snapshot; `tags` are the labels of the tag bits the bulb
    /// carries on its gateway.
    pub fn new(bulb: &Bulb, site: SiteId, tags: Vec<String>) -> Self {
        let color = bulb.state.color;
        Self {
            addr: bulb.addr,
            label: bulb.state.label.to_string_lossy(),
            power: bulb.state.power,
            color,
            hsbk: (
                color.hue_degrees(),
                color.saturation_ratio(),
                color.brightness_ratio(),
                color.kelvin,
            ),
            dim: bulb.state.dim,
            tags,
            gateway: bulb.gateway,
            site,
            vendor: bulb.vendor(),
            model: bulb.model(),
            mcu_firmware_version: bulb.mcu.firmware.version,
            wifi_firmware_version: bulb.wifi.firmware.version,
            mcu_firmware_built_at: nanos_to_datetime(bulb.mcu.firmware.built_at),
            ambient_light: bulb.ambient_light,
        }
    }
}

/// Firmware timestamps are nanoseconds since the epoch; zero means unknown.
fn nanos_to_datetime(nanos: u64) -> Option<DateTime<Utc>> {
    if nanos == 0 {
        return None;
    }
    let nanos = i64::try_from(nanos).ok()?;
    Some(DateTime::from_timestamp_nanos(nanos))
}
