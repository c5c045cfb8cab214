//! Payload codecs.
//!
//! One [`Payload`] variant per payload shape. Several packet types share a
//! shape (MESH_INFO and WIFI_INFO both carry an [`IpState`], for example), so
//! decoding is driven by the packet type from the header.
//!
//! Decoders read fields explicitly in little-endian order. A payload shorter
//! than its catalogue size is rejected; trailing bytes are ignored.

use lifx_core::{Hsbk, Label, LightState, PowerLevel, TagMask, LABEL_SIZE};
use serde::Serialize;

use crate::codec::WireReader;
use crate::{PacketType, Waveform, WireError, WireResult};

// ============================================================================
// Payload Shapes
// ============================================================================

/// PAN_GATEWAY: the service a gateway offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanGateway {
    /// 1 means UDP.
    pub service: u8,
    pub port: u32,
}

impl PanGateway {
    pub const SERVICE_UDP: u8 = 1;
}

/// SET_LIGHT_COLOR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightColor {
    pub stream: u8,
    pub color: Hsbk,
    pub transition_ms: u32,
}

/// SET_WAVEFORM
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformPayload {
    pub stream: u8,
    /// Return to the original color once the effect is over.
    pub transient: bool,
    pub color: Hsbk,
    pub period_ms: u32,
    pub cycles: f32,
    /// Duty cycle, -32768..=32767 mapping to 0..=1.
    pub skew_ratio: i16,
    pub waveform: Waveform,
}

/// SET_TAG_LABELS and TAG_LABELS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagLabels {
    pub tags: TagMask,
    pub label: Label,
}

/// MESH_INFO and WIFI_INFO
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct IpState {
    /// Signal strength in milliwatts.
    pub signal_strength: f32,
    pub tx_bytes: u32,
    pub rx_bytes: u32,
    /// Temperature in hundredths of a degree Celsius.
    pub temperature: u16,
}

/// MESH_FIRMWARE and WIFI_FIRMWARE_STATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IpFirmwareInfo {
    /// Nanoseconds since the epoch.
    pub built_at: u64,
    pub installed_at: u64,
    pub version: u32,
}

/// VERSION_STATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProductInfo {
    pub vendor_id: u32,
    pub product_id: u32,
    pub version: u32,
}

/// INFO_STATE, all values in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RuntimeInfo {
    pub time: u64,
    pub uptime: u64,
    pub downtime: u64,
}

/// STATE_AMBIENT_LIGHT
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct AmbientLight {
    /// Lux.
    pub illuminance: f32,
}

// ============================================================================
// Payload
// ============================================================================

/// A decoded (or to be encoded) payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    /// Packet types without a body.
    Empty,
    PanGateway(PanGateway),
    LightStatus(LightState),
    Power(PowerLevel),
    LightColor(LightColor),
    Waveform(WaveformPayload),
    Tags(TagMask),
    TagLabels(TagLabels),
    Label(Label),
    IpState(IpState),
    Firmware(IpFirmwareInfo),
    Product(ProductInfo),
    Runtime(RuntimeInfo),
    AmbientLight(AmbientLight),
}

/// Reads a label field, forcing the last byte to NUL so the text is bounded.
fn read_label(r: &mut WireReader<'_>) -> WireResult<Label> {
    let mut raw = r.bytes::<LABEL_SIZE>()?;
    if let Some(last) = raw.last_mut() {
        *last = 0;
    }
    Ok(Label::from_wire(raw))
}

fn read_hsbk(r: &mut WireReader<'_>) -> WireResult<Hsbk> {
    Ok(Hsbk {
        hue: r.u16()?,
        saturation: r.u16()?,
        brightness: r.u16()?,
        kelvin: r.u16()?,
    })
}

fn write_hsbk(out: &mut Vec<u8>, color: &Hsbk) {
    out.extend_from_slice(&color.hue.to_le_bytes());
    out.extend_from_slice(&color.saturation.to_le_bytes());
    out.extend_from_slice(&color.brightness.to_le_bytes());
    out.extend_from_slice(&color.kelvin.to_le_bytes());
}

impl Payload {
    /// Decodes the payload of a packet of the given type.
    pub fn decode(packet_type: PacketType, buf: &[u8]) -> WireResult<Self> {
        use PacketType as T;

        let expected = packet_type.payload_size();
        let short = WireError::PayloadSize {
            packet_type,
            len: buf.len(),
            expected,
        };
        if buf.len() < expected {
            return Err(short);
        }
        let r = &mut WireReader::new(buf, short);

        let payload = match packet_type {
            T::PanGateway => Self::PanGateway(PanGateway {
                service: r.u8()?,
                port: r.u32()?,
            }),
            T::LightStatus => Self::LightStatus(LightState {
                color: read_hsbk(r)?,
                dim: r.u16()?,
                power: PowerLevel::from_wire(r.u16()?),
                label: read_label(r)?,
                tags: TagMask::from_bits(r.u64()?),
            }),
            T::SetPowerState | T::PowerState => Self::Power(PowerLevel::from_wire(r.u16()?)),
            T::SetLightColor => Self::LightColor(LightColor {
                stream: r.u8()?,
                color: read_hsbk(r)?,
                transition_ms: r.u32()?,
            }),
            T::SetWaveform => {
                let stream = r.u8()?;
                let transient = r.u8()? != 0;
                let color = read_hsbk(r)?;
                let period_ms = r.u32()?;
                let cycles = r.f32()?;
                let skew_ratio = r.i16()?;
                let waveform =
                    Waveform::from_wire(r.u8()?).ok_or(WireError::InvalidValue {
                        packet_type,
                        field: "waveform",
                    })?;
                Self::Waveform(WaveformPayload {
                    stream,
                    transient,
                    color,
                    period_ms,
                    cycles,
                    skew_ratio,
                    waveform,
                })
            }
            T::SetTags | T::Tags | T::GetTagLabels => Self::Tags(TagMask::from_bits(r.u64()?)),
            T::SetTagLabels | T::TagLabels => Self::TagLabels(TagLabels {
                tags: TagMask::from_bits(r.u64()?),
                label: read_label(r)?,
            }),
            T::SetBulbLabel | T::BulbLabel => Self::Label(read_label(r)?),
            T::MeshInfo | T::WifiInfo => Self::IpState(IpState {
                signal_strength: r.f32()?,
                tx_bytes: r.u32()?,
                rx_bytes: r.u32()?,
                temperature: r.u16()?,
            }),
            T::MeshFirmware | T::WifiFirmwareState => Self::Firmware(IpFirmwareInfo {
                built_at: r.u64()?,
                installed_at: r.u64()?,
                version: r.u32()?,
            }),
            T::VersionState => Self::Product(ProductInfo {
                vendor_id: r.u32()?,
                product_id: r.u32()?,
                version: r.u32()?,
            }),
            T::InfoState => Self::Runtime(RuntimeInfo {
                time: r.u64()?,
                uptime: r.u64()?,
                downtime: r.u64()?,
            }),
            T::StateAmbientLight => Self::AmbientLight(AmbientLight {
                illuminance: r.f32()?,
            }),
            _ => Self::Empty,
        };
        Ok(payload)
    }

    /// Appends the wire form of the payload to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Empty => {}
            Self::PanGateway(p) => {
                out.push(p.service);
                out.extend_from_slice(&p.port.to_le_bytes());
            }
            Self::LightStatus(state) => {
                write_hsbk(out, &state.color);
                out.extend_from_slice(&state.dim.to_le_bytes());
                out.extend_from_slice(&state.power.to_wire().to_le_bytes());
                out.extend_from_slice(state.label.as_bytes());
                out.extend_from_slice(&state.tags.bits().to_le_bytes());
            }
            Self::Power(power) => out.extend_from_slice(&power.to_wire().to_le_bytes()),
            Self::LightColor(p) => {
                out.push(p.stream);
                write_hsbk(out, &p.color);
                out.extend_from_slice(&p.transition_ms.to_le_bytes());
            }
            Self::Waveform(p) => {
                out.push(p.stream);
                out.push(u8::from(p.transient));
                write_hsbk(out, &p.color);
                out.extend_from_slice(&p.period_ms.to_le_bytes());
                out.extend_from_slice(&p.cycles.to_le_bytes());
                out.extend_from_slice(&p.skew_ratio.to_le_bytes());
                out.push(p.waveform.to_wire());
            }
            Self::Tags(mask) => out.extend_from_slice(&mask.bits().to_le_bytes()),
            Self::TagLabels(p) => {
                out.extend_from_slice(&p.tags.bits().to_le_bytes());
                out.extend_from_slice(p.label.as_bytes());
            }
            Self::Label(label) => out.extend_from_slice(label.as_bytes()),
            Self::IpState(p) => {
                out.extend_from_slice(&p.signal_strength.to_le_bytes());
                out.extend_from_slice(&p.tx_bytes.to_le_bytes());
                out.extend_from_slice(&p.rx_bytes.to_le_bytes());
                out.extend_from_slice(&p.temperature.to_le_bytes());
            }
            Self::Firmware(p) => {
                out.extend_from_slice(&p.built_at.to_le_bytes());
                out.extend_from_slice(&p.installed_at.to_le_bytes());
                out.extend_from_slice(&p.version.to_le_bytes());
            }
            Self::Product(p) => {
                out.extend_from_slice(&p.vendor_id.to_le_bytes());
                out.extend_from_slice(&p.product_id.to_le_bytes());
                out.extend_from_slice(&p.version.to_le_bytes());
            }
            Self::Runtime(p) => {
                out.extend_from_slice(&p.time.to_le_bytes());
                out.extend_from_slice(&p.uptime.to_le_bytes());
                out.extend_from_slice(&p.downtime.to_le_bytes());
            }
            Self::AmbientLight(p) => out.extend_from_slice(&p.illuminance.to_le_bytes()),
        }
    }

    /// Returns true if this payload is the shape carried by `packet_type`.
    pub fn fits(&self, packet_type: PacketType) -> bool {
        use PacketType as T;

        match self {
            Self::Empty => packet_type.payload_size() == 0,
            Self::PanGateway(_) => packet_type == T::PanGateway,
            Self::LightStatus(_) => packet_type == T::LightStatus,
            Self::Power(_) => matches!(packet_type, T::SetPowerState | T::PowerState),
            Self::LightColor(_) => packet_type == T::SetLightColor,
            Self::Waveform(_) => packet_type == T::SetWaveform,
            Self::Tags(_) => matches!(packet_type, T::SetTags | T::Tags | T::GetTagLabels),
            Self::TagLabels(_) => matches!(packet_type, T::SetTagLabels | T::TagLabels),
            Self::Label(_) => matches!(packet_type, T::SetBulbLabel | T::BulbLabel),
            Self::IpState(_) => matches!(packet_type, T::MeshInfo | T::WifiInfo),
            Self::Firmware(_) => matches!(packet_type, T::MeshFirmware | T::WifiFirmwareState),
            Self::Product(_) => packet_type == T::VersionState,
            Self::Runtime(_) => packet_type == T::InfoState,
            Self::AmbientLight(_) => packet_type == T::StateAmbientLight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(payload: &Payload) -> Vec<u8> {
        let mut out = Vec::new();
        payload.encode_into(&mut out);
        out
    }

    #[test]
    fn test_light_status_decode() {
        let mut buf = Vec::new();
        for v in [0x1111u16, 0x2222, 0x3333, 3500, 0, 0xffff] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        let mut label = [0u8; LABEL_SIZE];
        label[..7].copy_from_slice(b"kitchen");
        buf.extend_from_slice(&label);
        buf.extend_from_slice(&0x0000_0000_0000_0005u64.to_le_bytes());
        assert_eq!(buf.len(), 52);

        let Payload::LightStatus(state) = Payload::decode(PacketType::LightStatus, &buf).unwrap()
        else {
            panic!("expected light status");
        };
        assert_eq!(state.color, Hsbk::new(0x1111, 0x2222, 0x3333, 3500));
        assert_eq!(state.power, PowerLevel::On);
        assert!(state.label.matches("kitchen"));
        assert_eq!(state.tags, TagMask::from_bits(0b101));
    }

    #[test]
    fn test_short_payload_rejected() {
        let err = Payload::decode(PacketType::LightStatus, &[0; 51]).unwrap_err();
        assert_eq!(
            err,
            WireError::PayloadSize {
                packet_type: PacketType::LightStatus,
                len: 51,
                expected: 52
            }
        );
    }

    #[test]
    fn test_tag_labels_label_is_nul_terminated() {
        let mut buf = 0b10u64.to_le_bytes().to_vec();
        buf.extend_from_slice(&[b'z'; LABEL_SIZE]);

        let Payload::TagLabels(labels) = Payload::decode(PacketType::TagLabels, &buf).unwrap()
        else {
            panic!("expected tag labels");
        };
        assert_eq!(labels.tags, TagMask::from_bits(0b10));
        assert_eq!(labels.label.trimmed().len(), LABEL_SIZE - 1);
    }

    #[test]
    fn test_set_light_color_encoding() {
        let bytes = encode(&Payload::LightColor(LightColor {
            stream: 0,
            color: Hsbk::new(0xaaaa, 0xffff, 0x8000, 2700),
            transition_ms: 600,
        }));
        assert_eq!(bytes.len(), PacketType::SetLightColor.payload_size());
        assert_eq!(
            bytes,
            vec![0, 0xaa, 0xaa, 0xff, 0xff, 0x00, 0x80, 0x8c, 0x0a, 0x58, 0x02, 0, 0]
        );
    }

    #[test]
    fn test_set_waveform_encoding() {
        let payload = Payload::Waveform(WaveformPayload {
            stream: 0,
            transient: true,
            color: Hsbk::new(0, 0, 0xffff, 4000),
            period_ms: 1000,
            cycles: 2.0,
            skew_ratio: -1,
            waveform: Waveform::Square,
        });
        let bytes = encode(&payload);
        assert_eq!(bytes.len(), 21);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[14..18], &2.0f32.to_le_bytes());
        assert_eq!(&bytes[18..20], &[0xff, 0xff]);
        assert_eq!(bytes[20], 4);
        assert_eq!(Payload::decode(PacketType::SetWaveform, &bytes).unwrap(), payload);
    }

    #[test]
    fn test_invalid_waveform_rejected() {
        let mut bytes = encode(&Payload::Waveform(WaveformPayload {
            stream: 0,
            transient: false,
            color: Hsbk::default(),
            period_ms: 0,
            cycles: 0.0,
            skew_ratio: 0,
            waveform: Waveform::Saw,
        }));
        if let Some(last) = bytes.last_mut() {
            *last = 9;
        }
        assert_eq!(
            Payload::decode(PacketType::SetWaveform, &bytes),
            Err(WireError::InvalidValue {
                packet_type: PacketType::SetWaveform,
                field: "waveform"
            })
        );
    }

    #[test]
    fn test_info_payloads_decode() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            Payload::decode(PacketType::VersionState, &buf).unwrap(),
            Payload::Product(ProductInfo {
                vendor_id: 1,
                product_id: 3,
                version: 0
            })
        );

        let mut buf = Vec::new();
        buf.extend_from_slice(&(-45.5f32).to_le_bytes());
        buf.extend_from_slice(&10u32.to_le_bytes());
        buf.extend_from_slice(&20u32.to_le_bytes());
        buf.extend_from_slice(&3150u16.to_le_bytes());
        let Payload::IpState(ip) = Payload::decode(PacketType::WifiInfo, &buf).unwrap() else {
            panic!("expected ip state");
        };
        assert_eq!(ip.tx_bytes, 10);
        assert_eq!(ip.rx_bytes, 20);
        assert_eq!(ip.temperature, 3150);

        let buf = 12.5f32.to_le_bytes();
        assert_eq!(
            Payload::decode(PacketType::StateAmbientLight, &buf).unwrap(),
            Payload::AmbientLight(AmbientLight { illuminance: 12.5 })
        );
    }

    #[test]
    fn test_encoded_sizes_match_catalogue() {
        let cases = [
            (PacketType::PanGateway, Payload::PanGateway(PanGateway { service: 1, port: 56700 })),
            (PacketType::SetPowerState, Payload::Power(PowerLevel::Off)),
            (PacketType::SetTags, Payload::Tags(TagMask::from_bits(1))),
            (
                PacketType::SetTagLabels,
                Payload::TagLabels(TagLabels {
                    tags: TagMask::from_bits(1),
                    label: Label::EMPTY,
                }),
            ),
            (PacketType::SetBulbLabel, Payload::Label(Label::EMPTY)),
            (PacketType::MeshFirmware, Payload::Firmware(IpFirmwareInfo::default())),
            (PacketType::InfoState, Payload::Runtime(RuntimeInfo::default())),
            (PacketType::LightStatus, Payload::LightStatus(LightState::default())),
            (PacketType::GetLightState, Payload::Empty),
        ];
        for (packet_type, payload) in cases {
            assert!(payload.fits(packet_type), "{packet_type}");
            assert_eq!(encode(&payload).len(), packet_type.payload_size(), "{packet_type}");
        }
        assert!(!Payload::Empty.fits(PacketType::SetTags));
        assert!(!Payload::Power(PowerLevel::On).fits(PacketType::SetTags));
    }
}
