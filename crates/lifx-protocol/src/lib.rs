//! lifx-protocol - Binary wire protocol for smart bulb gateways
//!
//! This crate provides explicit byte-level encoding and decoding for the
//! 36-byte packet header, the payloads the engine understands, and the static
//! packet catalogue mapping type codes to names, payload sizes and handling
//! kinds. Nothing here relies on in-memory struct layout.

mod codec;
pub mod error;
pub mod header;
pub mod packet;
pub mod payload;
pub mod version;
pub mod waveform;

pub use error::{WireError, WireResult};
pub use header::{
    Datagram, HeaderFlags, HeaderTarget, OutboundPacket, PacketHeader, Target, HEADER_SIZE,
    MAX_PACKET_SIZE,
};
pub use packet::{PacketInfo, PacketKind, PacketType};
pub use payload::{
    AmbientLight, IpFirmwareInfo, IpState, LightColor, PanGateway, Payload, ProductInfo,
    RuntimeInfo, TagLabels, WaveformPayload,
};
pub use version::ProtocolVersion;
pub use waveform::{UnknownWaveform, Waveform};

/// UDP port gateways listen and answer on.
pub const PROTOCOL_PORT: u16 = 56700;
