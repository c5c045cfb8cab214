//! The 36-byte packet header and addressing modes.
//!
//! Layout (all integers little-endian):
//!
//! | offset | size | field                                          |
//! |--------|------|------------------------------------------------|
//! | 0      | 2    | total packet size, header included             |
//! | 2      | 2    | protocol word: version, addressable, tagged    |
//! | 4      | 4    | source (client id)                             |
//! | 8      | 8    | target: device address or tag mask             |
//! | 16     | 6    | site                                           |
//! | 22     | 1    | flags: bit 0 res_required, bit 1 ack_required  |
//! | 23     | 1    | sequence number                                |
//! | 24     | 8    | timestamp                                      |
//! | 32     | 2    | packet type                                    |
//! | 34     | 2    | reserved                                       |

use lifx_core::{DeviceAddr, SiteId, TagMask, ADDR_LENGTH};
use std::fmt;

use crate::codec::WireReader;
use crate::version::{ADDRESSABLE, TAGGED};
use crate::{PacketType, Payload, ProtocolVersion, WireError, WireResult};

/// Size of the packet header in bytes.
pub const HEADER_SIZE: usize = 36;

/// Receive buffer size; nothing the gateways send comes close.
pub const MAX_PACKET_SIZE: usize = 4096;

// ============================================================================
// Flags
// ============================================================================

/// Header flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    pub const RES_REQUIRED: u8 = 0x01;
    pub const ACK_REQUIRED: u8 = 0x02;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn res_required(self) -> bool {
        self.0 & Self::RES_REQUIRED != 0
    }

    pub fn ack_required(self) -> bool {
        self.0 & Self::ACK_REQUIRED != 0
    }
}

// ============================================================================
// Addressing
// ============================================================================

/// Who an outbound packet is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Every bulb behind every gateway on the broadcast domain.
    AllDevices,
    /// Every bulb on one site.
    Site,
    /// Bulbs on one site carrying any of the tags.
    Tags(TagMask),
    /// A single bulb.
    Device(DeviceAddr),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllDevices => write!(f, "all devices"),
            Self::Site => write!(f, "site"),
            Self::Tags(mask) => write!(f, "tags {mask}"),
            Self::Device(addr) => write!(f, "device {addr}"),
        }
    }
}

/// Interpretation of the target field of a received header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderTarget {
    Tags(TagMask),
    Device(DeviceAddr),
}

// ============================================================================
// Header
// ============================================================================

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total packet size, header included.
    pub size: u16,
    /// Full protocol word, version and addressing bits together.
    pub protocol: u16,
    pub source: u32,
    /// Raw target field.
    pub target: [u8; 8],
    pub site: SiteId,
    pub flags: HeaderFlags,
    pub seq: u8,
    pub timestamp: u64,
    /// Raw type code, possibly unknown to the catalogue.
    pub packet_type: u16,
}

impl PacketHeader {
    /// Builds the header of an outbound packet.
    ///
    /// Every addressing mode except [`Target::AllDevices`] needs the site of
    /// the gateway the packet goes through. Outbound packets always ask for a
    /// response.
    pub fn setup(
        packet_type: PacketType,
        target: Target,
        site: Option<SiteId>,
        source: u32,
    ) -> WireResult<Self> {
        let mut protocol = ProtocolVersion::CURRENT.number();
        let mut raw_target = [0u8; 8];
        match target {
            Target::AllDevices => protocol |= TAGGED,
            Target::Site => protocol |= TAGGED | ADDRESSABLE,
            Target::Tags(mask) => {
                protocol |= TAGGED | ADDRESSABLE;
                raw_target = mask.bits().to_le_bytes();
            }
            Target::Device(addr) => {
                protocol |= ADDRESSABLE;
                for (dst, src) in raw_target.iter_mut().zip(addr.as_bytes()) {
                    *dst = *src;
                }
            }
        }
        let site = match (target, site) {
            (_, Some(site)) => site,
            (Target::AllDevices, None) => SiteId::default(),
            (_, None) => return Err(WireError::MissingSite(packet_type)),
        };

        Ok(Self {
            size: (HEADER_SIZE + packet_type.payload_size()) as u16,
            protocol,
            source,
            target: raw_target,
            site,
            flags: HeaderFlags::from_bits(HeaderFlags::RES_REQUIRED),
            seq: 0,
            timestamp: 0,
            packet_type: packet_type.code(),
        })
    }

    /// Decodes the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(
            buf,
            WireError::TooShort {
                len: buf.len(),
                min: HEADER_SIZE,
            },
        );
        let size = r.u16()?;
        let protocol = r.u16()?;
        let source = r.u32()?;
        let target = r.bytes::<8>()?;
        let site = SiteId::new(r.bytes::<ADDR_LENGTH>()?);
        let flags = HeaderFlags::from_bits(r.u8()?);
        let seq = r.u8()?;
        let timestamp = r.u64()?;
        let packet_type = r.u16()?;
        let _reserved = r.u16()?;
        Ok(Self {
            size,
            protocol,
            source,
            target,
            site,
            flags,
            seq,
            timestamp,
            packet_type,
        })
    }

    /// Appends the wire form of the header to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.protocol.to_le_bytes());
        out.extend_from_slice(&self.source.to_le_bytes());
        out.extend_from_slice(&self.target);
        out.extend_from_slice(self.site.as_bytes());
        out.push(self.flags.bits());
        out.push(self.seq);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.packet_type.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
    }

    pub fn version(&self) -> ProtocolVersion {
        ProtocolVersion::from_word(self.protocol)
    }

    pub fn is_addressable(&self) -> bool {
        self.protocol & ADDRESSABLE != 0
    }

    pub fn is_tagged(&self) -> bool {
        self.protocol & TAGGED != 0
    }

    /// Catalogue entry for the type code, if known.
    pub fn known_type(&self) -> Option<PacketType> {
        PacketType::from_code(self.packet_type)
    }

    /// Interprets the target field according to the tagged bit.
    pub fn header_target(&self) -> HeaderTarget {
        if self.is_tagged() {
            HeaderTarget::Tags(TagMask::from_bits(u64::from_le_bytes(self.target)))
        } else {
            let [a, b, c, d, e, f, _, _] = self.target;
            HeaderTarget::Device(DeviceAddr::new([a, b, c, d, e, f]))
        }
    }

    /// Address of the bulb this packet is from or for.
    pub fn device_addr(&self) -> DeviceAddr {
        let [a, b, c, d, e, f, _, _] = self.target;
        DeviceAddr::new([a, b, c, d, e, f])
    }
}

// ============================================================================
// Whole Packets
// ============================================================================

/// A received datagram split into header and payload.
#[derive(Debug, Clone, Copy)]
pub struct Datagram<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    /// Validates framing: the datagram must hold at least a header, and the
    /// header size must equal the number of bytes received.
    pub fn parse(bytes: &'a [u8]) -> WireResult<Self> {
        let header = PacketHeader::decode(bytes)?;
        if usize::from(header.size) != bytes.len() {
            return Err(WireError::SizeMismatch {
                declared: usize::from(header.size),
                received: bytes.len(),
            });
        }
        let payload = bytes.get(HEADER_SIZE..).unwrap_or(&[]);
        Ok(Self { header, payload })
    }
}

/// A fully built outbound packet.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPacket {
    pub header: PacketHeader,
    pub payload: Payload,
}

impl OutboundPacket {
    /// Builds an outbound packet, checking that the payload matches the type.
    pub fn new(
        packet_type: PacketType,
        target: Target,
        site: Option<SiteId>,
        source: u32,
        payload: Payload,
    ) -> WireResult<Self> {
        if !payload.fits(packet_type) {
            return Err(WireError::PayloadMismatch(packet_type));
        }
        let header = PacketHeader::setup(packet_type, target, site, source)?;
        Ok(Self { header, payload })
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        self.header.known_type()
    }

    /// Total encoded size.
    pub fn len(&self) -> usize {
        usize::from(self.header.size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        self.header.encode_into(&mut out);
        self.payload.encode_into(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ORIGIN_MASK;

    const SITE: SiteId = SiteId::new([0x4c, 0x49, 0x46, 0x58, 0x56, 0x32]);

    #[test]
    fn test_header_layout() {
        let mut header = PacketHeader::setup(
            PacketType::SetPowerState,
            Target::Device(DeviceAddr::new([1, 2, 3, 4, 5, 6])),
            Some(SITE),
            0xdead_beef,
        )
        .unwrap();
        header.seq = 7;
        header.timestamp = 0x0102_0304_0506_0708;

        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[0..2], &[38, 0]);
        assert_eq!(&buf[2..4], &[0x00, 0x14]); // 1024 | addressable
        assert_eq!(&buf[4..8], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(&buf[8..16], &[1, 2, 3, 4, 5, 6, 0, 0]);
        assert_eq!(&buf[16..22], SITE.as_bytes());
        assert_eq!(buf[22], HeaderFlags::RES_REQUIRED);
        assert_eq!(buf[23], 7);
        assert_eq!(&buf[24..32], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&buf[32..34], &[0x15, 0x00]);
        assert_eq!(&buf[34..36], &[0, 0]);

        assert_eq!(PacketHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_round_trip_table() {
        let device = DeviceAddr::new([0xd0, 0x73, 0xd5, 0x12, 0x34, 0x56]);
        let mask = TagMask::from_bits(0x8000_0000_0000_0005);
        let cases = [
            (PacketType::GetPanGateway, Target::AllDevices, None, 0u8, 0u64, 0u16),
            (PacketType::GetLightState, Target::Site, Some(SITE), 1, 1, 0),
            (PacketType::SetPowerState, Target::Tags(mask), Some(SITE), 0x7f, u64::MAX, 0),
            (PacketType::SetTags, Target::Device(device), Some(SITE), 0xff, 0x1122_3344_5566_7788, 0),
            // Origin bits as set by a gateway
            (PacketType::LightStatus, Target::Device(device), Some(SITE), 3, 42, ORIGIN_MASK),
            (PacketType::PanGateway, Target::Site, Some(SITE), 9, 7, 0x4000),
        ];
        let flag_sets = [
            0,
            HeaderFlags::RES_REQUIRED,
            HeaderFlags::ACK_REQUIRED,
            HeaderFlags::RES_REQUIRED | HeaderFlags::ACK_REQUIRED,
        ];

        for (packet_type, target, site, seq, timestamp, origin) in cases {
            for flags in flag_sets {
                let mut header = PacketHeader::setup(packet_type, target, site, 0x0bad_cafe).unwrap();
                header.protocol |= origin;
                header.flags = HeaderFlags::from_bits(flags);
                header.seq = seq;
                header.timestamp = timestamp;

                let mut buf = Vec::new();
                header.encode_into(&mut buf);
                assert_eq!(buf.len(), HEADER_SIZE);

                let decoded = PacketHeader::decode(&buf).unwrap();
                assert_eq!(decoded, header, "{packet_type} {target} flags {flags:#x}");
                assert_eq!(decoded.protocol & ORIGIN_MASK, origin);
                assert_eq!(decoded.version(), ProtocolVersion::CURRENT);
                let expected_target = match target {
                    Target::AllDevices | Target::Site => HeaderTarget::Tags(TagMask::EMPTY),
                    Target::Tags(mask) => HeaderTarget::Tags(mask),
                    Target::Device(addr) => HeaderTarget::Device(addr),
                };
                assert_eq!(decoded.header_target(), expected_target);
                assert_eq!(decoded.is_tagged(), !matches!(target, Target::Device(_)));
                assert_eq!(decoded.is_addressable(), !matches!(target, Target::AllDevices));
                assert_eq!(decoded.flags.res_required(), flags & HeaderFlags::RES_REQUIRED != 0);
                assert_eq!(decoded.flags.ack_required(), flags & HeaderFlags::ACK_REQUIRED != 0);
            }
        }
    }

    #[test]
    fn test_setup_addressing_modes() {
        let all = PacketHeader::setup(PacketType::GetPanGateway, Target::AllDevices, None, 1)
            .unwrap();
        assert!(all.is_tagged());
        assert!(!all.is_addressable());
        assert_eq!(all.target, [0; 8]);
        assert_eq!(all.site, SiteId::default());

        let site = PacketHeader::setup(PacketType::GetLightState, Target::Site, Some(SITE), 1)
            .unwrap();
        assert!(site.is_tagged());
        assert!(site.is_addressable());
        assert_eq!(site.header_target(), HeaderTarget::Tags(TagMask::EMPTY));

        let tags = PacketHeader::setup(
            PacketType::SetPowerState,
            Target::Tags(TagMask::from_bits(0b100)),
            Some(SITE),
            1,
        )
        .unwrap();
        assert!(tags.is_tagged() && tags.is_addressable());
        assert_eq!(
            tags.header_target(),
            HeaderTarget::Tags(TagMask::from_bits(0b100))
        );

        let addr = DeviceAddr::new([0xd0, 0x73, 0xd5, 0, 0, 1]);
        let device = PacketHeader::setup(
            PacketType::GetInfo,
            Target::Device(addr),
            Some(SITE),
            1,
        )
        .unwrap();
        assert!(!device.is_tagged());
        assert!(device.is_addressable());
        assert_eq!(device.header_target(), HeaderTarget::Device(addr));
        assert!(device.flags.res_required());
        assert!(!device.flags.ack_required());
    }

    #[test]
    fn test_setup_requires_site() {
        assert_eq!(
            PacketHeader::setup(PacketType::GetLightState, Target::Site, None, 1),
            Err(WireError::MissingSite(PacketType::GetLightState))
        );
    }

    #[test]
    fn test_datagram_framing() {
        let packet = OutboundPacket::new(
            PacketType::SetPowerState,
            Target::Site,
            Some(SITE),
            1,
            Payload::Power(lifx_core::PowerLevel::On),
        )
        .unwrap();
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 38);

        let datagram = Datagram::parse(&bytes).unwrap();
        assert_eq!(datagram.header, packet.header);
        assert_eq!(datagram.payload, &[0xff, 0xff]);

        assert_eq!(
            Datagram::parse(&bytes[..20]).unwrap_err(),
            WireError::TooShort { len: 20, min: 36 }
        );
        assert_eq!(
            Datagram::parse(&bytes[..37]).unwrap_err(),
            WireError::SizeMismatch {
                declared: 38,
                received: 37
            }
        );
    }

    #[test]
    fn test_outbound_packet_rejects_wrong_payload() {
        let err = OutboundPacket::new(
            PacketType::SetTags,
            Target::Site,
            Some(SITE),
            1,
            Payload::Empty,
        )
        .unwrap_err();
        assert_eq!(err, WireError::PayloadMismatch(PacketType::SetTags));
    }
}
