//! Wire codec errors.

use thiserror::Error;

use crate::PacketType;

/// Errors raised while encoding or decoding packets.
///
/// None of these are fatal: the receive path logs them and drops the packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than a header
    #[error("packet too short: {len} bytes (header is {min})")]
    TooShort { len: usize, min: usize },

    /// Header size field disagrees with the datagram length
    #[error("incomplete packet: header says {declared} bytes, received {received}")]
    SizeMismatch { declared: usize, received: usize },

    /// Type code not present in the packet catalogue
    #[error("unknown packet type {0:#x}")]
    UnknownPacketType(u16),

    /// Payload shorter than the catalogue says it should be
    #[error("{packet_type} payload is {len} bytes, expected {expected}")]
    PayloadSize {
        packet_type: PacketType,
        len: usize,
        expected: usize,
    },

    /// A site is required for every addressing mode except all-devices
    #[error("a site is required to address {0}")]
    MissingSite(PacketType),

    /// A payload field holds a value outside of its domain
    #[error("{packet_type} carries an invalid {field}")]
    InvalidValue {
        packet_type: PacketType,
        field: &'static str,
    },

    /// Payload variant does not belong to the packet type
    #[error("payload does not match packet type {0}")]
    PayloadMismatch(PacketType),
}

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;
