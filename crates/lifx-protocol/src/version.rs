//! Protocol word: version number plus addressing bits.

use std::fmt;

/// Mask of the 12-bit version number inside the protocol word.
pub const VERSION_MASK: u16 = 0x0fff;

/// Set when the target field holds a meaningful address or tag mask.
pub const ADDRESSABLE: u16 = 0x1000;

/// Set when the target field is a tag mask rather than a device address.
pub const TAGGED: u16 = 0x2000;

/// Two origin bits, always zero for packets we send.
pub const ORIGIN_MASK: u16 = 0xc000;

/// Version number carried in the low 12 bits of the protocol word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion(u16);

impl ProtocolVersion {
    /// The only version this engine speaks.
    pub const CURRENT: ProtocolVersion = ProtocolVersion(1024);

    /// Extracts the version from a full protocol word.
    pub const fn from_word(word: u16) -> Self {
        Self(word & VERSION_MASK)
    }

    /// Raw version number.
    pub const fn number(self) -> u16 {
        self.0
    }

    /// Returns true if packets with this version can be decoded.
    pub fn is_supported(self) -> bool {
        self == Self::CURRENT
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
