//! Hardware addresses and site identifiers.
//!
//! Both are 6-byte values on the wire. A `DeviceAddr` identifies one bulb, a
//! `SiteId` identifies the mesh a gateway belongs to.

use serde::{Serialize, Serializer};
use std::fmt;

use crate::{DomainError, DomainResult};

/// Length in bytes of a device address or site id.
pub const ADDR_LENGTH: usize = 6;

fn fmt_addr(bytes: &[u8; ADDR_LENGTH], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let [a, b, c, d, e, g] = bytes;
    write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
}

// ============================================================================
// Device Address
// ============================================================================

/// 6-byte hardware address of a bulb, unique across the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddr([u8; ADDR_LENGTH]);

impl DeviceAddr {
    /// Creates an address from its raw bytes.
    pub const fn new(bytes: [u8; ADDR_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ADDR_LENGTH] {
        &self.0
    }

    /// Parses a hexadecimal address literal such as `d073d5012a3b`.
    ///
    /// The literal is read as one big-endian number whose low 48 bits are the
    /// address, so leading zeros may be omitted.
    pub fn from_hex(s: &str) -> DomainResult<Self> {
        if s.is_empty() {
            return Err(DomainError::ParseError {
                field: "device address".to_string(),
                reason: "empty".to_string(),
            });
        }
        let value = u64::from_str_radix(s, 16).map_err(|e| DomainError::ParseError {
            field: "device address".to_string(),
            reason: e.to_string(),
        })?;
        if value >> (ADDR_LENGTH * 8) != 0 {
            return Err(DomainError::InvalidFieldValue {
                field: "device address".to_string(),
                value: s.to_string(),
                expected: "at most 12 hex digits".to_string(),
            });
        }
        let [_, _, a, b, c, d, e, f] = value.to_be_bytes();
        Ok(Self([a, b, c, d, e, f]))
    }

    /// Returns the address as a 12-digit lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_addr(&self.0, f)
    }
}

impl From<[u8; ADDR_LENGTH]> for DeviceAddr {
    fn from(bytes: [u8; ADDR_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for DeviceAddr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for DeviceAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

// ============================================================================
// Site Identifier
// ============================================================================

/// 6-byte identifier of a site (the mesh a gateway serves).
///
/// Several gateways can share a site when bulbs are too far apart for a single
/// mesh, so gateways are keyed by peer address and not by site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SiteId([u8; ADDR_LENGTH]);

impl SiteId {
    /// Creates a site id from its raw bytes.
    pub const fn new(bytes: [u8; ADDR_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ADDR_LENGTH] {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_addr(&self.0, f)
    }
}

impl From<[u8; ADDR_LENGTH]> for SiteId {
    fn from(bytes: [u8; ADDR_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl Serialize for SiteId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_addr_display() {
        let addr = DeviceAddr::new([0xd0, 0x73, 0xd5, 0x01, 0x2a, 0x3b]);
        assert_eq!(addr.to_string(), "d0:73:d5:01:2a:3b");
        assert_eq!(addr.to_hex(), "d073d5012a3b");
    }

    #[test]
    fn test_device_addr_from_hex() {
        let addr = DeviceAddr::from_hex("d073d5012a3b").unwrap();
        assert_eq!(addr.as_bytes(), &[0xd0, 0x73, 0xd5, 0x01, 0x2a, 0x3b]);

        // Leading zeros can be dropped
        let addr = DeviceAddr::from_hex("2a").unwrap();
        assert_eq!(addr.as_bytes(), &[0, 0, 0, 0, 0, 0x2a]);
    }

    #[test]
    fn test_device_addr_from_hex_invalid() {
        assert!(DeviceAddr::from_hex("").is_err());
        assert!(DeviceAddr::from_hex("kitchen").is_err());
        assert!(DeviceAddr::from_hex("1d073d5012a3b").is_err());
    }

    #[test]
    fn test_addr_serialization() {
        let addr = DeviceAddr::new([1, 2, 3, 4, 5, 6]);
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"010203040506\"");

        let site = SiteId::new([0x4c, 0x49, 0x46, 0x58, 0x56, 0x32]);
        assert_eq!(
            serde_json::to_string(&site).unwrap(),
            "\"4c:49:46:58:56:32\""
        );
    }
}
