//! Light state value objects: labels, colors and power.

use serde::{Serialize, Serializer};
use std::fmt;
use std::ops::RangeInclusive;

use crate::{DomainError, DomainResult, TagMask};

/// Size of the label field on the wire, NUL padding included.
pub const LABEL_SIZE: usize = 32;

/// Color temperatures accepted by the bulbs.
pub const KELVIN_RANGE: RangeInclusive<u16> = 2500..=9000;

// ============================================================================
// Label
// ============================================================================

/// A bulb or tag label as carried on the wire: up to 31 bytes, NUL padded.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label([u8; LABEL_SIZE]);

impl Label {
    /// The empty label.
    pub const EMPTY: Label = Label([0; LABEL_SIZE]);

    /// Builds a label from user input, rejecting anything that would not
    /// leave room for the terminating NUL.
    pub fn new(label: &str) -> DomainResult<Self> {
        let bytes = label.as_bytes();
        if bytes.len() >= LABEL_SIZE {
            return Err(DomainError::LabelTooLong {
                len: bytes.len(),
                max: LABEL_SIZE - 1,
            });
        }
        let mut raw = [0u8; LABEL_SIZE];
        for (dst, src) in raw.iter_mut().zip(bytes) {
            *dst = *src;
        }
        Ok(Self(raw))
    }

    /// Wraps raw wire bytes as received.
    pub const fn from_wire(raw: [u8; LABEL_SIZE]) -> Self {
        Self(raw)
    }

    /// Raw wire bytes.
    pub fn as_bytes(&self) -> &[u8; LABEL_SIZE] {
        &self.0
    }

    /// Bytes up to the first NUL.
    pub fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(LABEL_SIZE);
        self.0.get(..end).unwrap_or(&[])
    }

    /// True when the label holds no text.
    pub fn is_empty(&self) -> bool {
        self.0.first().map_or(true, |&b| b == 0)
    }

    /// Lossy UTF-8 rendering for logs and snapshots.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.trimmed()).into_owned()
    }

    /// Byte-for-byte comparison with a user supplied label.
    pub fn matches(&self, label: &str) -> bool {
        self.trimmed() == label.as_bytes()
    }
}

impl Default for Label {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Label({:?})", self.to_string_lossy())
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string_lossy())
    }
}

// ============================================================================
// Power
// ============================================================================

/// Power level of a bulb.
///
/// Bulbs report intermediate values between 0 and 0xffff while fading; only
/// 0xffff counts as on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerLevel {
    #[default]
    Off,
    On,
}

impl PowerLevel {
    /// Wire value for "on".
    pub const ON_VALUE: u16 = 0xffff;

    /// Interprets a raw wire value.
    pub fn from_wire(raw: u16) -> Self {
        if raw == Self::ON_VALUE {
            Self::On
        } else {
            Self::Off
        }
    }

    /// Value to put on the wire.
    pub fn to_wire(self) -> u16 {
        match self {
            Self::On => Self::ON_VALUE,
            Self::Off => 0,
        }
    }

    /// Returns the opposite level.
    #[must_use]
    pub fn toggled(self) -> Self {
        match self {
            Self::On => Self::Off,
            Self::Off => Self::On,
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

impl fmt::Display for PowerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

// ============================================================================
// Color and Light State
// ============================================================================

/// Hue, saturation, brightness and kelvin in raw 16-bit wire units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Hsbk {
    pub hue: u16,
    pub saturation: u16,
    pub brightness: u16,
    pub kelvin: u16,
}

impl Hsbk {
    pub const fn new(hue: u16, saturation: u16, brightness: u16, kelvin: u16) -> Self {
        Self {
            hue,
            saturation,
            brightness,
            kelvin,
        }
    }

    /// Checks the kelvin component against what the bulbs accept.
    pub fn validate(&self) -> DomainResult<()> {
        if !KELVIN_RANGE.contains(&self.kelvin) {
            return Err(DomainError::InvalidFieldValue {
                field: "kelvin".to_string(),
                value: self.kelvin.to_string(),
                expected: format!("{}..={}", KELVIN_RANGE.start(), KELVIN_RANGE.end()),
            });
        }
        Ok(())
    }

    /// Hue in degrees, for display.
    pub fn hue_degrees(&self) -> f64 {
        f64::from(self.hue) * 360.0 / f64::from(u16::MAX)
    }

    /// Saturation in `0.0..=1.0`, for display.
    pub fn saturation_ratio(&self) -> f64 {
        f64::from(self.saturation) / f64::from(u16::MAX)
    }

    /// Brightness in `0.0..=1.0`, for display.
    pub fn brightness_ratio(&self) -> f64 {
        f64::from(self.brightness) / f64::from(u16::MAX)
    }
}

/// Light state reported by a bulb in LIGHT_STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LightState {
    pub color: Hsbk,
    pub dim: u16,
    pub power: PowerLevel,
    pub label: Label,
    pub tags: TagMask,
}
