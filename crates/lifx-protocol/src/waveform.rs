//! Waveform shapes for SET_WAVEFORM.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Shape of a periodic effect, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Waveform {
    #[default]
    Saw = 0,
    Sine = 1,
    HalfSine = 2,
    Triangle = 3,
    Square = 4,
}

impl Waveform {
    pub const ALL: [Waveform; 5] = [
        Waveform::Saw,
        Waveform::Sine,
        Waveform::HalfSine,
        Waveform::Triangle,
        Waveform::Square,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Saw => "SAW",
            Self::Sine => "SINE",
            Self::HalfSine => "HALF_SINE",
            Self::Triangle => "TRIANGLE",
            Self::Square => "SQUARE",
        }
    }

    pub const fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn from_wire(raw: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.to_wire() == raw)
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a waveform name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownWaveform(pub String);

impl fmt::Display for UnknownWaveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown waveform: {}", self.0)
    }
}

impl std::error::Error for UnknownWaveform {}

impl FromStr for Waveform {
    type Err = UnknownWaveform;

    /// Accepts the wire names case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|w| w.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownWaveform(s.to_string()))
    }
}
