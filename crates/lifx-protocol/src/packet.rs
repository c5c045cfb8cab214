//! Static packet catalogue.
//!
//! Every type code the gateways are known to speak has an entry here, even the
//! ones the engine never acts on. Lookup is by code; unknown codes are dropped
//! by the receive path.

use serde::Serialize;
use std::fmt;

/// How the engine treats a packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    /// Inbound packet with a decoder and a handler.
    Handled,
    /// Packet the engine only ever sends.
    RequestOnly,
    /// Known to exist but not acted upon.
    Unimplemented,
}

/// Packet type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u16)]
pub enum PacketType {
    GetPanGateway = 0x02,
    PanGateway = 0x03,
    GetTime = 0x04,
    SetTime = 0x05,
    TimeState = 0x06,
    GetResetSwitchState = 0x07,
    ResetSwitchState = 0x08,
    GetMeshInfo = 0x0c,
    MeshInfo = 0x0d,
    GetMeshFirmware = 0x0e,
    MeshFirmware = 0x0f,
    GetWifiInfo = 0x10,
    WifiInfo = 0x11,
    GetWifiFirmwareState = 0x12,
    WifiFirmwareState = 0x13,
    GetPowerState = 0x14,
    SetPowerState = 0x15,
    PowerState = 0x16,
    GetBulbLabel = 0x17,
    SetBulbLabel = 0x18,
    BulbLabel = 0x19,
    GetTags = 0x1a,
    SetTags = 0x1b,
    Tags = 0x1c,
    GetTagLabels = 0x1d,
    SetTagLabels = 0x1e,
    TagLabels = 0x1f,
    GetVersion = 0x20,
    VersionState = 0x21,
    GetInfo = 0x22,
    InfoState = 0x23,
    GetMcuRailVoltage = 0x24,
    McuRailVoltage = 0x25,
    Reboot = 0x26,
    SetFactoryTestMode = 0x27,
    DisableFactoryTestMode = 0x28,
    GetLightState = 0x65,
    SetLightColor = 0x66,
    SetWaveform = 0x67,
    SetDimAbsolute = 0x68,
    SetDimRelative = 0x69,
    LightStatus = 0x6b,
    GetWifiState = 0x12d,
    SetWifiState = 0x12e,
    WifiState = 0x12f,
    GetAccessPoints = 0x130,
    SetAccessPoints = 0x131,
    AccessPoint = 0x132,
    GetAmbientLight = 0x191,
    StateAmbientLight = 0x192,
}

/// Catalogue entry for one packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub packet_type: PacketType,
    pub name: &'static str,
    /// Payload size in bytes, excluding the header.
    pub size: usize,
    pub kind: PacketKind,
}

macro_rules! catalogue {
    ($($variant:ident => $name:literal, $size:expr, $kind:ident;)*) => {
        /// Every known packet type, in code order.
        pub const CATALOGUE: &[PacketInfo] = &[
            $(PacketInfo {
                packet_type: PacketType::$variant,
                name: $name,
                size: $size,
                kind: PacketKind::$kind,
            },)*
        ];

        impl PacketType {
            /// Looks a type code up in the catalogue.
            pub fn from_code(code: u16) -> Option<Self> {
                $(if code == PacketType::$variant as u16 {
                    return Some(PacketType::$variant);
                })*
                None
            }

            /// Catalogue entry for this type.
            pub const fn info(self) -> PacketInfo {
                match self {
                    $(PacketType::$variant => PacketInfo {
                        packet_type: PacketType::$variant,
                        name: $name,
                        size: $size,
                        kind: PacketKind::$kind,
                    },)*
                }
            }
        }
    };
}

catalogue! {
    GetPanGateway => "GET_PAN_GATEWAY", 0, RequestOnly;
    PanGateway => "PAN_GATEWAY", 5, Handled;
    GetTime => "GET_TIME", 0, Unimplemented;
    SetTime => "SET_TIME", 0, Unimplemented;
    TimeState => "TIME_STATE", 0, Unimplemented;
    GetResetSwitchState => "GET_RESET_SWITCH_STATE", 0, Unimplemented;
    ResetSwitchState => "RESET_SWITCH_STATE", 0, Unimplemented;
    GetMeshInfo => "GET_MESH_INFO", 0, RequestOnly;
    MeshInfo => "MESH_INFO", 14, Handled;
    GetMeshFirmware => "GET_MESH_FIRMWARE", 0, RequestOnly;
    MeshFirmware => "MESH_FIRMWARE", 20, Handled;
    GetWifiInfo => "GET_WIFI_INFO", 0, RequestOnly;
    WifiInfo => "WIFI_INFO", 14, Handled;
    GetWifiFirmwareState => "GET_WIFI_FIRMWARE_STATE", 0, RequestOnly;
    WifiFirmwareState => "WIFI_FIRMWARE_STATE", 20, Handled;
    GetPowerState => "GET_POWER_STATE", 0, RequestOnly;
    SetPowerState => "SET_POWER_STATE", 2, RequestOnly;
    PowerState => "POWER_STATE", 2, Handled;
    GetBulbLabel => "GET_BULB_LABEL", 0, Unimplemented;
    SetBulbLabel => "SET_BULB_LABEL", 32, RequestOnly;
    BulbLabel => "BULB_LABEL", 32, Handled;
    GetTags => "GET_TAGS", 0, RequestOnly;
    SetTags => "SET_TAGS", 8, RequestOnly;
    Tags => "TAGS", 8, Handled;
    GetTagLabels => "GET_TAG_LABELS", 8, RequestOnly;
    SetTagLabels => "SET_TAG_LABELS", 40, RequestOnly;
    TagLabels => "TAG_LABELS", 40, Handled;
    GetVersion => "GET_VERSION", 0, RequestOnly;
    VersionState => "VERSION_STATE", 12, Handled;
    GetInfo => "GET_INFO", 0, RequestOnly;
    InfoState => "INFO_STATE", 24, Handled;
    GetMcuRailVoltage => "GET_MCU_RAIL_VOLTAGE", 0, Unimplemented;
    McuRailVoltage => "MCU_RAIL_VOLTAGE", 0, Unimplemented;
    Reboot => "REBOOT", 0, Unimplemented;
    SetFactoryTestMode => "SET_FACTORY_TEST_MODE", 0, Unimplemented;
    DisableFactoryTestMode => "DISABLE_FACTORY_TEST_MODE", 0, Unimplemented;
    GetLightState => "GET_LIGHT_STATE", 0, RequestOnly;
    SetLightColor => "SET_LIGHT_COLOR", 13, RequestOnly;
    SetWaveform => "SET_WAVEFORM", 21, RequestOnly;
    SetDimAbsolute => "SET_DIM_ABSOLUTE", 0, Unimplemented;
    SetDimRelative => "SET_DIM_RELATIVE", 0, Unimplemented;
    LightStatus => "LIGHT_STATUS", 52, Handled;
    GetWifiState => "GET_WIFI_STATE", 0, Unimplemented;
    SetWifiState => "SET_WIFI_STATE", 0, Unimplemented;
    WifiState => "WIFI_STATE", 0, Unimplemented;
    GetAccessPoints => "GET_ACCESS_POINTS", 0, Unimplemented;
    SetAccessPoints => "SET_ACCESS_POINTS", 0, Unimplemented;
    AccessPoint => "ACCESS_POINT", 0, Unimplemented;
    GetAmbientLight => "GET_AMBIENT_LIGHT", 0, RequestOnly;
    StateAmbientLight => "STATE_AMBIENT_LIGHT", 4, Handled;
}

impl PacketType {
    /// Numeric type code.
    pub const fn code(self) -> u16 {
        self as u16
    }

    pub const fn name(self) -> &'static str {
        self.info().name
    }

    /// Payload size in bytes.
    pub const fn payload_size(self) -> usize {
        self.info().size
    }

    pub const fn kind(self) -> PacketKind {
        self.info().kind
    }
}

impl PacketInfo {
    /// Looks a type code up in the catalogue.
    pub fn lookup(code: u16) -> Option<PacketInfo> {
        PacketType::from_code(code).map(PacketType::info)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_codes() {
        let info = PacketInfo::lookup(0x6b).unwrap();
        assert_eq!(info.packet_type, PacketType::LightStatus);
        assert_eq!(info.name, "LIGHT_STATUS");
        assert_eq!(info.size, 52);
        assert_eq!(info.kind, PacketKind::Handled);

        let info = PacketInfo::lookup(0x02).unwrap();
        assert_eq!(info.kind, PacketKind::RequestOnly);
        assert_eq!(info.size, 0);

        let info = PacketInfo::lookup(0x130).unwrap();
        assert_eq!(info.kind, PacketKind::Unimplemented);
    }

    #[test]
    fn test_lookup_unknown_code() {
        assert!(PacketInfo::lookup(0x00).is_none());
        assert!(PacketInfo::lookup(0x6a).is_none());
        assert!(PacketInfo::lookup(0xffff).is_none());
    }

    #[test]
    fn test_catalogue_is_consistent() {
        for entry in CATALOGUE {
            assert_eq!(PacketType::from_code(entry.packet_type.code()), Some(entry.packet_type));
            assert_eq!(entry.packet_type.info(), *entry);
        }
        // Codes are listed in ascending order and never repeat
        for pair in CATALOGUE.windows(2) {
            assert!(pair[0].packet_type.code() < pair[1].packet_type.code());
        }
    }

    #[test]
    fn test_payload_sizes() {
        assert_eq!(PacketType::PanGateway.payload_size(), 5);
        assert_eq!(PacketType::SetLightColor.payload_size(), 13);
        assert_eq!(PacketType::SetWaveform.payload_size(), 21);
        assert_eq!(PacketType::SetTagLabels.payload_size(), 40);
        assert_eq!(PacketType::MeshFirmware.payload_size(), 20);
        assert_eq!(PacketType::InfoState.payload_size(), 24);
        assert_eq!(PacketType::StateAmbientLight.payload_size(), 4);
    }
}
