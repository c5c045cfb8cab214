//! Events published by the engine.

use std::fmt;
use std::net::SocketAddr;

use lifx_core::{DeviceAddr, SiteId};
use serde::Serialize;

/// Why a bulb or gateway was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Watchdog: no traffic for too long.
    Timeout,
    /// Sending to the gateway failed.
    SocketError,
    /// The engine is stopping.
    Shutdown,
    /// A bulb went away with its gateway.
    GatewayClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::SocketError => write!(f, "socket error"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::GatewayClosed => write!(f, "gateway closed"),
        }
    }
}

/// State changes subscribers can follow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    GatewayOpened {
        peer: SocketAddr,
        site: SiteId,
    },
    GatewayClosed {
        peer: SocketAddr,
        site: SiteId,
        reason: CloseReason,
    },
    BulbOpened {
        addr: DeviceAddr,
        gateway: SocketAddr,
    },
    BulbClosed {
        addr: DeviceAddr,
        reason: CloseReason,
    },
    TagDiscovered {
        label: String,
    },
    TagForgotten {
        label: String,
    },
}
