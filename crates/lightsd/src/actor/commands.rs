//! Engine actor commands and errors.
//!
//! - `EngineCommand`: messages sent to the actor, each carrying a oneshot
//!   sender for its response
//! - `EngineError`: what a handle call can fail with

use thiserror::Error;
use tokio::sync::oneshot;

use lifx_core::Hsbk;

use crate::bulb::BulbView;
use crate::commands::{CommandError, WaveformParams};
use crate::tagging::TagView;

/// Response channel of a state-changing command.
pub type Reply = oneshot::Sender<Result<(), EngineError>>;

// ============================================================================
// Engine Commands
// ============================================================================

/// Commands sent to the engine actor.
#[derive(Debug)]
pub enum EngineCommand {
    PowerOn {
        targets: Vec<String>,
        respond_to: Reply,
    },

    PowerOff {
        targets: Vec<String>,
        respond_to: Reply,
    },

    /// Flip the power of every resolved bulb.
    PowerToggle {
        targets: Vec<String>,
        respond_to: Reply,
    },

    SetLight {
        targets: Vec<String>,
        color: Hsbk,
        transition_ms: u32,
        respond_to: Reply,
    },

    SetWaveform {
        targets: Vec<String>,
        params: WaveformParams,
        respond_to: Reply,
    },

    /// Add a tag to the resolved bulbs, allocating ids as needed.
    Tag {
        targets: Vec<String>,
        label: String,
        respond_to: Reply,
    },

    Untag {
        targets: Vec<String>,
        label: String,
        respond_to: Reply,
    },

    ListTags {
        respond_to: oneshot::Sender<Vec<TagView>>,
    },

    GetLightState {
        targets: Vec<String>,
        respond_to: oneshot::Sender<Result<Vec<BulbView>, EngineError>>,
    },

    /// Every known bulb.
    ListBulbs {
        respond_to: oneshot::Sender<Vec<BulbView>>,
    },

    /// Broadcast a discovery packet now.
    ///
    /// Fire-and-forget.
    Rediscover,

    /// Run the liveness sweep.
    ///
    /// Fire-and-forget, sent by the watchdog task.
    WatchdogSweep,
}

// ============================================================================
// Engine Errors
// ============================================================================

/// Errors returned through an [`super::EngineHandle`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The actor stopped before answering.
    #[error("response channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Command(#[from] CommandError),
}
