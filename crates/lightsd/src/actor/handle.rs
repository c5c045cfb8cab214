//! Client interface of the engine actor.
//!
//! # Panic-Free Guarantees
//!
//! Channel errors are mapped to `EngineError::ChannelClosed`; queries
//! return empty results when the actor is gone.

use tokio::sync::{broadcast, mpsc, oneshot};

use lifx_core::Hsbk;

use super::commands::{EngineCommand, EngineError, Reply};
use crate::bulb::BulbView;
use crate::commands::WaveformParams;
use crate::event::EngineEvent;
use crate::tagging::TagView;

fn owned(targets: &[&str]) -> Vec<String> {
    targets.iter().map(|t| (*t).to_string()).collect()
}

/// Cheap-to-clone handle on the engine actor.
///
/// ```ignore
/// handle.power_on(&["#kitchen"]).await?;
/// let bulbs = handle.get_light_state(&["*"]).await?;
/// let mut events = handle.subscribe();
/// ```
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
    event_sender: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    pub fn new(
        sender: mpsc::Sender<EngineCommand>,
        event_sender: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Sends a command built around a fresh reply channel and waits for it.
    async fn request(
        &self,
        build: impl FnOnce(Reply) -> EngineCommand,
    ) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(build(tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;

        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Turns the targeted bulbs on.
    ///
    /// # Errors
    ///
    /// - `EngineError::Command` if a target is invalid or every packet was
    ///   dropped
    /// - `EngineError::ChannelClosed` if the actor has shut down
    pub async fn power_on(&self, targets: &[&str]) -> Result<(), EngineError> {
        let targets = owned(targets);
        self.request(|respond_to| EngineCommand::PowerOn {
            targets,
            respond_to,
        })
        .await
    }

    pub async fn power_off(&self, targets: &[&str]) -> Result<(), EngineError> {
        let targets = owned(targets);
        self.request(|respond_to| EngineCommand::PowerOff {
            targets,
            respond_to,
        })
        .await
    }

    pub async fn power_toggle(&self, targets: &[&str]) -> Result<(), EngineError> {
        let targets = owned(targets);
        self.request(|respond_to| EngineCommand::PowerToggle {
            targets,
            respond_to,
        })
        .await
    }

    /// Sets the color of the targeted bulbs over `transition_ms`.
    pub async fn set_light(
        &self,
        targets: &[&str],
        color: Hsbk,
        transition_ms: u32,
    ) -> Result<(), EngineError> {
        let targets = owned(targets);
        self.request(|respond_to| EngineCommand::SetLight {
            targets,
            color,
            transition_ms,
            respond_to,
        })
        .await
    }

    pub async fn set_waveform(
        &self,
        targets: &[&str],
        params: WaveformParams,
    ) -> Result<(), EngineError> {
        let targets = owned(targets);
        self.request(|respond_to| EngineCommand::SetWaveform {
            targets,
            params,
            respond_to,
        })
        .await
    }

    pub async fn tag(&self, targets: &[&str], label: &str) -> Result<(), EngineError> {
        let targets = owned(targets);
        let label = label.to_string();
        self.request(|respond_to| EngineCommand::Tag {
            targets,
            label,
            respond_to,
        })
        .await
    }

    pub async fn untag(&self, targets: &[&str], label: &str) -> Result<(), EngineError> {
        let targets = owned(targets);
        let label = label.to_string();
        self.request(|respond_to| EngineCommand::Untag {
            targets,
            label,
            respond_to,
        })
        .await
    }

    /// Every known tag.
    ///
    /// Returns an empty vector if the actor is gone.
    pub async fn list_tags(&self) -> Vec<TagView> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(EngineCommand::ListTags { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Snapshot of the targeted bulbs.
    pub async fn get_light_state(&self, targets: &[&str]) -> Result<Vec<BulbView>, EngineError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(EngineCommand::GetLightState {
                targets: owned(targets),
                respond_to: tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;

        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Every known bulb.
    pub async fn list_bulbs(&self) -> Vec<BulbView> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(EngineCommand::ListBulbs { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Asks for a discovery broadcast. Fire-and-forget.
    pub async fn rediscover(&self) {
        let _ = self.sender.send(EngineCommand::Rediscover).await;
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_sender.subscribe()
    }

    /// True while the actor accepts commands.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
