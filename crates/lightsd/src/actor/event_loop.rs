//! Engine actor: the single task owning the [`Engine`].
//!
//! Every registry mutation happens here. The loop waits on, in order of
//! priority: cancellation, handle commands, inbound datagrams, the earliest
//! engine deadline and socket writability. After each wake-up pending
//! packets are flushed and engine events published.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`
//! - Response send failures are ignored: the caller may have gone away
//! - Event publish failures only mean there is no subscriber

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lifx_core::Millis;

use super::commands::{EngineCommand, EngineError};
use crate::engine::Engine;
use crate::event::EngineEvent;
use crate::transport::{InboundDatagram, UdpSink};

// ============================================================================
// Clock
// ============================================================================

/// Maps tokio instants to the engine's millisecond timeline.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> Millis {
        self.millis_at(Instant::now())
    }

    /// Engine time of `at`; instants before the origin map to zero.
    pub fn millis_at(&self, at: Instant) -> Millis {
        let elapsed = at.saturating_duration_since(self.origin);
        u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn instant_at(&self, millis: Millis) -> Instant {
        self.origin + std::time::Duration::from_millis(millis)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Engine Actor
// ============================================================================

pub struct EngineActor {
    engine: Engine,
    clock: Clock,
    socket: Arc<UdpSocket>,
    receiver: mpsc::Receiver<EngineCommand>,
    datagrams: mpsc::Receiver<InboundDatagram>,
    event_publisher: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
}

impl EngineActor {
    pub fn new(
        engine: Engine,
        socket: Arc<UdpSocket>,
        receiver: mpsc::Receiver<EngineCommand>,
        datagrams: mpsc::Receiver<InboundDatagram>,
        event_publisher: broadcast::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            clock: Clock::new(),
            socket,
            receiver,
            datagrams,
            event_publisher,
            cancel,
        }
    }

    /// Runs until `cancel` fires or the command channel closes, then closes
    /// every gateway.
    pub async fn run(mut self) {
        info!(client_id = self.engine.client_id(), "engine actor starting");
        self.engine.start_discovery(self.clock.now());
        self.flush();

        loop {
            let deadline = self
                .engine
                .next_deadline()
                .map(|at| self.clock.instant_at(at));
            let wants_write = self.engine.has_pending_writes();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(datagram) = self.datagrams.recv() => {
                    let at = self.clock.millis_at(datagram.received_at);
                    self.engine.handle_datagram(datagram.peer, &datagram.bytes, at);
                }
                _ = sleep_until_deadline(deadline) => {
                    self.engine.on_timers(self.clock.now());
                }
                ready = self.socket.writable(), if wants_write => {
                    if let Err(e) = ready {
                        warn!(error = %e, "socket not writable");
                    }
                }
            }

            self.flush();
            self.publish_events();
        }

        self.engine.shutdown();
        self.publish_events();
        info!(
            gateways = self.engine.gateways().count(),
            bulbs = self.engine.bulbs().len(),
            "engine actor stopped"
        );
    }

    fn flush(&mut self) {
        let now = self.clock.now();
        let mut sink = UdpSink::new(&self.socket);
        self.engine.flush(&mut sink, now);
    }

    fn publish_events(&mut self) {
        for event in self.engine.drain_events() {
            // No subscriber is fine
            let _ = self.event_publisher.send(event);
        }
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        let now = self.clock.now();
        match cmd {
            EngineCommand::PowerOn {
                targets,
                respond_to,
            } => {
                let result = self.engine.power_on(&targets, now);
                let _ = respond_to.send(result.map(drop).map_err(EngineError::from));
            }
            EngineCommand::PowerOff {
                targets,
                respond_to,
            } => {
                let result = self.engine.power_off(&targets, now);
                let _ = respond_to.send(result.map(drop).map_err(EngineError::from));
            }
            EngineCommand::PowerToggle {
                targets,
                respond_to,
            } => {
                let result = self.engine.power_toggle(&targets, now);
                let _ = respond_to.send(result.map_err(EngineError::from));
            }
            EngineCommand::SetLight {
                targets,
                color,
                transition_ms,
                respond_to,
            } => {
                let result = self.engine.set_light(&targets, color, transition_ms, now);
                let _ = respond_to.send(result.map(drop).map_err(EngineError::from));
            }
            EngineCommand::SetWaveform {
                targets,
                params,
                respond_to,
            } => {
                let result = self.engine.set_waveform(&targets, params, now);
                let _ = respond_to.send(result.map(drop).map_err(EngineError::from));
            }
            EngineCommand::Tag {
                targets,
                label,
                respond_to,
            } => {
                let result = self.engine.tag(&targets, &label, now);
                let _ = respond_to.send(result.map_err(EngineError::from));
            }
            EngineCommand::Untag {
                targets,
                label,
                respond_to,
            } => {
                let result = self.engine.untag(&targets, &label, now);
                let _ = respond_to.send(result.map_err(EngineError::from));
            }
            EngineCommand::ListTags { respond_to } => {
                let _ = respond_to.send(self.engine.list_tags());
            }
            EngineCommand::GetLightState {
                targets,
                respond_to,
            } => {
                let result = self.engine.get_light_state(&targets);
                let _ = respond_to.send(result.map_err(EngineError::from));
            }
            EngineCommand::ListBulbs { respond_to } => {
                let _ = respond_to.send(self.engine.bulb_views());
            }
            EngineCommand::Rediscover => {
                debug!("rediscovery requested");
                self.engine.request_rediscovery();
            }
            EngineCommand::WatchdogSweep => {
                if self.engine.needs_watchdog() {
                    self.engine.watchdog_sweep(now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_mapping() {
        let clock = Clock::new();
        assert_eq!(clock.now(), 0);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now(), 1500);
        assert_eq!(clock.millis_at(clock.instant_at(250)), 250);
    }
}
