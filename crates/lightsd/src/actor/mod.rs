//! Engine actor.
//!
//! The [`Engine`](crate::engine::Engine) is plain synchronous state; this
//! module puts it behind a tokio task so the UDP socket, the command API and
//! the timers all funnel into a single owner.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  EngineCommand   ┌─────────────────┐  EngineEvent   ┌──────────────┐
//! │  EngineHandle   │─────────────────▶│   EngineActor   │───────────────▶│  subscribers │
//! └─────────────────┘  (mpsc channel)  └────────┬────────┘  (broadcast)   └──────────────┘
//!                                        ▲      │
//!              InboundDatagram (mpsc)    │      │ try_send_to
//!                                        │      ▼
//! ┌─────────────────┐                 ┌──┴──────────────┐
//! │ watchdog ticker │──WatchdogSweep─▶│   UDP socket    │◀────▶ gateways
//! └─────────────────┘                 └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Every task exits cleanly when its channel closes or the token fires

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod commands;
mod event_loop;
mod handle;

pub use commands::{EngineCommand, EngineError, Reply};
pub use event_loop::{Clock, EngineActor};
pub use handle::EngineHandle;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::transport;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;
const DATAGRAM_BUFFER: usize = 256;

/// Spawns the engine on `socket` and returns a handle plus the actor task.
///
/// This function:
/// 1. Creates the command, event and datagram channels
/// 2. Spawns the socket reader
/// 3. Spawns the [`EngineActor`]
/// 4. Spawns the watchdog ticker
///
/// Cancelling `cancel` stops every task; the actor closes all gateways
/// before its task completes.
///
/// # Example
///
/// ```no_run
/// use lightsd::actor::spawn_engine;
/// use lightsd::config::EngineConfig;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() -> std::io::Result<()> {
/// let config = EngineConfig::default();
/// let socket = lightsd::transport::bind(config.listen).await?;
/// let (handle, _task) = spawn_engine(config, socket, CancellationToken::new());
/// handle.power_on(&["*"]).await.ok();
/// # Ok(())
/// # }
/// ```
pub fn spawn_engine(
    config: EngineConfig,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
) -> (EngineHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
    let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_BUFFER);

    transport::spawn_reader(Arc::clone(&socket), datagram_tx, cancel.clone());

    let watchdog_interval = Duration::from_millis(config.watchdog_interval_ms.max(1));
    let actor = EngineActor::new(
        Engine::new(config),
        socket,
        cmd_rx,
        datagram_rx,
        event_tx.clone(),
        cancel.clone(),
    );
    let task = tokio::spawn(actor.run());

    let handle = EngineHandle::new(cmd_tx.clone(), event_tx);

    spawn_watchdog_task(cmd_tx, watchdog_interval, cancel);

    (handle, task)
}

/// Spawns the task that periodically asks the actor for a liveness sweep.
fn spawn_watchdog_task(
    sender: mpsc::Sender<EngineCommand>,
    every: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Fire-and-forget
            if sender.send(EngineCommand::WatchdogSweep).await.is_err() {
                debug!("watchdog task stopping: engine channel closed");
                break;
            }
        }
    });
}
