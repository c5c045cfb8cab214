//! lightsd - LAN daemon for LIFX-style smart bulbs
//!
//! This crate holds the device protocol engine:
//! - `discovery` - broadcast scheduling while gateways are looked for
//! - `gateway` - per-gateway sessions with a bounded packet ring
//! - `bulb` - bulb state and hardware info
//! - `tagging` - tag labels and their per-gateway ids
//! - `router` - target resolution and packet fan-out
//! - `commands` - the command API (power, color, waveform, tags)
//! - `watchdog` - liveness sweep
//! - `actor` - the tokio task owning the engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       lightsd daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  EngineHandle   │────▶│        EngineActor          │    │
//! │  │ (command API)   │     │   (owns the Engine state)   │    │
//! │  └─────────────────┘     └──────────────┬──────────────┘    │
//! │                                         │                   │
//! │            ┌────────────────────────────┼──────────┐        │
//! │            ▼                            ▼          ▼        │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────┐  │
//! │  │ Gateway (ring)  │  │  BulbRegistry   │  │ TagRegistry │  │
//! │  └────────┬────────┘  └─────────────────┘  └─────────────┘  │
//! │           │ UDP                                             │
//! └───────────┼─────────────────────────────────────────────────┘
//!             ▼
//!       gateways on the LAN
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod actor;
pub mod bulb;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod event;
pub mod gateway;
pub mod router;
pub mod tagging;
pub mod transport;
pub mod watchdog;

pub use actor::{spawn_engine, EngineError, EngineHandle};
pub use bulb::BulbView;
pub use commands::{CommandError, WaveformParams};
pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;
pub use event::{CloseReason, EngineEvent};
pub use tagging::TagView;
