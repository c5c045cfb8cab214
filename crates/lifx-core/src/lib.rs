//! lifx-core - Shared domain types for the lightsd engine
//!
//! This crate provides the value types shared between the wire protocol
//! (`lifx-protocol`) and the engine (`lightsd`): hardware addresses, site
//! identifiers, tag ids and masks, bulb labels and light state.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or unchecked indexing.

pub mod addr;
pub mod error;
pub mod light;
pub mod tags;

// Re-exports for convenience
pub use addr::{DeviceAddr, SiteId, ADDR_LENGTH};
pub use error::{DomainError, DomainResult};
pub use light::{Hsbk, Label, LightState, PowerLevel, KELVIN_RANGE, LABEL_SIZE};
pub use tags::{TagId, TagMask, MAX_TAGS};

/// Monotonic timestamp in milliseconds.
///
/// The engine never reads the clock itself; every entry point receives the
/// current time so that state transitions are deterministic under test.
pub type Millis = u64;
