//! # Instrument
//!
//! Time-tagging instrument boundary.
//!
//! Responsibilities:
//! - Define the `InstrumentClient` trait the coordinator drives (connect / configure / start / stop)
//! - Provide `MockInstrument`, which streams seeded timestamp blocks to the channel listeners
//!
//! Real hardware drivers implement `InstrumentClient` outside this workspace.

pub mod client;
pub mod error;
pub mod mock;

pub use client::{AcquisitionPlan, InstrumentClient};
pub use error::{InstrumentError, Result};
pub use mock::{MockFaults, MockInstrument};
