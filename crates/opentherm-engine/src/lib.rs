/*!
 * OpenTherm Engine
 *
 * This crate provides the application side of the OpenTherm driver: poll
 * scheduling, the equitherm control logic, boiler diagnostics, entity
 * bindings and the controller task tying them to the protocol master.
 */

#![warn(missing_docs)]

// Re-export core types
pub use opentherm_core::prelude;

pub mod control;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod scheduler;
pub mod sinks;

// Re-export main types for convenience
pub use control::{compute, ControlInputs, ControlSettings, ControlState, OperatingMode, Overrides};
pub use controller::{Command, ControlHandle, OpenThermController};
pub use diagnostics::Diagnostics;
pub use error::{Error, Result};
pub use scheduler::{CycleReport, PollEntry, PollScheduler, Request};
pub use sinks::{
    BinarySensorKind, BinarySensorSink, Bindings, MemorySink, NumberSink, NumberTarget, Override,
    SensorKind, SensorSink, SwitchSink, TextSensorSink,
};

/// OpenTherm engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
