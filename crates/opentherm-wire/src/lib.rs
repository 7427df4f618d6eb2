/*!
 * OpenTherm Wire
 *
 * This crate provides the protocol side of the OpenTherm driver: the frame
 * codec, the Manchester bit-level transceiver, the master request/response
 * state machine and a simulated boiler.
 */

#![warn(missing_docs)]

// Re-export core types
pub use opentherm_core::prelude;

pub mod codec;
pub mod data;
pub mod error;
pub mod master;
pub mod sim;
pub mod transceiver;

pub use codec::{decode, encode, to_wire, Frame, WireBits};
pub use data::{DataId, FaultFlags, MasterStatus, MsgType, SlaveStatus};
pub use error::{DecodeError, InvalidResponse, ProtocolError, WireError};
pub use master::{DataPoint, DataPointCache, MasterOptions, MasterState, OpenThermMaster};
pub use sim::SimulatedBoiler;
pub use transceiver::{BitClock, ManchesterTransceiver, SpinClock, Transceiver};

/// OpenTherm wire crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
