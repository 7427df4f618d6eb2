/*!
 * Error types for the OpenTherm wire crate.
 */
use thiserror::Error;

use crate::data::DataId;

/// A frame rejected by the codec
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The parity bit does not make the frame even
    #[error("Parity error in frame 0x{0:08X}")]
    Parity(u32),

    /// Start bit, stop bit or reserved bits are wrong
    #[error("Framing error: {0}")]
    Framing(FramingFault),
}

/// What exactly was wrong with the frame layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingFault {
    /// The leading bit on the wire was not `1`
    StartBit,
    /// The trailing bit on the wire was not `1`
    StopBit,
    /// Bits outside the 34-bit wire window were set
    Overlong,
    /// The spare nibble of the frame was not zero
    SpareBits(u8),
}

impl std::fmt::Display for FramingFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingFault::StartBit => write!(f, "missing start bit"),
            FramingFault::StopBit => write!(f, "missing stop bit"),
            FramingFault::Overlong => write!(f, "bits beyond the frame window"),
            FramingFault::SpareBits(bits) => write!(f, "spare bits set: 0b{:04b}", bits),
        }
    }
}

/// Bit-level transceiver error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// No start bit arrived before the deadline
    #[error("No frame received before the deadline")]
    FrameTimeout,

    /// A bit cell had no mid-bit transition
    #[error("Signal error at bit {bit}")]
    Signal {
        /// Index of the offending bit cell, 0 is the start bit
        bit: u8,
    },

    /// The GPIO driver reported an error
    #[error("Pin error: {0}")]
    Pin(String),
}

/// Why a received frame was not accepted as the response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidResponse {
    /// The bits did not form a valid frame
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The line did not carry Manchester-coded bits
    #[error("signal error at bit {0}")]
    Signal(u8),

    /// The response carried a master-to-slave message type
    #[error("unexpected message type {0:?}")]
    MessageType(crate::data::MsgType),

    /// The response answered a different data-ID
    #[error("response for data-ID {got} while {expected} was requested")]
    DataIdMismatch {
        /// Requested data-ID
        expected: DataId,
        /// Data-ID carried by the response
        got: DataId,
    },
}

/// Failure of a single request/response exchange
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// No response before the receive timeout
    #[error("Timeout waiting for response to data-ID {0}")]
    TimeoutExceeded(DataId),

    /// A response arrived but could not be trusted
    #[error("Invalid response to data-ID {data_id}: {reason}")]
    InvalidResponse {
        /// Requested data-ID
        data_id: DataId,
        /// What was wrong
        reason: InvalidResponse,
    },

    /// The request could not be put on the wire
    #[error("Failed to transmit request for data-ID {data_id}: {source}")]
    Transmit {
        /// Requested data-ID
        data_id: DataId,
        /// Underlying transceiver error
        source: WireError,
    },
}

impl ProtocolError {
    /// The data-ID of the failed request
    pub fn data_id(&self) -> DataId {
        match self {
            ProtocolError::TimeoutExceeded(id) => *id,
            ProtocolError::InvalidResponse { data_id, .. } => *data_id,
            ProtocolError::Transmit { data_id, .. } => *data_id,
        }
    }

    /// Whether the exchange failed because nothing came back in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::TimeoutExceeded(_))
    }
}

/// Result type for wire operations
pub type Result<T> = std::result::Result<T, WireError>;
