/*!
 * OpenTherm frame codec.
 *
 * A frame is a 32-bit word: parity (bit 31), message type (30..28), spare
 * (27..24, zero), data-ID (23..16) and data-value (15..0). On the wire it is
 * wrapped by a start bit and a stop bit, both `1`.
 */
use std::fmt;

use crate::data::{DataId, MsgType};
use crate::error::{DecodeError, FramingFault};

/// Number of bit cells on the wire: start bit, 32 frame bits, stop bit
pub const WIRE_BITS: u32 = 34;

const PARITY_BIT: u32 = 1 << 31;
const SPARE_MASK: u32 = 0x0F00_0000;
const WIRE_MASK: u64 = (1 << WIRE_BITS) - 1;

/// A parity-checked 32-bit OpenTherm frame
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame(u32);

impl Frame {
    /// Validate a raw 32-bit word
    pub fn from_raw(raw: u32) -> Result<Self, DecodeError> {
        let spare = ((raw & SPARE_MASK) >> 24) as u8;
        if spare != 0 {
            return Err(DecodeError::Framing(FramingFault::SpareBits(spare)));
        }
        if raw.count_ones() % 2 != 0 {
            return Err(DecodeError::Parity(raw));
        }
        Ok(Frame(raw))
    }

    /// The raw 32-bit word
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Message type
    pub const fn msg_type(self) -> MsgType {
        MsgType::from_bits((self.0 >> 28) as u8)
    }

    /// Data-ID
    pub const fn data_id(self) -> DataId {
        DataId((self.0 >> 16) as u8)
    }

    /// Data-value
    pub const fn value(self) -> u16 {
        self.0 as u16
    }

    /// The frame split into its fields
    pub const fn parts(self) -> (MsgType, DataId, u16) {
        (self.msg_type(), self.data_id(), self.value())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame(0x{:08X} {:?} id={} value=0x{:04X})",
            self.0,
            self.msg_type(),
            self.data_id().value(),
            self.value()
        )
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// The 34-bit sequence of a framed message, first bit on the wire in bit 33
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WireBits(pub u64);

impl WireBits {
    /// Bit at wire position `index`, 0 being the start bit
    pub fn bit(self, index: u32) -> bool {
        debug_assert!(index < WIRE_BITS);
        (self.0 >> (WIRE_BITS - 1 - index)) & 1 == 1
    }
}

/// Assemble a frame and compute its parity
pub fn encode(msg_type: MsgType, data_id: DataId, value: u16) -> Frame {
    let mut raw = u32::from(msg_type.bits()) << 28
        | u32::from(data_id.value()) << 16
        | u32::from(value);
    if raw.count_ones() % 2 != 0 {
        raw |= PARITY_BIT;
    }
    Frame(raw)
}

/// Wrap a frame with its start and stop bits
pub fn to_wire(frame: Frame) -> WireBits {
    WireBits(1u64 << (WIRE_BITS - 1) | u64::from(frame.raw()) << 1 | 1)
}

/// Check the start and stop markers and the frame itself
pub fn decode(bits: WireBits) -> Result<Frame, DecodeError> {
    if bits.0 & !WIRE_MASK != 0 {
        return Err(DecodeError::Framing(FramingFault::Overlong));
    }
    if !bits.bit(0) {
        return Err(DecodeError::Framing(FramingFault::StartBit));
    }
    if !bits.bit(WIRE_BITS - 1) {
        return Err(DecodeError::Framing(FramingFault::StopBit));
    }
    Frame::from_raw((bits.0 >> 1) as u32)
}
