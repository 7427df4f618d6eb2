/*!
 * OpenTherm message types, data-IDs and value encodings.
 *
 * Only the standard data-IDs of the OpenTherm v2.2 protocol that the driver
 * uses are listed here.
 */
use std::fmt;

/// Message type carried in bits 30..28 of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Master asks for a value
    ReadData,
    /// Master writes a value
    WriteData,
    /// Master forwards an invalid value
    InvalidData,
    /// Reserved code 3
    Reserved,
    /// Slave answers a read
    ReadAck,
    /// Slave acknowledges a write
    WriteAck,
    /// Slave cannot provide a valid value
    DataInvalid,
    /// Slave does not know the data-ID
    UnknownDataId,
}

impl MsgType {
    /// Build from the 3-bit code
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0 => MsgType::ReadData,
            1 => MsgType::WriteData,
            2 => MsgType::InvalidData,
            3 => MsgType::Reserved,
            4 => MsgType::ReadAck,
            5 => MsgType::WriteAck,
            6 => MsgType::DataInvalid,
            _ => MsgType::UnknownDataId,
        }
    }

    /// The 3-bit code
    pub const fn bits(self) -> u8 {
        match self {
            MsgType::ReadData => 0,
            MsgType::WriteData => 1,
            MsgType::InvalidData => 2,
            MsgType::Reserved => 3,
            MsgType::ReadAck => 4,
            MsgType::WriteAck => 5,
            MsgType::DataInvalid => 6,
            MsgType::UnknownDataId => 7,
        }
    }

    /// Whether the message type is sent by the slave
    pub const fn is_slave_to_master(self) -> bool {
        self.bits() >= 4
    }
}

/// How the 16-bit data-value of an ID is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Two flag bytes
    Flags,
    /// Signed fixed point, 1/256 resolution
    F88,
    /// Flag byte plus an unsigned byte
    FlagsU8,
}

/// Access direction of an ID from the master's side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read only
    Read,
    /// Write only
    Write,
    /// Read and write
    ReadWrite,
}

/// OpenTherm data-ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataId(pub u8);

impl DataId {
    /// Master and slave status flags
    pub const STATUS: DataId = DataId(0);
    /// Control setpoint (CH water temperature setpoint)
    pub const CONTROL_SETPOINT: DataId = DataId(1);
    /// Application-specific fault flags and OEM fault code
    pub const FAULT_FLAGS: DataId = DataId(5);
    /// Maximum relative modulation level setting
    pub const MAX_REL_MODULATION: DataId = DataId(14);
    /// Room setpoint
    pub const ROOM_SETPOINT: DataId = DataId(16);
    /// Relative modulation level
    pub const REL_MODULATION: DataId = DataId(17);
    /// CH water pressure
    pub const CH_PRESSURE: DataId = DataId(18);
    /// DHW flow rate
    pub const DHW_FLOW_RATE: DataId = DataId(19);
    /// Room temperature
    pub const ROOM_TEMP: DataId = DataId(24);
    /// Boiler flow water temperature
    pub const BOILER_TEMP: DataId = DataId(25);
    /// DHW temperature
    pub const DHW_TEMP: DataId = DataId(26);
    /// Outside temperature
    pub const OUTSIDE_TEMP: DataId = DataId(27);
    /// Return water temperature
    pub const RETURN_TEMP: DataId = DataId(28);
    /// DHW setpoint
    pub const DHW_SETPOINT: DataId = DataId(56);
    /// Max CH water setpoint
    pub const MAX_CH_SETPOINT: DataId = DataId(57);

    /// Every data-ID the driver knows
    pub const KNOWN: [DataId; 15] = [
        DataId::STATUS,
        DataId::CONTROL_SETPOINT,
        DataId::FAULT_FLAGS,
        DataId::MAX_REL_MODULATION,
        DataId::ROOM_SETPOINT,
        DataId::REL_MODULATION,
        DataId::CH_PRESSURE,
        DataId::DHW_FLOW_RATE,
        DataId::ROOM_TEMP,
        DataId::BOILER_TEMP,
        DataId::DHW_TEMP,
        DataId::OUTSIDE_TEMP,
        DataId::RETURN_TEMP,
        DataId::DHW_SETPOINT,
        DataId::MAX_CH_SETPOINT,
    ];

    /// Raw ID byte
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Whether this is one of the standard IDs listed above
    pub fn is_known(self) -> bool {
        Self::KNOWN.contains(&self)
    }

    /// Short human readable name
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "status",
            1 => "control_setpoint",
            5 => "fault_flags",
            14 => "max_rel_modulation",
            16 => "room_setpoint",
            17 => "rel_modulation",
            18 => "ch_pressure",
            19 => "dhw_flow_rate",
            24 => "room_temp",
            25 => "boiler_temp",
            26 => "dhw_temp",
            27 => "outside_temp",
            28 => "return_temp",
            56 => "dhw_setpoint",
            57 => "max_ch_setpoint",
            _ => "unknown",
        }
    }

    /// Value encoding, `None` for unknown IDs
    pub fn kind(self) -> Option<DataKind> {
        match self.0 {
            0 => Some(DataKind::Flags),
            5 => Some(DataKind::FlagsU8),
            1 | 14 | 16..=19 | 24..=28 | 56 | 57 => Some(DataKind::F88),
            _ => None,
        }
    }

    /// Access direction, `None` for unknown IDs
    pub fn access(self) -> Option<Access> {
        match self.0 {
            0 | 5 | 17 | 18 | 19 | 25 | 26 | 28 => Some(Access::Read),
            1 | 14 | 16 | 24 => Some(Access::Write),
            27 | 56 | 57 => Some(Access::ReadWrite),
            _ => None,
        }
    }

    /// Whether the master may poll this ID with Read-Data
    pub fn is_readable(self) -> bool {
        matches!(self.access(), Some(Access::Read | Access::ReadWrite))
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

impl From<u8> for DataId {
    fn from(id: u8) -> Self {
        DataId(id)
    }
}

/// Decode a signed 8.8 fixed point value
pub fn f88_to_f64(raw: u16) -> f64 {
    f64::from(raw as i16) / 256.0
}

/// Encode a value as signed 8.8 fixed point, rounding to the nearest 1/256
/// and saturating at the representable range.
pub fn f64_to_f88(value: f64) -> u16 {
    let scaled = (value * 256.0).round();
    let clamped = scaled.clamp(f64::from(i16::MIN), f64::from(i16::MAX));
    (clamped as i16) as u16
}

/// Split a data-value into its high and low byte
pub const fn split_bytes(raw: u16) -> (u8, u8) {
    ((raw >> 8) as u8, (raw & 0xFF) as u8)
}

/// Join a high and low byte into a data-value
pub const fn join_bytes(high: u8, low: u8) -> u16 {
    ((high as u16) << 8) | low as u16
}

/// Master status flags sent in the high byte of ID 0
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MasterStatus {
    /// Central heating enable
    pub ch_enable: bool,
    /// Domestic hot water enable
    pub dhw_enable: bool,
    /// Cooling enable
    pub cooling_enable: bool,
    /// Outside temperature compensation active
    pub otc_active: bool,
    /// Second CH circuit enable
    pub ch2_enable: bool,
}

impl MasterStatus {
    /// Encode as the status high byte
    pub fn to_byte(self) -> u8 {
        u8::from(self.ch_enable)
            | u8::from(self.dhw_enable) << 1
            | u8::from(self.cooling_enable) << 2
            | u8::from(self.otc_active) << 3
            | u8::from(self.ch2_enable) << 4
    }

    /// Decode from the status high byte
    pub fn from_byte(byte: u8) -> Self {
        Self {
            ch_enable: byte & 0x01 != 0,
            dhw_enable: byte & 0x02 != 0,
            cooling_enable: byte & 0x04 != 0,
            otc_active: byte & 0x08 != 0,
            ch2_enable: byte & 0x10 != 0,
        }
    }

    /// The full ID 0 request value; the slave byte is zero
    pub fn to_request_value(self) -> u16 {
        join_bytes(self.to_byte(), 0)
    }
}

/// Slave status flags returned in the low byte of ID 0
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlaveStatus {
    /// Fault indication
    pub fault: bool,
    /// Central heating active
    pub ch_active: bool,
    /// Hot water active
    pub dhw_active: bool,
    /// Flame on
    pub flame: bool,
    /// Cooling active
    pub cooling: bool,
    /// Second CH circuit active
    pub ch2_active: bool,
    /// Diagnostic indication
    pub diagnostic: bool,
}

impl SlaveStatus {
    /// Decode from the status low byte
    pub fn from_byte(byte: u8) -> Self {
        Self {
            fault: byte & 0x01 != 0,
            ch_active: byte & 0x02 != 0,
            dhw_active: byte & 0x04 != 0,
            flame: byte & 0x08 != 0,
            cooling: byte & 0x10 != 0,
            ch2_active: byte & 0x20 != 0,
            diagnostic: byte & 0x40 != 0,
        }
    }

    /// Encode as the status low byte
    pub fn to_byte(self) -> u8 {
        u8::from(self.fault)
            | u8::from(self.ch_active) << 1
            | u8::from(self.dhw_active) << 2
            | u8::from(self.flame) << 3
            | u8::from(self.cooling) << 4
            | u8::from(self.ch2_active) << 5
            | u8::from(self.diagnostic) << 6
    }
}

/// Application-specific fault flags (ID 5 high byte) and OEM fault code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultFlags {
    /// Service request
    pub service_request: bool,
    /// Lockout reset possible
    pub lockout_reset: bool,
    /// Low water pressure
    pub low_water_pressure: bool,
    /// Gas or flame fault
    pub gas_flame_fault: bool,
    /// Air pressure fault
    pub air_pressure_fault: bool,
    /// Water over-temperature
    pub water_over_temp: bool,
    /// Vendor fault code
    pub oem_code: u8,
}

impl FaultFlags {
    /// Decode an ID 5 data-value
    pub fn from_value(raw: u16) -> Self {
        let (flags, oem_code) = split_bytes(raw);
        Self {
            service_request: flags & 0x01 != 0,
            lockout_reset: flags & 0x02 != 0,
            low_water_pressure: flags & 0x04 != 0,
            gas_flame_fault: flags & 0x08 != 0,
            air_pressure_fault: flags & 0x10 != 0,
            water_over_temp: flags & 0x20 != 0,
            oem_code,
        }
    }

    /// Whether any flag or a vendor code is set
    pub fn any(&self) -> bool {
        !self.descriptions().is_empty() || self.oem_code != 0
    }

    /// Names of the raised flags
    pub fn descriptions(&self) -> Vec<&'static str> {
        let mut faults = Vec::new();
        if self.service_request {
            faults.push("Service Required");
        }
        if self.lockout_reset {
            faults.push("Lockout Active");
        }
        if self.low_water_pressure {
            faults.push("Low Water Pressure");
        }
        if self.gas_flame_fault {
            faults.push("Gas/Flame Fault");
        }
        if self.air_pressure_fault {
            faults.push("Air Pressure Fault");
        }
        if self.water_over_temp {
            faults.push("Water Over-Temperature");
        }
        faults
    }
}

impl fmt::Display for FaultFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let faults = self.descriptions();
        match (faults.is_empty(), self.oem_code) {
            (true, 0) => write!(f, "No faults"),
            (true, code) => write!(f, "OEM fault code {}", code),
            (false, 0) => write!(f, "{}", faults.join(", ")),
            (false, code) => write!(f, "{} (OEM code {})", faults.join(", "), code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_codes() {
        for bits in 0..8u8 {
            assert_eq!(MsgType::from_bits(bits).bits(), bits);
        }
        assert!(MsgType::ReadAck.is_slave_to_master());
        assert!(!MsgType::WriteData.is_slave_to_master());
    }

    #[test]
    fn test_f88_conversion() {
        assert_eq!(f88_to_f64(0x3A80), 58.5);
        assert_eq!(f88_to_f64(0xFB00), -5.0);
        assert_eq!(f64_to_f88(58.5), 0x3A80);
        assert_eq!(f64_to_f88(-5.0), 0xFB00);
        assert_eq!(f64_to_f88(1000.0), 0x7FFF);
        assert_eq!(f64_to_f88(-1000.0), 0x8000);
    }

    #[test]
    fn test_data_id_table() {
        assert!(DataId::BOILER_TEMP.is_readable());
        assert!(DataId::DHW_SETPOINT.is_readable());
        assert!(!DataId::CONTROL_SETPOINT.is_readable());
        assert_eq!(DataId::OUTSIDE_TEMP.access(), Some(Access::ReadWrite));
        assert!(!DataId(3).is_known());
        assert_eq!(DataId(3).kind(), None);
        assert_eq!(DataId::RETURN_TEMP.kind(), Some(DataKind::F88));
        assert_eq!(DataId::BOILER_TEMP.to_string(), "25 (boiler_temp)");
        for id in DataId::KNOWN {
            assert!(id.kind().is_some(), "{} has no kind", id);
            assert!(id.access().is_some(), "{} has no access", id);
        }
    }

    #[test]
    fn test_status_flags() {
        let master = MasterStatus {
            ch_enable: true,
            dhw_enable: true,
            ..Default::default()
        };
        assert_eq!(master.to_request_value(), 0x0300);
        assert_eq!(MasterStatus::from_byte(0x03), master);

        let slave = SlaveStatus::from_byte(0x0A);
        assert!(slave.ch_active);
        assert!(slave.flame);
        assert!(!slave.fault);
        assert_eq!(slave.to_byte(), 0x0A);
    }

    #[test]
    fn test_fault_flags() {
        let none = FaultFlags::from_value(0);
        assert!(!none.any());
        assert_eq!(none.to_string(), "No faults");

        let faults = FaultFlags::from_value(0x0C2A);
        assert!(faults.low_water_pressure);
        assert!(faults.gas_flame_fault);
        assert_eq!(faults.oem_code, 0x2A);
        assert_eq!(
            faults.to_string(),
            "Low Water Pressure, Gas/Flame Fault (OEM code 42)"
        );
    }
}
