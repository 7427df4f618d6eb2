/*!
 * Boiler diagnostics and communication health.
 */
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use opentherm_wire::data::split_bytes;
use opentherm_wire::{FaultFlags, SlaveStatus};

/// Decoded status, fault flags and link health
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    slave: Option<SlaveStatus>,
    faults: Option<FaultFlags>,
    comms_ok: bool,
    last_success: Option<DateTime<Utc>>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    /// Create with nothing known yet
    pub fn new() -> Self {
        Self {
            slave: None,
            faults: None,
            comms_ok: true,
            last_success: None,
        }
    }

    /// Slave flags from the last status response
    pub fn slave_status(&self) -> Option<SlaveStatus> {
        self.slave
    }

    /// Fault flags from the last ID 5 response
    pub fn faults(&self) -> Option<FaultFlags> {
        self.faults
    }

    /// Whether the boiler is answering
    pub fn comms_ok(&self) -> bool {
        self.comms_ok
    }

    /// When the last exchange succeeded
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    /// Take in a status data-value, `None` when the status is unknown
    pub fn update_status(&mut self, value: Option<u16>) {
        self.slave = value.map(|value| SlaveStatus::from_byte(split_bytes(value).1));
    }

    /// Take in an ID 5 data-value, `None` when the flags are unknown
    pub fn update_faults(&mut self, value: Option<u16>) {
        let faults = value.map(FaultFlags::from_value);
        if let Some(flags) = faults.filter(FaultFlags::any) {
            if self.faults != faults {
                warn!(faults = %flags, "Boiler reports faults");
            }
        }
        self.faults = faults;
    }

    /// Record the link state after a cycle and return true when it changed
    pub fn update_comms(&mut self, degraded: bool, any_success: bool) -> bool {
        if any_success {
            self.last_success = Some(Utc::now());
        }
        let ok = !degraded;
        if ok == self.comms_ok {
            return false;
        }
        self.comms_ok = ok;
        if ok {
            info!("Boiler communication restored");
        } else {
            warn!("Boiler communication lost");
            self.slave = None;
            self.faults = None;
        }
        true
    }

    /// Whether the boiler reports a fault, either in the status or ID 5
    pub fn fault_active(&self) -> Option<bool> {
        match (self.slave, self.faults) {
            (None, None) => None,
            (slave, faults) => Some(
                slave.map_or(false, |s| s.fault) || faults.map_or(false, |f| f.any()),
            ),
        }
    }

    /// Human readable fault summary
    pub fn fault_text(&self) -> Option<String> {
        self.faults.map(|flags| flags.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_decoding() {
        let mut diagnostics = Diagnostics::new();
        assert_eq!(diagnostics.fault_active(), None);

        // Master flags in the high byte are ignored
        diagnostics.update_status(Some(0x030A));
        let slave = diagnostics.slave_status().unwrap();
        assert!(slave.ch_active);
        assert!(slave.flame);
        assert!(!slave.fault);
        assert!(!slave.dhw_active);
        assert_eq!(diagnostics.fault_active(), Some(false));

        diagnostics.update_status(Some(0x0041));
        let slave = diagnostics.slave_status().unwrap();
        assert!(slave.fault);
        assert!(slave.diagnostic);
        assert_eq!(diagnostics.fault_active(), Some(true));
    }

    #[test]
    fn test_fault_text() {
        let mut diagnostics = Diagnostics::new();
        assert_eq!(diagnostics.fault_text(), None);

        diagnostics.update_faults(Some(0));
        assert_eq!(diagnostics.fault_text().as_deref(), Some("No faults"));
        assert_eq!(diagnostics.fault_active(), Some(false));

        diagnostics.update_faults(Some(0x0400));
        assert!(diagnostics.faults().unwrap().low_water_pressure);
        assert_eq!(diagnostics.fault_active(), Some(true));
    }

    #[test]
    fn test_comms_transitions() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.update_status(Some(0x0002));

        assert!(!diagnostics.update_comms(false, true));
        assert!(diagnostics.last_success().is_some());

        assert!(diagnostics.update_comms(true, false));
        assert!(!diagnostics.comms_ok());
        assert_eq!(diagnostics.slave_status(), None);

        // Reported once
        assert!(!diagnostics.update_comms(true, false));

        assert!(diagnostics.update_comms(false, true));
        assert!(diagnostics.comms_ok());
    }
}
