/*!
 * Control logic.
 *
 * Turns the current inputs (temperatures, overrides, modes) and the tuning
 * into the values the controller writes to the boiler. Everything here is
 * pure: the same inputs and settings always give the same [`ControlState`].
 */
use std::fmt;

use opentherm_core::config::{
    CompensationMode, Config, DhwConfig, DhwMode, EquithermConfig, LimitsConfig,
};
use opentherm_wire::MasterStatus;

/// Outdoor temperature assumed while no reading is available
pub const FALLBACK_OUTDOOR_TEMP: f64 = 10.0;

/// Indoor temperature assumed while no reading is available
pub const FALLBACK_INDOOR_TEMP: f64 = 21.0;

/// Lowest DHW setpoint written to the boiler
pub const MIN_DHW_TEMP: f64 = 35.0;

/// Highest DHW setpoint written to the boiler
pub const MAX_DHW_TEMP: f64 = 65.0;

/// What the boiler is being asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// No heat demand
    Idle,
    /// Space heating on the equitherm curve
    Heating,
    /// Hot water only
    Dhw,
    /// Fixed safe setpoint
    Emergency,
    /// Forced maximum heating
    Forced,
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Idle => write!(f, "idle"),
            OperatingMode::Heating => write!(f, "heating"),
            OperatingMode::Dhw => write!(f, "dhw"),
            OperatingMode::Emergency => write!(f, "emergency"),
            OperatingMode::Forced => write!(f, "forced"),
        }
    }
}

/// User overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Run at the emergency setpoint
    pub emergency: bool,
    /// Heat at the maximum flow temperature
    pub force_heat: bool,
    /// Heat hot water at the maximum DHW temperature
    pub force_dhw: bool,
}

/// Everything the control logic reacts to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlInputs {
    /// Outdoor temperature from the weather source
    pub outdoor_temp: Option<f64>,
    /// Measured indoor temperature
    pub indoor_temp: Option<f64>,
    /// Indoor target temperature
    pub target_temp: f64,
    /// Whether space heating is enabled
    pub heating_enabled: bool,
    /// Whether the boiler reports hot water activity
    pub boiler_dhw_active: bool,
    /// Active overrides
    pub overrides: Overrides,
    /// Hot water mode
    pub dhw_mode: DhwMode,
}

impl ControlInputs {
    /// Start-up inputs from configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            outdoor_temp: None,
            indoor_temp: None,
            target_temp: config.heating.target_indoor,
            heating_enabled: config.heating.enabled,
            boiler_dhw_active: false,
            overrides: Overrides::default(),
            dhw_mode: config.dhw.mode,
        }
    }
}

/// Tuning the control logic works with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlSettings {
    /// Curve parameters
    pub equitherm: EquithermConfig,
    /// Setpoint limits
    pub limits: LimitsConfig,
    /// Who computes the flow temperature
    pub compensation: CompensationMode,
    /// Hot water temperatures
    pub dhw: DhwConfig,
}

impl From<&Config> for ControlSettings {
    fn from(config: &Config) -> Self {
        Self {
            equitherm: config.equitherm,
            limits: config.limits,
            compensation: config.heating.compensation,
            dhw: config.dhw,
        }
    }
}

/// Values to write to the boiler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlState {
    /// Flow temperature setpoint
    pub setpoint: f64,
    /// Operating mode
    pub mode: OperatingMode,
    /// Overrides the state was computed with
    pub overrides: Overrides,
    /// Central heating enable flag
    pub ch_enable: bool,
    /// Hot water enable flag
    pub dhw_enable: bool,
    /// Hot water setpoint, `None` while hot water is off
    pub dhw_setpoint: Option<f64>,
    /// Maximum modulation to write, `None` to leave the boiler alone
    pub max_modulation: Option<f64>,
    /// Whether the flow setpoint goes to the boiler
    pub write_setpoint: bool,
    /// Room setpoint for the boiler's own curve
    pub room_setpoint: Option<f64>,
    /// Room temperature for the boiler's own curve
    pub room_temp: Option<f64>,
    /// Outdoor temperature for the boiler's own curve
    pub outdoor_temp: Option<f64>,
}

impl ControlState {
    /// Master flags for the status exchange
    pub fn master_status(&self) -> MasterStatus {
        MasterStatus {
            ch_enable: self.ch_enable,
            dhw_enable: self.dhw_enable,
            otc_active: self.room_setpoint.is_some(),
            ..MasterStatus::default()
        }
    }
}

/// Unclamped equitherm flow temperature
///
/// `n * (target + k - outdoor) + t + feedback_gain * (target - indoor)`,
/// with [`FALLBACK_OUTDOOR_TEMP`] and [`FALLBACK_INDOOR_TEMP`] standing in for
/// missing readings.
pub fn equitherm(
    outdoor: Option<f64>,
    indoor: Option<f64>,
    target: f64,
    params: &EquithermConfig,
) -> f64 {
    let outdoor = outdoor.unwrap_or(FALLBACK_OUTDOOR_TEMP);
    let indoor = indoor.unwrap_or(FALLBACK_INDOOR_TEMP);
    params.n * (target + params.k - outdoor) + params.t + params.feedback_gain * (target - indoor)
}

/// Clamp a flow temperature to the configured heating range
pub fn clamp_setpoint(setpoint: f64, limits: &LimitsConfig) -> f64 {
    setpoint.clamp(limits.min_setpoint, limits.max_boiler_temp_heating)
}

/// Hot water setpoint for a mode, `None` when hot water is off
pub fn dhw_setpoint(mode: DhwMode, settings: &ControlSettings) -> Option<f64> {
    let requested = match mode {
        DhwMode::Off => return None,
        DhwMode::Eco => settings.dhw.eco_temp,
        DhwMode::Heat => settings.dhw.normal_temp,
    };
    Some(
        requested
            .clamp(MIN_DHW_TEMP, MAX_DHW_TEMP)
            .min(settings.limits.max_dhw_temp),
    )
}

/// Compute what to ask of the boiler
pub fn compute(inputs: &ControlInputs, settings: &ControlSettings) -> ControlState {
    let limits = &settings.limits;
    let overrides = inputs.overrides;
    let curve = clamp_setpoint(
        equitherm(
            inputs.outdoor_temp,
            inputs.indoor_temp,
            inputs.target_temp,
            &settings.equitherm,
        ),
        limits,
    );

    let mut dhw_setpoint = dhw_setpoint(inputs.dhw_mode, settings);
    if overrides.force_dhw {
        dhw_setpoint = Some(limits.max_dhw_temp);
    }
    let dhw_enable = dhw_setpoint.is_some();
    let max_modulation = Some(limits.max_modulation);

    let (mode, setpoint, ch_enable, max_modulation) = if overrides.emergency {
        (OperatingMode::Emergency, limits.emergency_setpoint, true, None)
    } else if overrides.force_heat {
        (
            OperatingMode::Forced,
            limits.max_boiler_temp_heating,
            true,
            max_modulation,
        )
    } else if overrides.force_dhw {
        let (setpoint, ch_enable) = if inputs.heating_enabled {
            (curve, true)
        } else {
            (limits.min_setpoint, false)
        };
        (OperatingMode::Dhw, setpoint, ch_enable, max_modulation)
    } else if inputs.heating_enabled {
        (OperatingMode::Heating, curve, true, max_modulation)
    } else if inputs.boiler_dhw_active {
        (OperatingMode::Dhw, limits.min_setpoint, false, max_modulation)
    } else {
        (OperatingMode::Idle, limits.min_setpoint, false, max_modulation)
    };

    // Hot water draws cap every flow target at the DHW limit
    let setpoint = if inputs.boiler_dhw_active {
        setpoint.min(limits.max_dhw_temp)
    } else {
        setpoint
    };

    let boiler_curve = settings.compensation == CompensationMode::Boiler
        && matches!(
            mode,
            OperatingMode::Heating | OperatingMode::Dhw | OperatingMode::Idle
        );

    ControlState {
        setpoint,
        mode,
        overrides,
        ch_enable,
        dhw_enable,
        dhw_setpoint,
        max_modulation,
        write_setpoint: !boiler_curve,
        room_setpoint: boiler_curve.then_some(inputs.target_temp),
        room_temp: if boiler_curve { inputs.indoor_temp } else { None },
        outdoor_temp: if boiler_curve { inputs.outdoor_temp } else { None },
    }
}
