/*!
 * Entity bindings.
 *
 * The controller pushes snapshots into sinks supplied by the host: sensors,
 * binary sensors, a fault text sensor, numbers and switches. A sink is only
 * ever written by the controller task.
 */
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use opentherm_core::config::{Config, DhwMode};
use opentherm_wire::DataId;

/// Receives numeric readings, `None` while the value is unknown or stale
pub trait SensorSink: Send + Sync {
    /// Publish a reading
    fn publish(&self, value: Option<f64>);
}

/// Receives on/off readings, `None` while unknown
pub trait BinarySensorSink: Send + Sync {
    /// Publish a state
    fn publish(&self, state: Option<bool>);
}

/// Receives text readings
pub trait TextSensorSink: Send + Sync {
    /// Publish a text
    fn publish(&self, text: Option<&str>);
}

/// Receives the effective value of a writable number
pub trait NumberSink: Send + Sync {
    /// Publish the value in use
    fn publish(&self, value: f64);
}

/// Receives the effective state of a switch
pub trait SwitchSink: Send + Sync {
    /// Publish the state in use
    fn publish(&self, on: bool);
}

/// Numeric sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// Boiler flow temperature
    BoilerTemp,
    /// Return water temperature
    ReturnTemp,
    /// Relative modulation level
    Modulation,
    /// Flow setpoint in use
    Setpoint,
    /// Hot water temperature
    DhwTemp,
    /// Hot water setpoint reported by the boiler
    DhwSetpoint,
    /// Hot water flow rate
    DhwFlowRate,
    /// Central heating water pressure
    ChPressure,
    /// Outside temperature measured by the boiler
    OutsideTemp,
    /// Outdoor temperature from the weather source
    WeatherTemp,
    /// Indoor temperature used for feedback
    IndoorTemp,
}

impl SensorKind {
    /// Every sensor
    pub const ALL: [SensorKind; 11] = [
        SensorKind::BoilerTemp,
        SensorKind::ReturnTemp,
        SensorKind::Modulation,
        SensorKind::Setpoint,
        SensorKind::DhwTemp,
        SensorKind::DhwSetpoint,
        SensorKind::DhwFlowRate,
        SensorKind::ChPressure,
        SensorKind::OutsideTemp,
        SensorKind::WeatherTemp,
        SensorKind::IndoorTemp,
    ];

    /// The data-ID read for this sensor, `None` for host-sourced values
    pub fn data_id(self) -> Option<DataId> {
        match self {
            SensorKind::BoilerTemp => Some(DataId::BOILER_TEMP),
            SensorKind::ReturnTemp => Some(DataId::RETURN_TEMP),
            SensorKind::Modulation => Some(DataId::REL_MODULATION),
            SensorKind::DhwTemp => Some(DataId::DHW_TEMP),
            SensorKind::DhwSetpoint => Some(DataId::DHW_SETPOINT),
            SensorKind::DhwFlowRate => Some(DataId::DHW_FLOW_RATE),
            SensorKind::ChPressure => Some(DataId::CH_PRESSURE),
            SensorKind::OutsideTemp => Some(DataId::OUTSIDE_TEMP),
            SensorKind::Setpoint | SensorKind::WeatherTemp | SensorKind::IndoorTemp => None,
        }
    }
}

/// On/off sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinarySensorKind {
    /// Central heating active
    ChActive,
    /// Hot water active
    DhwActive,
    /// Burner flame on
    Flame,
    /// Boiler fault
    Fault,
    /// Diagnostic indication
    Diagnostic,
    /// Boiler answering
    CommsOk,
}

impl BinarySensorKind {
    /// Every binary sensor
    pub const ALL: [BinarySensorKind; 6] = [
        BinarySensorKind::ChActive,
        BinarySensorKind::DhwActive,
        BinarySensorKind::Flame,
        BinarySensorKind::Fault,
        BinarySensorKind::Diagnostic,
        BinarySensorKind::CommsOk,
    ];
}

/// Writable numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumberTarget {
    /// Indoor target temperature of the climate entity
    TargetTemp,
    /// Lowest flow setpoint
    MinSetpoint,
    /// Highest heating flow setpoint
    MaxBoilerTemp,
    /// Highest hot water setpoint
    MaxDhwTemp,
    /// Emergency flow setpoint
    EmergencySetpoint,
    /// Maximum relative modulation
    MaxModulation,
    /// Curve slope
    EquithermN,
    /// Curve shift
    EquithermK,
    /// Curve offset
    EquithermT,
    /// Indoor feedback gain
    FeedbackGain,
    /// Eco hot water temperature
    DhwEcoTemp,
    /// Normal hot water temperature
    DhwNormalTemp,
}

impl NumberTarget {
    /// Every number
    pub const ALL: [NumberTarget; 12] = [
        NumberTarget::TargetTemp,
        NumberTarget::MinSetpoint,
        NumberTarget::MaxBoilerTemp,
        NumberTarget::MaxDhwTemp,
        NumberTarget::EmergencySetpoint,
        NumberTarget::MaxModulation,
        NumberTarget::EquithermN,
        NumberTarget::EquithermK,
        NumberTarget::EquithermT,
        NumberTarget::FeedbackGain,
        NumberTarget::DhwEcoTemp,
        NumberTarget::DhwNormalTemp,
    ];

    /// Accepted range
    pub fn range(self) -> (f64, f64) {
        match self {
            NumberTarget::TargetTemp => (5.0, 30.0),
            NumberTarget::MinSetpoint => (10.0, 60.0),
            NumberTarget::MaxBoilerTemp => (30.0, 90.0),
            NumberTarget::MaxDhwTemp => (35.0, 65.0),
            NumberTarget::EmergencySetpoint => (25.0, 80.0),
            NumberTarget::MaxModulation => (0.0, 100.0),
            NumberTarget::EquithermN => (0.1, 5.0),
            NumberTarget::EquithermK => (-10.0, 10.0),
            NumberTarget::EquithermT => (0.0, 30.0),
            NumberTarget::FeedbackGain => (0.0, 10.0),
            NumberTarget::DhwEcoTemp | NumberTarget::DhwNormalTemp => (35.0, 65.0),
        }
    }

    /// Whether `value` is finite and inside [`range`](Self::range)
    pub fn accepts(self, value: f64) -> bool {
        let (min, max) = self.range();
        value.is_finite() && (min..=max).contains(&value)
    }

    /// The configuration value this number controls
    pub fn get(self, config: &Config) -> f64 {
        match self {
            NumberTarget::TargetTemp => config.heating.target_indoor,
            NumberTarget::MinSetpoint => config.limits.min_setpoint,
            NumberTarget::MaxBoilerTemp => config.limits.max_boiler_temp_heating,
            NumberTarget::MaxDhwTemp => config.limits.max_dhw_temp,
            NumberTarget::EmergencySetpoint => config.limits.emergency_setpoint,
            NumberTarget::MaxModulation => config.limits.max_modulation,
            NumberTarget::EquithermN => config.equitherm.n,
            NumberTarget::EquithermK => config.equitherm.k,
            NumberTarget::EquithermT => config.equitherm.t,
            NumberTarget::FeedbackGain => config.equitherm.feedback_gain,
            NumberTarget::DhwEcoTemp => config.dhw.eco_temp,
            NumberTarget::DhwNormalTemp => config.dhw.normal_temp,
        }
    }

    /// Change the configuration value this number controls
    pub fn set(self, config: &mut Config, value: f64) {
        let field = match self {
            NumberTarget::TargetTemp => &mut config.heating.target_indoor,
            NumberTarget::MinSetpoint => &mut config.limits.min_setpoint,
            NumberTarget::MaxBoilerTemp => &mut config.limits.max_boiler_temp_heating,
            NumberTarget::MaxDhwTemp => &mut config.limits.max_dhw_temp,
            NumberTarget::EmergencySetpoint => &mut config.limits.emergency_setpoint,
            NumberTarget::MaxModulation => &mut config.limits.max_modulation,
            NumberTarget::EquithermN => &mut config.equitherm.n,
            NumberTarget::EquithermK => &mut config.equitherm.k,
            NumberTarget::EquithermT => &mut config.equitherm.t,
            NumberTarget::FeedbackGain => &mut config.equitherm.feedback_gain,
            NumberTarget::DhwEcoTemp => &mut config.dhw.eco_temp,
            NumberTarget::DhwNormalTemp => &mut config.dhw.normal_temp,
        };
        *field = value;
    }
}

/// Boolean overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Override {
    /// Emergency setpoint
    Emergency,
    /// Forced heating
    ForceHeat,
    /// Forced hot water
    ForceDhw,
}

impl Override {
    /// Every override
    pub const ALL: [Override; 3] = [Override::Emergency, Override::ForceHeat, Override::ForceDhw];
}

/// Sinks the controller publishes to; unbound entities are skipped
#[derive(Clone, Default)]
pub struct Bindings {
    sensors: HashMap<SensorKind, Arc<dyn SensorSink>>,
    binary_sensors: HashMap<BinarySensorKind, Arc<dyn BinarySensorSink>>,
    fault_text: Option<Arc<dyn TextSensorSink>>,
    numbers: HashMap<NumberTarget, Arc<dyn NumberSink>>,
    switches: HashMap<Override, Arc<dyn SwitchSink>>,
    dhw_mode: Option<Arc<dyn TextSensorSink>>,
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindings")
            .field("sensors", &self.sensors.keys().collect::<Vec<_>>())
            .field("binary_sensors", &self.binary_sensors.keys().collect::<Vec<_>>())
            .field("fault_text", &self.fault_text.is_some())
            .field("numbers", &self.numbers.keys().collect::<Vec<_>>())
            .field("switches", &self.switches.keys().collect::<Vec<_>>())
            .field("dhw_mode", &self.dhw_mode.is_some())
            .finish()
    }
}

impl Bindings {
    /// No sinks
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a sensor
    pub fn with_sensor(mut self, kind: SensorKind, sink: Arc<dyn SensorSink>) -> Self {
        self.sensors.insert(kind, sink);
        self
    }

    /// Bind a binary sensor
    pub fn with_binary_sensor(
        mut self,
        kind: BinarySensorKind,
        sink: Arc<dyn BinarySensorSink>,
    ) -> Self {
        self.binary_sensors.insert(kind, sink);
        self
    }

    /// Bind the fault text sensor
    pub fn with_fault_text(mut self, sink: Arc<dyn TextSensorSink>) -> Self {
        self.fault_text = Some(sink);
        self
    }

    /// Bind a number
    pub fn with_number(mut self, target: NumberTarget, sink: Arc<dyn NumberSink>) -> Self {
        self.numbers.insert(target, sink);
        self
    }

    /// Bind a switch
    pub fn with_switch(mut self, switch: Override, sink: Arc<dyn SwitchSink>) -> Self {
        self.switches.insert(switch, sink);
        self
    }

    /// Bind the hot water mode select
    pub fn with_dhw_mode(mut self, sink: Arc<dyn TextSensorSink>) -> Self {
        self.dhw_mode = Some(sink);
        self
    }

    pub(crate) fn sensor(&self, kind: SensorKind, value: Option<f64>) {
        if let Some(sink) = self.sensors.get(&kind) {
            sink.publish(value);
        }
    }

    pub(crate) fn binary_sensor(&self, kind: BinarySensorKind, state: Option<bool>) {
        if let Some(sink) = self.binary_sensors.get(&kind) {
            sink.publish(state);
        }
    }

    pub(crate) fn fault_text(&self, text: Option<&str>) {
        if let Some(sink) = &self.fault_text {
            sink.publish(text);
        }
    }

    pub(crate) fn number(&self, target: NumberTarget, value: f64) {
        if let Some(sink) = self.numbers.get(&target) {
            sink.publish(value);
        }
    }

    pub(crate) fn switch(&self, switch: Override, on: bool) {
        if let Some(sink) = self.switches.get(&switch) {
            sink.publish(on);
        }
    }

    pub(crate) fn dhw_mode(&self, mode: DhwMode) {
        if let Some(sink) = &self.dhw_mode {
            let name = match mode {
                DhwMode::Off => "off",
                DhwMode::Eco => "eco",
                DhwMode::Heat => "heat",
            };
            sink.publish(Some(name));
        }
    }
}

/// Published values a [`MemorySink`] remembers
pub const MEMORY_SINK_HISTORY: usize = 64;

/// Sink keeping the most recent published values, for hosts that poll and for tests
#[derive(Debug, Default)]
pub struct MemorySink<T> {
    history: Mutex<VecDeque<T>>,
}

impl<T: Clone> MemorySink<T> {
    /// Create an empty sink
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            history: Mutex::new(VecDeque::with_capacity(MEMORY_SINK_HISTORY)),
        })
    }

    /// Last published value
    pub fn latest(&self) -> Option<T> {
        self.lock().back().cloned()
    }

    /// Up to [`MEMORY_SINK_HISTORY`] recent values, oldest first
    pub fn history(&self) -> Vec<T> {
        self.lock().iter().cloned().collect()
    }

    fn push(&self, value: T) {
        let mut history = self.lock();
        if history.len() == MEMORY_SINK_HISTORY {
            history.pop_front();
        }
        history.push_back(value);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SensorSink for MemorySink<Option<f64>> {
    fn publish(&self, value: Option<f64>) {
        self.push(value);
    }
}

impl BinarySensorSink for MemorySink<Option<bool>> {
    fn publish(&self, state: Option<bool>) {
        self.push(state);
    }
}

impl TextSensorSink for MemorySink<Option<String>> {
    fn publish(&self, text: Option<&str>) {
        self.push(text.map(str::to_string));
    }
}

impl NumberSink for MemorySink<f64> {
    fn publish(&self, value: f64) {
        self.push(value);
    }
}

impl SwitchSink for MemorySink<bool> {
    fn publish(&self, on: bool) {
        self.push(on);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_targets_round_trip_config() {
        let mut config = Config::default();
        for target in NumberTarget::ALL {
            let (min, max) = target.range();
            let value = (min + max) / 2.0;
            assert!(target.accepts(value));
            target.set(&mut config, value);
            assert_eq!(target.get(&config), value);
        }
    }

    #[test]
    fn test_number_ranges() {
        assert!(!NumberTarget::MaxModulation.accepts(101.0));
        assert!(!NumberTarget::TargetTemp.accepts(f64::NAN));
        assert!(NumberTarget::EquithermK.accepts(-2.5));
        assert!(!NumberTarget::EquithermN.accepts(0.0));
    }

    #[test]
    fn test_bindings_publish_to_bound_sinks() {
        let boiler = MemorySink::<Option<f64>>::new();
        let comms = MemorySink::<Option<bool>>::new();
        let bindings = Bindings::new()
            .with_sensor(SensorKind::BoilerTemp, boiler.clone())
            .with_binary_sensor(BinarySensorKind::CommsOk, comms.clone());

        bindings.sensor(SensorKind::BoilerTemp, Some(41.5));
        bindings.sensor(SensorKind::ReturnTemp, Some(30.0));
        bindings.binary_sensor(BinarySensorKind::CommsOk, Some(true));
        bindings.sensor(SensorKind::BoilerTemp, None);

        assert_eq!(boiler.history(), vec![Some(41.5), None]);
        assert_eq!(comms.latest(), Some(Some(true)));
    }

    #[test]
    fn test_memory_sink_history_is_bounded() {
        let sink = MemorySink::<Option<f64>>::new();
        let bindings = Bindings::new().with_sensor(SensorKind::DhwTemp, sink.clone());
        for i in 0..1000 {
            bindings.sensor(SensorKind::DhwTemp, Some(f64::from(i)));
        }

        let history = sink.history();
        assert_eq!(history.len(), MEMORY_SINK_HISTORY);
        assert_eq!(history.first(), Some(&Some(936.0)));
        assert_eq!(sink.latest(), Some(Some(999.0)));
    }

    #[test]
    fn test_sensor_data_ids_are_readable() {
        for kind in SensorKind::ALL {
            if let Some(data_id) = kind.data_id() {
                assert!(data_id.is_readable(), "{:?}", kind);
            }
        }
    }
}
