/*!
 * OpenTherm controller.
 *
 * The controller is the only task that drives the wire. It owns the master,
 * the poll scheduler, the control inputs and the entity bindings; the host
 * talks to it through a [`ControlHandle`], whose commands are applied
 * between exchanges.
 */
use std::future::Future;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use opentherm_core::config::{CompensationMode, Config, DhwMode};
use opentherm_core::logging::{component_span, operation_span};
use opentherm_wire::data::f64_to_f88;
use opentherm_wire::{DataId, MasterOptions, OpenThermMaster, Transceiver};

use crate::control::{self, ControlInputs, ControlSettings, ControlState};
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::scheduler::{CycleReport, PollScheduler, Request};
use crate::sinks::{BinarySensorKind, Bindings, NumberTarget, Override, SensorKind};

/// Commands buffered before senders have to wait
pub const COMMAND_QUEUE_DEPTH: usize = 32;

/// Plausible range for host-supplied temperatures
pub const TEMPERATURE_RANGE: (f64, f64) = (-60.0, 60.0);

/// A change requested by the host
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Change a number
    SetNumber(NumberTarget, f64),
    /// Turn an override on or off
    SetOverride(Override, bool),
    /// Enable or disable space heating
    SetHeatingEnabled(bool),
    /// Change the hot water mode
    SetDhwMode(DhwMode),
    /// Change who computes the flow temperature
    SetCompensation(CompensationMode),
    /// New outdoor temperature from the weather source
    SetOutdoorTemp(Option<f64>),
    /// New indoor temperature
    SetIndoorTemp(Option<f64>),
}

impl Command {
    /// Reject values the controller would never accept
    pub fn validate(&self) -> Result<()> {
        match *self {
            Command::SetNumber(target, value) => {
                if !target.accepts(value) {
                    let (min, max) = target.range();
                    return Err(Error::validation(format!(
                        "{:?} must be within [{}, {}] (got {})",
                        target, min, max, value
                    )));
                }
            }
            Command::SetOutdoorTemp(Some(value)) | Command::SetIndoorTemp(Some(value)) => {
                let (min, max) = TEMPERATURE_RANGE;
                if !value.is_finite() || value < min || value > max {
                    return Err(Error::validation(format!(
                        "temperature {} is outside [{}, {}]",
                        value, min, max
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Cloneable sender of commands to a running controller
#[derive(Debug, Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<Command>,
}

impl ControlHandle {
    /// Validate and send a command
    pub async fn send(&self, command: Command) -> Result<()> {
        command.validate()?;
        self.commands.send(command).await?;
        Ok(())
    }

    /// Change a number
    pub async fn set_number(&self, target: NumberTarget, value: f64) -> Result<()> {
        self.send(Command::SetNumber(target, value)).await
    }

    /// Turn an override on or off
    pub async fn set_override(&self, switch: Override, on: bool) -> Result<()> {
        self.send(Command::SetOverride(switch, on)).await
    }

    /// Enable or disable space heating
    pub async fn set_heating_enabled(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetHeatingEnabled(enabled)).await
    }

    /// Change the hot water mode
    pub async fn set_dhw_mode(&self, mode: DhwMode) -> Result<()> {
        self.send(Command::SetDhwMode(mode)).await
    }

    /// Change who computes the flow temperature
    pub async fn set_compensation(&self, mode: CompensationMode) -> Result<()> {
        self.send(Command::SetCompensation(mode)).await
    }

    /// Report the outdoor temperature
    pub async fn set_outdoor_temp(&self, value: Option<f64>) -> Result<()> {
        self.send(Command::SetOutdoorTemp(value)).await
    }

    /// Report the indoor temperature
    pub async fn set_indoor_temp(&self, value: Option<f64>) -> Result<()> {
        self.send(Command::SetIndoorTemp(value)).await
    }

    /// Whether the controller is gone
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Drives an OpenTherm boiler
#[derive(Debug)]
pub struct OpenThermController<T> {
    config: Config,
    settings: ControlSettings,
    master: OpenThermMaster<T>,
    scheduler: PollScheduler,
    inputs: ControlInputs,
    state: ControlState,
    diagnostics: Diagnostics,
    bindings: Bindings,
    commands: mpsc::Receiver<Command>,
    cycles: u64,
}

impl<T: Transceiver> OpenThermController<T> {
    /// Create a controller and the handle to command it
    ///
    /// The configuration is validated and the poll table checked before
    /// anything touches the wire.
    pub fn new(config: Config, transceiver: T, bindings: Bindings) -> Result<(Self, ControlHandle)> {
        config.validate()?;
        let scheduler = PollScheduler::from_config(&config.polling)?;
        let master = OpenThermMaster::new(transceiver, MasterOptions::from(&config));
        let settings = ControlSettings::from(&config);
        let inputs = ControlInputs::from_config(&config);
        let state = control::compute(&inputs, &settings);
        let (sender, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        info!(
            poll_interval_ms = config.polling.interval_ms,
            entries = scheduler.entries().len(),
            compensation = ?settings.compensation,
            "OpenTherm controller created"
        );

        let controller = Self {
            config,
            settings,
            master,
            scheduler,
            inputs,
            state,
            diagnostics: Diagnostics::new(),
            bindings,
            commands,
            cycles: 0,
        };
        Ok((controller, ControlHandle { commands: sender }))
    }

    /// Configuration in effect, including number changes
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current control inputs
    pub fn inputs(&self) -> &ControlInputs {
        &self.inputs
    }

    /// Last computed control state
    pub fn state(&self) -> &ControlState {
        &self.state
    }

    /// Boiler diagnostics
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// The protocol master
    pub fn master(&self) -> &OpenThermMaster<T> {
        &self.master
    }

    /// The poll scheduler
    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    /// Completed poll cycles
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Apply a command
    ///
    /// Returns true when the command changed an override, in which case the
    /// new setpoint is already queued as urgent and should be flushed.
    pub fn apply(&mut self, command: Command) -> bool {
        debug!(?command, "Applying command");
        let urgent = match command {
            Command::SetNumber(target, value) => {
                self.apply_number(target, value);
                false
            }
            Command::SetOverride(switch, on) => {
                let overrides = &mut self.inputs.overrides;
                match switch {
                    Override::Emergency => {
                        overrides.emergency = on;
                        // Leaving emergency mode also ends forced hot water
                        if !on && overrides.force_dhw {
                            overrides.force_dhw = false;
                            self.bindings.switch(Override::ForceDhw, false);
                        }
                    }
                    Override::ForceHeat => overrides.force_heat = on,
                    Override::ForceDhw => overrides.force_dhw = on,
                }
                self.bindings.switch(switch, on);
                true
            }
            Command::SetHeatingEnabled(enabled) => {
                self.inputs.heating_enabled = enabled;
                false
            }
            Command::SetDhwMode(mode) => {
                self.inputs.dhw_mode = mode;
                self.bindings.dhw_mode(mode);
                false
            }
            Command::SetCompensation(mode) => {
                self.config.heating.compensation = mode;
                self.settings.compensation = mode;
                false
            }
            Command::SetOutdoorTemp(value) => {
                self.inputs.outdoor_temp = value;
                self.bindings.sensor(SensorKind::WeatherTemp, value);
                false
            }
            Command::SetIndoorTemp(value) => {
                self.inputs.indoor_temp = value;
                self.bindings.sensor(SensorKind::IndoorTemp, value);
                false
            }
        };

        self.recompute();
        if urgent {
            self.scheduler
                .enqueue_urgent(Request::status(self.state.master_status()));
            if self.state.write_setpoint {
                self.scheduler.enqueue_urgent(Request::write(
                    DataId::CONTROL_SETPOINT,
                    f64_to_f88(self.state.setpoint),
                ));
            }
        }
        urgent
    }

    /// Run one poll cycle
    pub async fn tick(&mut self, now: Instant) -> CycleReport {
        self.recompute();
        self.queue_writes();
        let report = self
            .scheduler
            .run_cycle(&mut self.master, now)
            .instrument(operation_span("poll_cycle", "controller"))
            .await;
        self.cycles += 1;
        self.after_exchanges(&report);
        report
    }

    /// Send queued urgent requests without waiting for the next cycle
    pub async fn flush_urgent(&mut self) -> CycleReport {
        let report = self.scheduler.flush_urgent(&mut self.master).await;
        self.after_exchanges(&report);
        report
    }

    /// Publish every number, switch and mode
    pub fn publish_controls(&self) {
        for target in NumberTarget::ALL {
            self.bindings.number(target, target.get(&self.config));
        }
        let overrides = self.inputs.overrides;
        self.bindings.switch(Override::Emergency, overrides.emergency);
        self.bindings.switch(Override::ForceHeat, overrides.force_heat);
        self.bindings.switch(Override::ForceDhw, overrides.force_dhw);
        self.bindings.dhw_mode(self.inputs.dhw_mode);
    }

    /// Poll, control and serve commands until `shutdown` completes
    pub async fn run_until<F: Future>(&mut self, shutdown: F) -> Result<()> {
        let span = component_span("controller", None);
        self.run_loop(shutdown).instrument(span).await
    }

    async fn run_loop<F: Future>(&mut self, shutdown: F) -> Result<()> {
        self.publish_controls();

        let mut ticker = time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(cycles = self.cycles, "Controller shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick(Instant::now()).await;
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if self.apply(command) {
                            self.flush_urgent().await;
                        }
                    }
                    None => {
                        debug!("All control handles dropped");
                        commands_open = false;
                    }
                },
            }
        }

        Ok(())
    }

    fn apply_number(&mut self, target: NumberTarget, value: f64) {
        let mut candidate = self.config.clone();
        target.set(&mut candidate, value);
        match candidate.validate() {
            Ok(()) => {
                self.config = candidate;
                self.settings = ControlSettings::from(&self.config);
                if target == NumberTarget::TargetTemp {
                    self.inputs.target_temp = value;
                }
                info!(?target, value, "Number changed");
            }
            Err(e) => warn!(?target, value, error = %e, "Number change rejected"),
        }
        self.bindings.number(target, target.get(&self.config));
    }

    fn recompute(&mut self) {
        let state = control::compute(&self.inputs, &self.settings);
        if state.mode != self.state.mode {
            info!(
                from = %self.state.mode,
                to = %state.mode,
                setpoint = state.setpoint,
                "Operating mode changed"
            );
        }
        self.state = state;
    }

    fn queue_writes(&mut self) {
        let state = self.state;
        let scheduler = &mut self.scheduler;

        scheduler.enqueue(Request::status(state.master_status()));
        if state.write_setpoint {
            scheduler.enqueue_write(DataId::CONTROL_SETPOINT, f64_to_f88(state.setpoint));
        }
        if let Some(room_setpoint) = state.room_setpoint {
            scheduler.enqueue_write(DataId::ROOM_SETPOINT, f64_to_f88(room_setpoint));
        }
        if let Some(room_temp) = state.room_temp {
            scheduler.enqueue_write(DataId::ROOM_TEMP, f64_to_f88(room_temp));
        }
        if let Some(outdoor_temp) = state.outdoor_temp {
            scheduler.enqueue_write(DataId::OUTSIDE_TEMP, f64_to_f88(outdoor_temp));
        } else if state.room_setpoint.is_some() {
            warn!("Boiler compensation active without an outdoor temperature");
        }
        if let Some(modulation) = state.max_modulation {
            scheduler.enqueue_write(DataId::MAX_REL_MODULATION, f64_to_f88(modulation));
        }
        if let Some(dhw_setpoint) = state.dhw_setpoint {
            scheduler.enqueue_write(DataId::DHW_SETPOINT, f64_to_f88(dhw_setpoint));
        }
        scheduler.enqueue_write(
            DataId::MAX_CH_SETPOINT,
            f64_to_f88(self.settings.limits.max_boiler_temp_heating),
        );
    }

    fn after_exchanges(&mut self, report: &CycleReport) {
        let degraded = self.master.is_degraded();
        if degraded {
            self.master.mark_stale();
        }
        self.diagnostics
            .update_comms(degraded, report.successes() > 0);

        let cache = self.master.cache();
        self.diagnostics.update_status(cache.raw(DataId::STATUS));
        self.diagnostics
            .update_faults(cache.raw(DataId::FAULT_FLAGS));

        let dhw_active = self
            .diagnostics
            .slave_status()
            .map_or(false, |status| status.dhw_active);
        if dhw_active != self.inputs.boiler_dhw_active {
            self.inputs.boiler_dhw_active = dhw_active;
            self.recompute();
        }

        self.publish();
    }

    fn publish(&self) {
        let cache = self.master.cache();
        for kind in SensorKind::ALL {
            let value = match kind {
                SensorKind::Setpoint => Some(self.state.setpoint),
                SensorKind::WeatherTemp => self.inputs.outdoor_temp,
                SensorKind::IndoorTemp => self.inputs.indoor_temp,
                _ => kind.data_id().and_then(|data_id| cache.value(data_id)),
            };
            self.bindings.sensor(kind, value);
        }

        let slave = self.diagnostics.slave_status();
        for kind in BinarySensorKind::ALL {
            let state = match kind {
                BinarySensorKind::ChActive => slave.map(|s| s.ch_active),
                BinarySensorKind::DhwActive => slave.map(|s| s.dhw_active),
                BinarySensorKind::Flame => slave.map(|s| s.flame),
                BinarySensorKind::Diagnostic => slave.map(|s| s.diagnostic),
                BinarySensorKind::Fault => self.diagnostics.fault_active(),
                BinarySensorKind::CommsOk => Some(self.diagnostics.comms_ok()),
            };
            self.bindings.binary_sensor(kind, state);
        }

        self.bindings
            .fault_text(self.diagnostics.fault_text().as_deref());
    }
}
