use std::time::Duration;

use anyhow::Context;

use opentherm_core::config::ConfigBuilder;
use opentherm_core::error::Error as CoreError;
use opentherm_core::utils::{spawn_and_log, with_timeout};
use opentherm_engine::{
    BinarySensorKind, Bindings, MemorySink, OpenThermController, Override, SensorKind,
};
use opentherm_wire::{DataId, SimulatedBoiler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults, then an optional config file, then OPENTHERM__* variables
    let mut builder = ConfigBuilder::new().with_environment_prefix("OPENTHERM");
    if let Some(path) = std::env::args().nth(1) {
        builder = builder.with_config_file(path);
    }
    let config = builder.build().context("Failed to load configuration")?;
    opentherm_core::init(&config)?;

    let boiler = SimulatedBoiler::new().with_latency(Duration::from_millis(15));

    let boiler_temp = MemorySink::<Option<f64>>::new();
    let setpoint = MemorySink::<Option<f64>>::new();
    let pressure = MemorySink::<Option<f64>>::new();
    let comms = MemorySink::<Option<bool>>::new();
    let faults = MemorySink::<Option<String>>::new();
    let bindings = Bindings::new()
        .with_sensor(SensorKind::BoilerTemp, boiler_temp.clone())
        .with_sensor(SensorKind::Setpoint, setpoint.clone())
        .with_sensor(SensorKind::ChPressure, pressure.clone())
        .with_binary_sensor(BinarySensorKind::CommsOk, comms.clone())
        .with_fault_text(faults.clone());

    let (mut controller, handle) = OpenThermController::new(config, boiler.clone(), bindings)?;
    let (stop, shutdown) = tokio::sync::oneshot::channel::<()>();
    let task = spawn_and_log("controller", async move { controller.run_until(shutdown).await });

    println!("Reporting weather and room temperatures...");
    handle.set_outdoor_temp(Some(-3.0)).await?;
    handle.set_indoor_temp(Some(20.2)).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    println!(
        "Setpoint {:?}, boiler {:?}, pressure {:?}, comms {:?}",
        setpoint.latest().flatten(),
        boiler_temp.latest().flatten(),
        pressure.latest().flatten(),
        comms.latest().flatten()
    );

    println!("Forcing heat...");
    handle.set_override(Override::ForceHeat, true).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!(
        "Boiler control setpoint register: {:?}",
        boiler.register(DataId::CONTROL_SETPOINT)
    );
    handle.set_override(Override::ForceHeat, false).await?;

    println!("Low water pressure fault from the boiler...");
    boiler.set_register(DataId::FAULT_FLAGS, 0x0400);
    boiler.set_temperature(DataId::CH_PRESSURE, 0.4);

    println!("Running, press Ctrl-C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(40)) => {}
    }
    println!(
        "Faults: {:?}, pressure {:?}",
        faults.latest().flatten(),
        pressure.latest().flatten()
    );

    let _ = stop.send(());
    with_timeout(Duration::from_secs(5), async {
        task.await.map_err(|e| CoreError::runtime(e.to_string()))
    })
    .await?;

    println!("{} requests exchanged", boiler.request_count());
    Ok(())
}
