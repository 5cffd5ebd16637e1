use std::time::Duration;

use bluelink_core::config::{
    ConfigBuilder, SERIAL_NOTIFY_CHARACTERISTIC_UUID, SERIAL_SERVICE_UUID,
    SERIAL_WRITE_CHARACTERISTIC_UUID,
};
use bluelink_devices::{event_channel, SimulatedCentral, SimulatedPeripheral};

use bluelink_engine::{ConnectionController, ConnectionOutcome, ControllerEvent, ControllerService};

fn robot(name: &str, rssi: f64) -> SimulatedPeripheral {
    SimulatedPeripheral::new(name).with_rssi(rssi).with_service(
        SERIAL_SERVICE_UUID,
        vec![
            SERIAL_NOTIFY_CHARACTERISTIC_UUID,
            SERIAL_WRITE_CHARACTERISTIC_UUID,
        ],
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Defaults, overridable through BLUELINK__SCAN__STOP_ON_CONNECT and friends
    let config = ConfigBuilder::new()
        .with_environment_prefix("BLUELINK")
        .build()?;
    println!("Effective configuration:\n{}", config.to_toml_string()?);

    // Wire a simulated radio to a controller running on its own task
    let (tx, rx) = event_channel();
    let radio = SimulatedCentral::new(tx);
    let controller = ConnectionController::with_config(radio.clone(), &config);
    let (handle, task) = ControllerService::spawn(controller, rx);
    let mut events = handle.subscribe();

    handle.start_discovery().await?;

    // Two robots come into range
    radio.advertise(robot("Makeblock_LE_2e03", -48.0));
    radio.advertise(robot("Makeblock_LE_3ed8", -77.0));

    let mut nearest = None;
    while nearest.is_none() {
        if let ControllerEvent::AvailableDevicesChanged(devices) = events.recv().await? {
            println!("Available devices:");
            for device in &devices {
                println!(
                    "  {} ~{:.2} m ({:?})",
                    device,
                    device.distance_estimate(),
                    device.proximity()
                );
            }
            if devices.len() == 2 {
                nearest = devices
                    .iter()
                    .min_by(|a, b| a.distance_estimate().total_cmp(&b.distance_estimate()))
                    .map(|device| device.id().clone());
            }
        }
    }

    let target = nearest.ok_or_else(|| anyhow::anyhow!("no device discovered"))?;
    println!("Connecting to {}", target);
    handle.connect(target.clone()).await?;

    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await?? {
            ControllerEvent::ConnectionResult {
                device,
                outcome: ConnectionOutcome::Connected(profile),
            } => {
                println!("Connected to {}", device);
                println!("{}", serde_json::to_string_pretty(&profile)?);
                break;
            }
            ControllerEvent::ConnectionResult {
                device,
                outcome: ConnectionOutcome::Failed(error),
            } => {
                anyhow::bail!("connection to {} failed: {}", device, error);
            }
            _ => {}
        }
    }

    handle.disconnect(target).await?;
    handle.shutdown().await?;
    task.await?;

    Ok(())
}
