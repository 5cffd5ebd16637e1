use std::time::Duration;

use bluelink_core::config::ConfigBuilder;
use bluelink_core::logging;
use bluelink_devices::{event_channel, BtleplugCentral};

use bluelink_engine::{ConnectionController, ControllerEvent, ControllerService};

/// Scan the first host adapter and optionally connect to a device by name
///
/// Usage: `cargo run --example radio_session --features btleplug -- [config.toml] [name]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "bluelink.toml".to_string());
    let wanted = args.next();

    let config = ConfigBuilder::new()
        .with_config_file(&config_path)
        .with_environment_prefix("BLUELINK")
        .build()?;
    logging::init_from_config(&config.logging)?;

    let (tx, rx) = event_channel();
    let radio = BtleplugCentral::new(tx).await?;
    let controller = ConnectionController::with_config(radio, &config);
    let (handle, task) = ControllerService::spawn(controller, rx);
    let mut events = handle.subscribe();

    handle.start_discovery().await?;
    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);
    let mut connecting = false;

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event? {
                ControllerEvent::AvailableDevicesChanged(devices) => {
                    for device in &devices {
                        println!("{} ~{:.1} m", device, device.distance_estimate());
                    }
                    let found = devices
                        .iter()
                        .find(|d| Some(d.name()) == wanted.as_deref())
                        .map(|d| d.id().clone());
                    if let (false, Some(id)) = (connecting, found) {
                        handle.stop_discovery().await?;
                        handle.connect(id).await?;
                        connecting = true;
                    }
                }
                ControllerEvent::ConnectionResult { device, outcome } => {
                    println!("{}: {:?}", device, outcome);
                    break;
                }
                ControllerEvent::Disconnected { device, reason } => {
                    println!("{} disconnected: {}", device, reason);
                }
                ControllerEvent::DiscoveryFailed(error) => {
                    anyhow::bail!("discovery stopped: {}", error);
                }
            },
        }
    }

    handle.shutdown().await?;
    task.await?;
    Ok(())
}
