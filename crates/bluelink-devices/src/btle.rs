/*!
 * Real radio transport backed by `btleplug`.
 *
 * Commands are forwarded to the first system adapter on tokio tasks; their
 * results, and the adapter's own event stream, are translated into
 * [`TransportEvent`]s on the controller's channel.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use bluelink_core::types::{DeviceId, GattUuid};

use crate::transport::{
    CentralTransport, DisconnectReason, EventSender, Result, TransportError, TransportEvent,
};

type PeripheralTable = Arc<Mutex<HashMap<DeviceId, PeripheralId>>>;

fn table(peripherals: &PeripheralTable) -> MutexGuard<'_, HashMap<DeviceId, PeripheralId>> {
    peripherals.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId::from_string(format!("{:?}", id))
}

fn platform_error(err: btleplug::Error) -> TransportError {
    TransportError::Platform(err.to_string())
}

/// Central transport over the first Bluetooth adapter of the host
#[derive(Debug)]
pub struct BtleplugCentral {
    adapter: Adapter,
    runtime: Handle,
    events: EventSender,
    scanning: Arc<AtomicBool>,
    peripherals: PeripheralTable,
}

impl BtleplugCentral {
    /// Open the first adapter and start pumping its events
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(events: EventSender) -> Result<Self> {
        let manager = Manager::new().await.map_err(platform_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(platform_error)?
            .into_iter()
            .next()
            .ok_or(TransportError::Unavailable)?;

        if let Ok(info) = adapter.adapter_info().await {
            info!(adapter = %info, "Using Bluetooth adapter");
        }

        let central = Self {
            adapter,
            runtime: Handle::current(),
            events,
            scanning: Arc::new(AtomicBool::new(false)),
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        };
        central.spawn_event_pump().await?;
        Ok(central)
    }

    async fn spawn_event_pump(&self) -> Result<()> {
        let mut stream = self.adapter.events().await.map_err(platform_error)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let scanning = self.scanning.clone();
        let peripherals = self.peripherals.clone();

        self.runtime.spawn(async move {
            while let Some(event) = stream.next().await {
                let forwarded = match event {
                    CentralEvent::DeviceDiscovered(pid) | CentralEvent::DeviceUpdated(pid) => {
                        if !scanning.load(Ordering::SeqCst) {
                            continue;
                        }
                        let Ok(peripheral) = adapter.peripheral(&pid).await else {
                            continue;
                        };
                        let Ok(Some(properties)) = peripheral.properties().await else {
                            continue;
                        };
                        let Some(rssi) = properties.rssi else {
                            continue;
                        };
                        let id = device_id(&pid);
                        table(&peripherals).insert(id.clone(), pid);
                        TransportEvent::DeviceDiscovered {
                            id,
                            name: properties.local_name.unwrap_or_default(),
                            rssi: f64::from(rssi),
                        }
                    }
                    CentralEvent::DeviceDisconnected(pid) => TransportEvent::Disconnected {
                        id: device_id(&pid),
                        reason: DisconnectReason::LinkLoss,
                    },
                    _ => continue,
                };

                if events.send(forwarded).is_err() {
                    debug!("Event receiver gone, stopping adapter event pump");
                    break;
                }
            }
        });
        Ok(())
    }

    fn peripheral_id(&self, device: &DeviceId) -> Result<PeripheralId> {
        table(&self.peripherals)
            .get(device)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(device.clone()))
    }
}

impl CentralTransport for BtleplugCentral {
    fn start_scan(&mut self, service_filters: &[GattUuid]) -> Result<()> {
        let filter = ScanFilter {
            services: service_filters.iter().map(|uuid| *uuid.as_uuid()).collect(),
        };
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let scanning = self.scanning.clone();
        scanning.store(true, Ordering::SeqCst);
        self.runtime.spawn(async move {
            if let Err(e) = adapter.start_scan(filter).await {
                warn!("Failed to start scan: {}", e);
                scanning.store(false, Ordering::SeqCst);
                let _ = events.send(TransportEvent::ScanFailed {
                    reason: e.to_string(),
                });
            }
        });
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        let adapter = self.adapter.clone();
        self.scanning.store(false, Ordering::SeqCst);
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
        Ok(())
    }

    fn connect(&mut self, device: &DeviceId) -> Result<()> {
        let pid = self.peripheral_id(device)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let id = device.clone();
        self.runtime.spawn(async move {
            let result = match adapter.peripheral(&pid).await {
                Ok(peripheral) => peripheral.connect().await,
                Err(e) => Err(e),
            };
            let event = match result {
                Ok(()) => TransportEvent::Connected { id },
                Err(e) => TransportEvent::ConnectFailed {
                    id,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn disconnect(&mut self, device: &DeviceId) -> Result<()> {
        let pid = self.peripheral_id(device)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let id = device.clone();
        self.runtime.spawn(async move {
            let result = match adapter.peripheral(&pid).await {
                Ok(peripheral) => peripheral.disconnect().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(device = %id, "Disconnect failed: {}", e);
            }
            let _ = events.send(TransportEvent::Disconnected {
                id,
                reason: DisconnectReason::LocalRequest,
            });
        });
        Ok(())
    }

    fn discover_services(&mut self, device: &DeviceId, service_filters: &[GattUuid]) -> Result<()> {
        let pid = self.peripheral_id(device)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let id = device.clone();
        let filters = service_filters.to_vec();
        self.runtime.spawn(async move {
            let services = async {
                let peripheral = adapter.peripheral(&pid).await?;
                peripheral.discover_services().await?;
                Ok::<_, btleplug::Error>(
                    peripheral
                        .services()
                        .into_iter()
                        .map(|service| GattUuid::from_uuid(service.uuid))
                        .filter(|uuid| filters.is_empty() || filters.contains(uuid))
                        .collect(),
                )
            }
            .await
            .map_err(|e| e.to_string());
            let _ = events.send(TransportEvent::ServicesDiscovered { id, services });
        });
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        device: &DeviceId,
        service: &GattUuid,
        characteristic_filters: &[GattUuid],
    ) -> Result<()> {
        let pid = self.peripheral_id(device)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let id = device.clone();
        let service = *service;
        let filters = characteristic_filters.to_vec();
        self.runtime.spawn(async move {
            let characteristics = match adapter.peripheral(&pid).await {
                Ok(peripheral) => peripheral
                    .services()
                    .into_iter()
                    .find(|s| GattUuid::from_uuid(s.uuid) == service)
                    .map(|s| {
                        s.characteristics
                            .into_iter()
                            .map(|c| GattUuid::from_uuid(c.uuid))
                            .filter(|uuid| filters.is_empty() || filters.contains(uuid))
                            .collect()
                    })
                    .ok_or_else(|| format!("service {} not found", service)),
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(TransportEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
            });
        });
        Ok(())
    }
}
