/*!
 * In-memory central transport.
 *
 * [`SimulatedCentral`] stands in for a radio: it keeps a table of virtual
 * peripherals, records every command it receives and emits the events a real
 * stack would. Handles are cheap to clone, so a test can keep one after
 * giving another to a controller and keep injecting advertisements.
 */
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use bluelink_core::types::{DeviceId, GattUuid};

use crate::transport::{
    CentralTransport, DisconnectReason, EventSender, Result, TransportError, TransportEvent,
};

/// Signal strength used when a simulated peripheral does not set one
pub const DEFAULT_RSSI: f64 = -60.0;

/// How the simulated radio answers commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Answer connect, disconnect and discovery commands with events
    Responsive,
    /// Only record commands; the test injects every event itself
    Manual,
}

/// A command received by the simulated radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// `start_scan` with its service filters
    StartScan(Vec<GattUuid>),
    /// `stop_scan`
    StopScan,
    /// `connect`
    Connect(DeviceId),
    /// `disconnect`
    Disconnect(DeviceId),
    /// `discover_services` with its service filters
    DiscoverServices(DeviceId, Vec<GattUuid>),
    /// `discover_characteristics` with its characteristic filters
    DiscoverCharacteristics(DeviceId, GattUuid, Vec<GattUuid>),
}

/// A GATT service exposed by a simulated peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedService {
    /// Service UUID
    pub uuid: GattUuid,
    /// Characteristic UUIDs of the service
    pub characteristics: Vec<GattUuid>,
}

/// A virtual peripheral
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    /// Identity reported in events
    pub id: DeviceId,
    /// Advertised local name
    pub name: String,
    /// Signal strength reported in advertisements
    pub rssi: f64,
    /// Service UUIDs carried in advertisements
    pub advertised_services: Vec<GattUuid>,
    /// GATT table served after connecting
    pub services: Vec<SimulatedService>,
    /// Whether connection attempts succeed
    pub connectable: bool,
}

impl SimulatedPeripheral {
    /// Create a connectable peripheral with no services, identified by its name
    pub fn new<S: Into<String>>(name: S) -> Self {
        let name = name.into();
        Self {
            id: DeviceId::from_string(&name),
            name,
            rssi: DEFAULT_RSSI,
            advertised_services: Vec::new(),
            services: Vec::new(),
            connectable: true,
        }
    }

    /// Use a specific identity instead of the name
    pub fn with_id<I: Into<DeviceId>>(mut self, id: I) -> Self {
        self.id = id.into();
        self
    }

    /// Set the advertised signal strength
    pub fn with_rssi(mut self, rssi: f64) -> Self {
        self.rssi = rssi;
        self
    }

    /// Add a GATT service and advertise its UUID
    pub fn with_service(mut self, uuid: GattUuid, characteristics: Vec<GattUuid>) -> Self {
        if !self.advertised_services.contains(&uuid) {
            self.advertised_services.push(uuid);
        }
        self.services.push(SimulatedService {
            uuid,
            characteristics,
        });
        self
    }

    /// Make connection attempts fail
    pub fn unconnectable(mut self) -> Self {
        self.connectable = false;
        self
    }

    fn matches(&self, filters: &[GattUuid]) -> bool {
        filters.is_empty() || self.advertised_services.iter().any(|s| filters.contains(s))
    }

    fn service(&self, uuid: &GattUuid) -> Option<&SimulatedService> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }
}

#[derive(Debug)]
struct SimulatedState {
    mode: ResponseMode,
    available: bool,
    scanning: bool,
    filters: Vec<GattUuid>,
    peripherals: HashMap<DeviceId, SimulatedPeripheral>,
    connected: HashSet<DeviceId>,
    commands: Vec<TransportCommand>,
}

/// Simulated central radio
#[derive(Debug, Clone)]
pub struct SimulatedCentral {
    state: Arc<Mutex<SimulatedState>>,
    events: EventSender,
}

impl SimulatedCentral {
    /// Create a radio that answers commands with events
    pub fn new(events: EventSender) -> Self {
        Self::with_mode(events, ResponseMode::Responsive)
    }

    /// Create a radio that only records commands
    pub fn manual(events: EventSender) -> Self {
        Self::with_mode(events, ResponseMode::Manual)
    }

    /// Create a radio with an explicit response mode
    pub fn with_mode(events: EventSender, mode: ResponseMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulatedState {
                mode,
                available: true,
                scanning: false,
                filters: Vec::new(),
                peripherals: HashMap::new(),
                connected: HashSet::new(),
                commands: Vec::new(),
            })),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: TransportEvent) {
        trace!(kind = event.kind(), device = ?event.device_id(), "Simulated event");
        if self.events.send(event).is_err() {
            debug!("Simulated event dropped, no receiver");
        }
    }

    /// Whether a scan is running
    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    /// Power the virtual radio on or off
    pub fn set_available(&self, available: bool) {
        let mut state = self.state();
        state.available = available;
        if !available {
            state.scanning = false;
        }
    }

    /// Whether the peripheral currently holds a link
    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.state().connected.contains(id)
    }

    /// Every command received so far, oldest first
    pub fn commands(&self) -> Vec<TransportCommand> {
        self.state().commands.clone()
    }

    /// Make a peripheral known without advertising it
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        self.state()
            .peripherals
            .insert(peripheral.id.clone(), peripheral);
    }

    /// Receive an advertisement from a peripheral
    ///
    /// The peripheral becomes known either way. Returns whether a discovery
    /// event was emitted, which requires a running scan whose filters match.
    pub fn advertise(&self, peripheral: SimulatedPeripheral) -> bool {
        let event = {
            let mut state = self.state();
            let visible = state.scanning && peripheral.matches(&state.filters);
            let event = TransportEvent::DeviceDiscovered {
                id: peripheral.id.clone(),
                name: peripheral.name.clone(),
                rssi: peripheral.rssi,
            };
            state.peripherals.insert(peripheral.id.clone(), peripheral);
            visible.then_some(event)
        };

        match event {
            Some(event) => {
                self.emit(event);
                true
            }
            None => false,
        }
    }

    /// Advertise a connectable, service-less peripheral identified by its name
    pub fn advertise_named<S: Into<String>>(&self, name: S) -> DeviceId {
        let peripheral = SimulatedPeripheral::new(name);
        let id = peripheral.id.clone();
        self.advertise(peripheral);
        id
    }

    /// Emit an arbitrary event, bypassing every check
    pub fn inject(&self, event: TransportEvent) {
        self.emit(event);
    }

    /// Drop an established link from the peripheral side
    pub fn drop_link(&self, id: &DeviceId, reason: DisconnectReason) {
        let was_connected = self.state().connected.remove(id);
        if was_connected {
            self.emit(TransportEvent::Disconnected {
                id: id.clone(),
                reason,
            });
        }
    }

    /// Abort a running scan the way a radio that lost power would
    ///
    /// Returns whether a scan was running, in which case a
    /// [`TransportEvent::ScanFailed`] is emitted.
    pub fn fail_scan<S: Into<String>>(&self, reason: S) -> bool {
        let was_scanning = std::mem::replace(&mut self.state().scanning, false);
        if was_scanning {
            self.emit(TransportEvent::ScanFailed {
                reason: reason.into(),
            });
        }
        was_scanning
    }

    fn record(&self, command: TransportCommand) -> ResponseMode {
        let mut state = self.state();
        state.commands.push(command);
        state.mode
    }

    fn ensure_available(&self) -> Result<()> {
        if self.state().available {
            Ok(())
        } else {
            Err(TransportError::Unavailable)
        }
    }
}

impl CentralTransport for SimulatedCentral {
    fn is_available(&self) -> bool {
        self.state().available
    }

    fn start_scan(&mut self, service_filters: &[GattUuid]) -> Result<()> {
        self.ensure_available()?;
        self.record(TransportCommand::StartScan(service_filters.to_vec()));
        let mut state = self.state();
        state.scanning = true;
        state.filters = service_filters.to_vec();
        debug!(filters = service_filters.len(), "Simulated scan started");
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.record(TransportCommand::StopScan);
        self.state().scanning = false;
        debug!("Simulated scan stopped");
        Ok(())
    }

    fn connect(&mut self, device: &DeviceId) -> Result<()> {
        self.ensure_available()?;
        if self.record(TransportCommand::Connect(device.clone())) == ResponseMode::Manual {
            return Ok(());
        }

        let connectable = self
            .state()
            .peripherals
            .get(device)
            .map(|p| p.connectable);

        let event = match connectable {
            Some(true) => {
                self.state().connected.insert(device.clone());
                TransportEvent::Connected { id: device.clone() }
            }
            Some(false) => TransportEvent::ConnectFailed {
                id: device.clone(),
                reason: "peripheral refused the connection".to_string(),
            },
            None => TransportEvent::ConnectFailed {
                id: device.clone(),
                reason: "peripheral not in range".to_string(),
            },
        };
        self.emit(event);
        Ok(())
    }

    fn disconnect(&mut self, device: &DeviceId) -> Result<()> {
        if self.record(TransportCommand::Disconnect(device.clone())) == ResponseMode::Manual {
            return Ok(());
        }
        self.drop_link(device, DisconnectReason::LocalRequest);
        Ok(())
    }

    fn discover_services(&mut self, device: &DeviceId, service_filters: &[GattUuid]) -> Result<()> {
        self.ensure_available()?;
        let command = TransportCommand::DiscoverServices(device.clone(), service_filters.to_vec());
        if self.record(command) == ResponseMode::Manual {
            return Ok(());
        }

        let services = {
            let state = self.state();
            match state.peripherals.get(device) {
                Some(peripheral) if state.connected.contains(device) => Ok(peripheral
                    .services
                    .iter()
                    .map(|s| s.uuid)
                    .filter(|uuid| service_filters.is_empty() || service_filters.contains(uuid))
                    .collect()),
                _ => Err("peripheral not connected".to_string()),
            }
        };
        self.emit(TransportEvent::ServicesDiscovered {
            id: device.clone(),
            services,
        });
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        device: &DeviceId,
        service: &GattUuid,
        characteristic_filters: &[GattUuid],
    ) -> Result<()> {
        self.ensure_available()?;
        let command = TransportCommand::DiscoverCharacteristics(
            device.clone(),
            *service,
            characteristic_filters.to_vec(),
        );
        if self.record(command) == ResponseMode::Manual {
            return Ok(());
        }

        let characteristics = {
            let state = self.state();
            match state.peripherals.get(device) {
                Some(peripheral) if state.connected.contains(device) => {
                    match peripheral.service(service) {
                        Some(found) => Ok(found
                            .characteristics
                            .iter()
                            .copied()
                            .filter(|uuid| {
                                characteristic_filters.is_empty()
                                    || characteristic_filters.contains(uuid)
                            })
                            .collect()),
                        None => Err(format!("service {} not found", service)),
                    }
                }
                _ => Err("peripheral not connected".to_string()),
            }
        };
        self.emit(TransportEvent::CharacteristicsDiscovered {
            id: device.clone(),
            service: *service,
            characteristics,
        });
        Ok(())
    }
}
