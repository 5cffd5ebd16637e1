/*!
 * Connection controller.
 *
 * [`ConnectionController`] owns a [`CentralTransport`] and a
 * [`DiscoveryRegistry`]. Owner commands start radio work and return at once;
 * the transport answers on its event channel and every answer is fed back
 * through [`ConnectionController::handle_event`], which is the only place
 * where the registry and the connection session change after a command.
 * Observers receive [`ControllerEvent`]s over a broadcast channel.
 *
 * Scanning and the connection session are independent: a scan may keep
 * running while a device is being connected.
 */
use std::fmt;

use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use bluelink_core::config::{Config, GattConfig, RequiredService, ScanConfig};
use bluelink_core::logging::operation_span;
use bluelink_core::types::{DeviceId, GattUuid};
use bluelink_devices::transport::DiscoveryOutcome;
use bluelink_devices::{
    CentralTransport, Device, DisconnectReason, DiscoveryEvent, DiscoveryRegistry, TransportEvent,
};

use crate::error::{ControllerError, Result};
use crate::events::{ConnectionOutcome, ControllerEvent, EVENT_CHANNEL_CAPACITY};
use crate::profile::{ResolvedProfile, ServiceResolution};

const COMPONENT: &str = "connection_controller";

/// Observable state of a controller
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerState {
    /// No scan and no session
    Idle,
    /// A scan is running and no session exists
    Scanning,
    /// Waiting for the link to come up
    Connecting(DeviceId),
    /// Link is up, resolving services and characteristics
    DiscoveringServices(DeviceId),
    /// Handshake finished
    Connected(DeviceId, ResolvedProfile),
    /// Waiting for the transport to confirm a requested disconnect
    Disconnecting(DeviceId),
}

impl ControllerState {
    /// The session target, if a session exists
    pub fn target(&self) -> Option<&DeviceId> {
        match self {
            ControllerState::Idle | ControllerState::Scanning => None,
            ControllerState::Connecting(id)
            | ControllerState::DiscoveringServices(id)
            | ControllerState::Connected(id, _)
            | ControllerState::Disconnecting(id) => Some(id),
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "idle"),
            ControllerState::Scanning => write!(f, "scanning"),
            ControllerState::Connecting(id) => write!(f, "connecting to {}", id),
            ControllerState::DiscoveringServices(id) => write!(f, "discovering services of {}", id),
            ControllerState::Connected(id, _) => write!(f, "connected to {}", id),
            ControllerState::Disconnecting(id) => write!(f, "disconnecting from {}", id),
        }
    }
}

#[derive(Debug)]
enum Phase {
    Connecting,
    DiscoveringServices {
        /// Set once the service list arrived
        services_known: bool,
        /// Services still waiting for their characteristics
        pending: Vec<GattUuid>,
        profile: ResolvedProfile,
    },
    Connected(ResolvedProfile),
    Disconnecting,
}

#[derive(Debug)]
struct Session {
    target: Device,
    phase: Phase,
}

/// Central-role state machine over a transport
#[derive(Debug)]
pub struct ConnectionController<T: CentralTransport> {
    transport: T,
    registry: DiscoveryRegistry,
    scan: ScanConfig,
    gatt: GattConfig,
    scanning: bool,
    session: Option<Session>,
    events: broadcast::Sender<ControllerEvent>,
}

impl<T: CentralTransport> ConnectionController<T> {
    /// Create a controller with the default configuration
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, &Config::default())
    }

    /// Create a controller using the scan and GATT sections of a configuration
    pub fn with_config(transport: T, config: &Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            registry: DiscoveryRegistry::new(),
            scan: config.scan.clone(),
            gatt: config.gatt.clone(),
            scanning: false,
            session: None,
            events,
        }
    }

    /// Subscribe to observer events
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Start a fresh scan session
    ///
    /// Forgets every previously discovered device. Observers are told only if
    /// that actually removed something.
    pub fn start_discovery(&mut self) -> Result<()> {
        let _span = operation_span("start_discovery", COMPONENT).entered();

        if !self.transport.is_available() {
            warn!("Cannot start discovery, transport unavailable");
            return Err(ControllerError::TransportUnavailable);
        }
        if let Err(e) = self.transport.start_scan(&self.scan.service_filters) {
            warn!("Transport rejected scan: {}", e);
            return Err(ControllerError::TransportUnavailable);
        }

        let had_devices = !self.registry.is_empty();
        self.registry.reset();
        self.scanning = true;
        info!(filters = self.scan.service_filters.len(), "Discovery started");

        if had_devices {
            self.notify_devices();
        }
        Ok(())
    }

    /// Stop scanning; the last device list stays readable
    pub fn stop_discovery(&mut self) {
        let _span = operation_span("stop_discovery", COMPONENT).entered();

        if !self.scanning {
            debug!("Discovery already stopped");
            return;
        }
        if let Err(e) = self.transport.stop_scan() {
            warn!("Transport rejected stop scan: {}", e);
        }
        self.scanning = false;
        info!(devices = self.registry.len(), "Discovery stopped");
    }

    /// Forget discovered devices without stopping the scan
    pub fn reset_discovery(&mut self) {
        let _span = operation_span("reset_discovery", COMPONENT).entered();

        self.registry.reset();
        debug!(scanning = self.scanning, "Discovery reset");
        self.notify_devices();
    }

    /// Start a connection attempt to a discovered device
    ///
    /// Returns once the transport accepted the request; the outcome is
    /// published as a single [`ControllerEvent::ConnectionResult`].
    pub fn connect(&mut self, device: &DeviceId) -> Result<()> {
        let _span = operation_span("connect", COMPONENT).entered();

        if let Some(session) = &self.session {
            debug!(device = %device, target = %session.target.id(), "Connection already in progress");
            return Err(ControllerError::OperationAlreadyInProgress {
                target: session.target.id().clone(),
            });
        }

        let target = self
            .registry
            .get(device)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownDevice(device.clone()))?;

        if !self.transport.is_available() {
            return Err(ControllerError::TransportUnavailable);
        }
        self.transport
            .connect(device)
            .map_err(|e| ControllerError::from_transport(device, e))?;

        info!(device = %device, name = %target.display_name(), "Connecting");
        self.session = Some(Session {
            target,
            phase: Phase::Connecting,
        });

        if self.scan.stop_on_connect {
            self.stop_discovery();
        }
        Ok(())
    }

    /// Disconnect the session target, or cancel a pending attempt to it
    pub fn disconnect(&mut self, device: &DeviceId) -> Result<()> {
        let _span = operation_span("disconnect", COMPONENT).entered();

        let session = match self.session.take() {
            Some(session) if session.target.id() == device => session,
            other => {
                self.session = other;
                return Err(ControllerError::UnknownDevice(device.clone()));
            }
        };

        match session.phase {
            Phase::Disconnecting => {
                debug!(device = %device, "Disconnect already requested");
                self.session = Some(session);
            }
            Phase::Connected(_) => match self.transport.disconnect(device) {
                Ok(()) => {
                    info!(device = %device, "Disconnecting");
                    self.session = Some(Session {
                        target: session.target,
                        phase: Phase::Disconnecting,
                    });
                }
                Err(e) => {
                    warn!(device = %device, "Transport rejected disconnect: {}", e);
                    self.publish(ControllerEvent::Disconnected {
                        device: session.target,
                        reason: DisconnectReason::LocalRequest,
                    });
                }
            },
            Phase::Connecting | Phase::DiscoveringServices { .. } => {
                info!(device = %device, "Cancelling connection attempt");
                self.release_link(device);
                let error = ControllerError::connection_failed(device, "cancelled by disconnect request");
                self.finish_attempt(session.target, ConnectionOutcome::Failed(error));
            }
        }
        Ok(())
    }

    /// Process one transport event
    pub fn handle_event(&mut self, event: TransportEvent) {
        let _span = operation_span(event.kind(), COMPONENT).entered();
        trace!(device = ?event.device_id(), "Handling transport event");

        match event {
            TransportEvent::DeviceDiscovered { id, name, rssi } => {
                self.on_discovered(DiscoveryEvent { id, name, rssi })
            }
            TransportEvent::Connected { id } => self.on_connected(id),
            TransportEvent::ConnectFailed { id, reason } => self.on_connect_failed(id, reason),
            TransportEvent::Disconnected { id, reason } => self.on_disconnected(id, reason),
            TransportEvent::ServicesDiscovered { id, services } => self.on_services(id, services),
            TransportEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
            } => self.on_characteristics(id, service, characteristics),
            TransportEvent::ScanFailed { reason } => self.on_scan_failed(reason),
        }
    }

    /// Discovered devices in first-discovery order
    pub fn devices(&self) -> Vec<Device> {
        self.registry.snapshot()
    }

    /// Whether a scan is running
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// The current state
    pub fn state(&self) -> ControllerState {
        match &self.session {
            Some(session) => {
                let id = session.target.id().clone();
                match &session.phase {
                    Phase::Connecting => ControllerState::Connecting(id),
                    Phase::DiscoveringServices { .. } => ControllerState::DiscoveringServices(id),
                    Phase::Connected(profile) => ControllerState::Connected(id, profile.clone()),
                    Phase::Disconnecting => ControllerState::Disconnecting(id),
                }
            }
            None if self.scanning => ControllerState::Scanning,
            None => ControllerState::Idle,
        }
    }

    /// Stop scanning and drop any session
    ///
    /// A pending attempt gets its failure result, an established connection
    /// its disconnect notification. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let _span = operation_span("shutdown", COMPONENT).entered();

        if self.scanning {
            self.stop_discovery();
        }

        let session = match self.session.take() {
            Some(session) => session,
            None => return,
        };
        let id = session.target.id().clone();
        self.release_link(&id);

        match session.phase {
            Phase::Connecting | Phase::DiscoveringServices { .. } => {
                let error = ControllerError::connection_failed(&id, "controller shut down");
                self.finish_attempt(session.target, ConnectionOutcome::Failed(error));
            }
            Phase::Connected(_) | Phase::Disconnecting => {
                info!(device = %id, "Disconnected on shutdown");
                self.publish(ControllerEvent::Disconnected {
                    device: session.target,
                    reason: DisconnectReason::LocalRequest,
                });
            }
        }
    }

    fn on_discovered(&mut self, event: DiscoveryEvent) {
        if !self.scanning {
            debug!(device = %event.id, "Ignoring discovery while not scanning");
            return;
        }

        let registration = self.registry.register(event);
        if registration.is_visible_change() || self.scan.notify_on_signal_update {
            self.notify_devices();
        }
    }

    fn on_scan_failed(&mut self, reason: String) {
        if !self.scanning {
            debug!("Ignoring scan failure while not scanning: {}", reason);
            return;
        }
        warn!("Scan aborted by transport: {}", reason);
        self.scanning = false;
        self.publish(ControllerEvent::DiscoveryFailed(
            ControllerError::TransportUnavailable,
        ));
    }

    fn on_connected(&mut self, id: DeviceId) {
        match self.session.as_mut() {
            Some(session) if session.target.id() == &id => {
                if !matches!(session.phase, Phase::Connecting) {
                    debug!(device = %id, "Ignoring repeated connected event");
                    return;
                }
                session.phase = Phase::DiscoveringServices {
                    services_known: false,
                    pending: Vec::new(),
                    profile: ResolvedProfile::new(),
                };
            }
            _ => {
                // The attempt was cancelled or never ours; nobody owns this link
                info!(device = %id, "Releasing link without a pending attempt");
                self.release_link(&id);
                return;
            }
        }

        info!(device = %id, "Link up, discovering services");
        let requested = self.gatt.service_uuids();
        if let Err(e) = self.transport.discover_services(&id, &requested) {
            let error = self.discovery_failed(&id, e.to_string());
            self.fail_attempt(error);
        }
    }

    fn on_connect_failed(&mut self, id: DeviceId, reason: String) {
        match self.take_session(&id, |phase| matches!(phase, Phase::Connecting)) {
            Some(session) => {
                let error = ControllerError::connection_failed(&id, reason);
                self.finish_attempt(session.target, ConnectionOutcome::Failed(error));
            }
            None => debug!(device = %id, "Ignoring stale connect failure"),
        }
    }

    fn on_disconnected(&mut self, id: DeviceId, reason: DisconnectReason) {
        let session = match self.take_session(&id, |_| true) {
            Some(session) => session,
            None => {
                debug!(device = %id, reason = %reason, "Ignoring disconnect of non-target device");
                return;
            }
        };

        match session.phase {
            Phase::Connecting | Phase::DiscoveringServices { .. } => {
                let error = ControllerError::connection_failed(
                    &id,
                    format!("disconnected during handshake: {}", reason),
                );
                self.finish_attempt(session.target, ConnectionOutcome::Failed(error));
            }
            Phase::Connected(_) | Phase::Disconnecting => {
                info!(device = %id, reason = %reason, "Disconnected");
                self.publish(ControllerEvent::Disconnected {
                    device: session.target,
                    reason,
                });
            }
        }
    }

    fn on_services(&mut self, id: DeviceId, services: DiscoveryOutcome) {
        let awaiting = matches!(
            &self.session,
            Some(Session {
                target,
                phase: Phase::DiscoveringServices { services_known: false, .. },
            }) if target.id() == &id
        );
        if !awaiting {
            debug!(device = %id, "Ignoring unexpected service list");
            return;
        }

        let discovered = match services {
            Ok(discovered) => discovered,
            Err(reason) => {
                warn!(device = %id, "Service discovery failed: {}", reason);
                let error = self.discovery_failed(&id, reason);
                self.fail_attempt(error);
                return;
            }
        };
        debug!(device = %id, count = discovered.len(), "Services discovered");

        let plan: Vec<RequiredService> = if self.gatt.required_services.is_empty() {
            discovered
                .iter()
                .map(|service| RequiredService::new(*service, Vec::new()))
                .collect()
        } else {
            self.gatt.resolution_plan()
        };

        let mut profile = ResolvedProfile::new();
        let mut pending = Vec::new();
        for RequiredService {
            service,
            characteristics,
        } in plan
        {
            if !discovered.contains(&service) {
                warn!(device = %id, service = %service, "Required service missing");
                profile.record(service, ServiceResolution::Missing);
                continue;
            }
            match self
                .transport
                .discover_characteristics(&id, &service, &characteristics)
            {
                Ok(()) => pending.push(service),
                Err(e) => {
                    warn!(device = %id, service = %service, "Characteristic discovery rejected: {}", e);
                    profile.record(service, ServiceResolution::Failed(e.to_string()));
                }
            }
        }

        let done = pending.is_empty();
        if let Some(session) = self.session.as_mut() {
            session.phase = Phase::DiscoveringServices {
                services_known: true,
                pending,
                profile,
            };
        }
        if done {
            self.complete_handshake();
        }
    }

    fn on_characteristics(&mut self, id: DeviceId, service: GattUuid, outcome: DiscoveryOutcome) {
        let required = self.required_characteristics(&service);

        let done = match self.session.as_mut() {
            Some(Session {
                target,
                phase:
                    Phase::DiscoveringServices {
                        services_known: true,
                        pending,
                        profile,
                    },
            }) if target.id() == &id && pending.contains(&service) => {
                pending.retain(|s| s != &service);
                let resolution = match outcome {
                    Ok(found) => {
                        let missing: Vec<String> = required
                            .iter()
                            .filter(|c| !found.contains(c))
                            .map(|c| c.to_string())
                            .collect();
                        if missing.is_empty() {
                            ServiceResolution::Resolved(found)
                        } else {
                            ServiceResolution::Failed(format!(
                                "missing characteristics: {}",
                                missing.join(", ")
                            ))
                        }
                    }
                    Err(reason) => ServiceResolution::Failed(reason),
                };
                debug!(device = %id, service = %service, resolved = resolution.is_resolved(), "Characteristics discovered");
                profile.record(service, resolution);
                pending.is_empty()
            }
            _ => {
                debug!(device = %id, service = %service, "Ignoring unexpected characteristics");
                return;
            }
        };

        if done {
            self.complete_handshake();
        }
    }

    fn complete_handshake(&mut self) {
        let session = match self.session.take() {
            Some(session) => session,
            None => return,
        };
        let profile = match session.phase {
            Phase::DiscoveringServices { profile, .. } => profile,
            phase => {
                self.session = Some(Session {
                    target: session.target,
                    phase,
                });
                return;
            }
        };
        let id = session.target.id().clone();

        if self.gatt.strict {
            if let Some((service, reason)) = profile.first_failure() {
                warn!(device = %id, service = %service, "Strict handshake failed: {}", reason);
                self.release_link(&id);
                let error = ControllerError::service_resolution_failed(&id, service, reason);
                self.finish_attempt(session.target, ConnectionOutcome::Failed(error));
                return;
            }
        }

        info!(
            device = %id,
            services = profile.services().len(),
            complete = profile.is_complete(),
            "Connection established"
        );
        self.session = Some(Session {
            target: session.target.clone(),
            phase: Phase::Connected(profile.clone()),
        });
        self.finish_attempt(session.target, ConnectionOutcome::Connected(profile));
    }

    fn take_session<F: Fn(&Phase) -> bool>(&mut self, id: &DeviceId, accept: F) -> Option<Session> {
        match &self.session {
            Some(session) if session.target.id() == id && accept(&session.phase) => {
                self.session.take()
            }
            _ => None,
        }
    }

    fn required_characteristics(&self, service: &GattUuid) -> Vec<GattUuid> {
        self.gatt
            .resolution_plan()
            .into_iter()
            .find(|required| &required.service == service)
            .map(|required| required.characteristics)
            .unwrap_or_default()
    }

    fn discovery_failed(&self, id: &DeviceId, reason: String) -> ControllerError {
        match self.gatt.required_services.first() {
            Some(required) => ControllerError::service_resolution_failed(id, required.service, reason),
            None => ControllerError::connection_failed(id, format!("service discovery failed: {}", reason)),
        }
    }

    /// End the current attempt with an error and drop the link
    fn fail_attempt(&mut self, error: ControllerError) {
        if let Some(session) = self.session.take() {
            let id = session.target.id().clone();
            self.release_link(&id);
            self.finish_attempt(session.target, ConnectionOutcome::Failed(error));
        }
    }

    fn release_link(&mut self, id: &DeviceId) {
        if let Err(e) = self.transport.disconnect(id) {
            warn!(device = %id, "Transport rejected disconnect: {}", e);
        }
    }

    fn finish_attempt(&self, device: Device, outcome: ConnectionOutcome) {
        match &outcome {
            ConnectionOutcome::Connected(_) => debug!(device = %device.id(), "Connection attempt succeeded"),
            ConnectionOutcome::Failed(e) => warn!(device = %device.id(), "Connection attempt failed: {}", e),
        }
        self.publish(ControllerEvent::ConnectionResult { device, outcome });
    }

    fn notify_devices(&self) {
        self.publish(ControllerEvent::AvailableDevicesChanged(self.registry.snapshot()));
    }

    fn publish(&self, event: ControllerEvent) {
        let kind = event.kind();
        if self.events.send(event).is_err() {
            trace!(kind, "No observers for controller event");
        }
    }
}

impl<T: CentralTransport> Drop for ConnectionController<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluelink_core::config::{
        SERIAL_NOTIFY_CHARACTERISTIC_UUID, SERIAL_SERVICE_UUID, SERIAL_WRITE_CHARACTERISTIC_UUID,
    };
    use bluelink_devices::{event_channel, EventReceiver, SimulatedCentral, SimulatedPeripheral, TransportCommand};

    const SERVICE: GattUuid = SERIAL_SERVICE_UUID;
    const NOTIFY: GattUuid = SERIAL_NOTIFY_CHARACTERISTIC_UUID;
    const WRITE: GattUuid = SERIAL_WRITE_CHARACTERISTIC_UUID;

    struct Harness {
        controller: ConnectionController<SimulatedCentral>,
        central: SimulatedCentral,
        transport_events: EventReceiver,
        observer: broadcast::Receiver<ControllerEvent>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(Config::default(), false)
        }

        fn manual() -> Self {
            Self::with_config(Config::default(), true)
        }

        fn with_config(config: Config, manual: bool) -> Self {
            let (tx, rx) = event_channel();
            let central = if manual {
                SimulatedCentral::manual(tx)
            } else {
                SimulatedCentral::new(tx)
            };
            let controller = ConnectionController::with_config(central.clone(), &config);
            let observer = controller.subscribe();
            Self {
                controller,
                central,
                transport_events: rx,
                observer,
            }
        }

        fn pump(&mut self) {
            while let Ok(event) = self.transport_events.try_recv() {
                self.controller.handle_event(event);
            }
        }

        fn inject(&mut self, event: TransportEvent) {
            self.central.inject(event);
            self.pump();
        }

        fn advertise(&mut self, peripheral: SimulatedPeripheral) -> DeviceId {
            let id = peripheral.id.clone();
            self.central.advertise(peripheral);
            self.pump();
            id
        }

        fn observed(&mut self) -> Vec<ControllerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.observer.try_recv() {
                events.push(event);
            }
            events
        }

        fn results(&mut self) -> Vec<(DeviceId, ConnectionOutcome)> {
            self.observed()
                .into_iter()
                .filter_map(|event| match event {
                    ControllerEvent::ConnectionResult { device, outcome } => {
                        Some((device.id().clone(), outcome))
                    }
                    _ => None,
                })
                .collect()
        }
    }

    fn robot(name: &str) -> SimulatedPeripheral {
        SimulatedPeripheral::new(name).with_service(SERVICE, vec![NOTIFY, WRITE])
    }

    fn names(devices: &[Device]) -> Vec<String> {
        devices.iter().map(|d| d.name().to_string()).collect()
    }

    #[test]
    fn test_discovery_snapshot_in_order() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        assert_eq!(h.controller.state(), ControllerState::Scanning);

        h.advertise(robot("Device_A"));
        h.advertise(robot("Device_B"));

        assert_eq!(names(&h.controller.devices()), vec!["Device_A", "Device_B"]);
        let snapshots: Vec<Vec<String>> = h
            .observed()
            .into_iter()
            .map(|event| match event {
                ControllerEvent::AvailableDevicesChanged(devices) => names(&devices),
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(
            snapshots,
            vec![vec!["Device_A".to_string()], vec!["Device_A".to_string(), "Device_B".to_string()]]
        );
    }

    #[test]
    fn test_signal_refresh_is_silent_by_default() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        h.advertise(robot("Device_A"));
        h.observed();

        h.advertise(robot("Device_A").with_rssi(-30.0));

        let devices = h.controller.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].signal_strength(), -30.0);
        assert!(h.observed().is_empty());
    }

    #[test]
    fn test_signal_refresh_notifies_when_configured() {
        let mut config = Config::default();
        config.scan.notify_on_signal_update = true;
        let mut h = Harness::with_config(config, false);
        h.controller.start_discovery().unwrap();
        h.advertise(robot("Device_A"));
        h.advertise(robot("Device_A").with_rssi(-30.0));

        assert_eq!(h.observed().len(), 2);
    }

    #[test]
    fn test_reset_discovery_keeps_scanning() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        h.advertise(robot("Device_A"));
        h.observed();

        h.controller.reset_discovery();
        assert!(h.controller.devices().is_empty());
        assert!(h.central.is_scanning());
        assert!(h.controller.is_scanning());
        match h.observed().as_slice() {
            [ControllerEvent::AvailableDevicesChanged(devices)] => assert!(devices.is_empty()),
            other => panic!("unexpected events {:?}", other),
        }

        h.advertise(robot("Device_A"));
        assert_eq!(h.controller.devices().len(), 1);
    }

    #[test]
    fn test_restart_discovery_clears_previous_session() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        h.advertise(robot("Device_A"));
        h.observed();

        h.controller.start_discovery().unwrap();
        assert!(h.controller.devices().is_empty());
        assert_eq!(h.observed().len(), 1);

        // Nothing to clear, nothing to report
        h.controller.start_discovery().unwrap();
        assert!(h.observed().is_empty());
    }

    #[test]
    fn test_stop_discovery_ignores_late_events() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        h.advertise(robot("Device_A"));
        h.controller.stop_discovery();
        h.observed();

        h.inject(TransportEvent::DeviceDiscovered {
            id: "Device_B".into(),
            name: "Device_B".to_string(),
            rssi: -40.0,
        });

        assert!(!h.controller.is_scanning());
        assert!(!h.central.is_scanning());
        assert_eq!(names(&h.controller.devices()), vec!["Device_A"]);
        assert_eq!(h.controller.state(), ControllerState::Idle);
        assert!(h.observed().is_empty());
    }

    #[test]
    fn test_start_discovery_without_radio() {
        let mut h = Harness::new();
        h.central.set_available(false);

        assert_eq!(
            h.controller.start_discovery(),
            Err(ControllerError::TransportUnavailable)
        );
        assert_eq!(h.controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_connect_unknown_device() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();

        assert_eq!(
            h.controller.connect(&"Device_Z".into()),
            Err(ControllerError::UnknownDevice("Device_Z".into()))
        );
        assert!(h.results().is_empty());
    }

    #[test]
    fn test_second_connect_rejected() {
        let mut h = Harness::manual();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));
        let b = h.advertise(robot("Device_B"));

        h.controller.connect(&a).unwrap();
        assert_eq!(
            h.controller.connect(&b),
            Err(ControllerError::OperationAlreadyInProgress { target: a.clone() })
        );
        assert_eq!(h.controller.state(), ControllerState::Connecting(a));
    }

    #[test]
    fn test_connect_resolves_required_service() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));

        h.controller.connect(&a).unwrap();
        h.pump();

        let results = h.results();
        assert_eq!(results.len(), 1);
        let profile = match &results[0] {
            (id, ConnectionOutcome::Connected(profile)) if id == &a => profile.clone(),
            other => panic!("unexpected result {:?}", other),
        };
        assert_eq!(profile.characteristics(&SERVICE), Some(&[NOTIFY, WRITE][..]));
        assert_eq!(h.controller.state(), ControllerState::Connected(a, profile));
    }

    #[test]
    fn test_stale_disconnect_is_ignored() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));
        h.advertise(robot("Device_B"));
        h.controller.connect(&a).unwrap();
        h.pump();
        let before = h.controller.state();
        h.observed();

        h.inject(TransportEvent::Disconnected {
            id: "Device_B".into(),
            reason: DisconnectReason::LinkLoss,
        });

        assert_eq!(h.controller.state(), before);
        assert!(h.observed().is_empty());
    }

    #[test]
    fn test_connect_failure_reported_once() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        let locked = h.advertise(robot("Locked").unconnectable());

        h.controller.connect(&locked).unwrap();
        h.pump();

        let results = h.results();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            &results[0].1,
            ConnectionOutcome::Failed(ControllerError::ConnectionFailed { .. })
        ));
        assert_eq!(h.controller.state(), ControllerState::Scanning);
    }

    #[test]
    fn test_rejected_connect_starts_no_session() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));
        h.central.set_available(false);

        assert_eq!(
            h.controller.connect(&a),
            Err(ControllerError::TransportUnavailable)
        );
        assert!(h.controller.state().target().is_none());
        assert!(h.results().is_empty());
    }

    #[test]
    fn test_missing_service_recorded() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        let mut hollow = robot("Hollow");
        hollow.services.clear();
        let id = h.advertise(hollow);

        h.controller.connect(&id).unwrap();
        h.pump();

        match h.results().as_slice() {
            [(_, ConnectionOutcome::Connected(profile))] => {
                assert_eq!(profile.service(&SERVICE), Some(&ServiceResolution::Missing));
                assert!(!profile.is_complete());
            }
            other => panic!("unexpected results {:?}", other),
        }
    }

    #[test]
    fn test_missing_characteristic_recorded() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        let id = h.advertise(SimulatedPeripheral::new("ReadOnly").with_service(SERVICE, vec![NOTIFY]));

        h.controller.connect(&id).unwrap();
        h.pump();

        match h.results().as_slice() {
            [(_, ConnectionOutcome::Connected(profile))] => match profile.service(&SERVICE) {
                Some(ServiceResolution::Failed(reason)) => assert!(reason.contains("FFE3")),
                other => panic!("unexpected resolution {:?}", other),
            },
            other => panic!("unexpected results {:?}", other),
        }
    }

    #[test]
    fn test_strict_handshake_fails_and_disconnects() {
        let mut config = Config::default();
        config.gatt.strict = true;
        let mut h = Harness::with_config(config, false);
        h.controller.start_discovery().unwrap();
        let mut hollow = robot("Hollow");
        hollow.services.clear();
        let id = h.advertise(hollow);

        h.controller.connect(&id).unwrap();
        h.pump();

        match h.results().as_slice() {
            [(_, ConnectionOutcome::Failed(ControllerError::ServiceResolutionFailed { service, .. }))] => {
                assert_eq!(service, &SERVICE)
            }
            other => panic!("unexpected results {:?}", other),
        }
        assert!(!h.central.is_connected(&id));
        assert_eq!(h.controller.state(), ControllerState::Scanning);
    }

    #[test]
    fn test_service_discovery_failure() {
        let mut h = Harness::manual();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));
        h.controller.connect(&a).unwrap();

        h.inject(TransportEvent::Connected { id: a.clone() });
        assert_eq!(h.controller.state(), ControllerState::DiscoveringServices(a.clone()));
        h.inject(TransportEvent::ServicesDiscovered {
            id: a.clone(),
            services: Err("gatt error 0x85".to_string()),
        });

        match h.results().as_slice() {
            [(_, ConnectionOutcome::Failed(ControllerError::ServiceResolutionFailed { reason, .. }))] => {
                assert_eq!(reason, "gatt error 0x85")
            }
            other => panic!("unexpected results {:?}", other),
        }
        assert!(h.central.commands().contains(&TransportCommand::Disconnect(a)));
        assert_eq!(h.controller.state(), ControllerState::Scanning);
    }

    #[test]
    fn test_disconnect_during_characteristic_discovery() {
        let mut h = Harness::manual();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));
        h.controller.connect(&a).unwrap();

        h.inject(TransportEvent::Connected { id: a.clone() });
        h.inject(TransportEvent::ServicesDiscovered {
            id: a.clone(),
            services: Ok(vec![SERVICE]),
        });
        h.inject(TransportEvent::Disconnected {
            id: a.clone(),
            reason: DisconnectReason::LinkLoss,
        });

        match h.results().as_slice() {
            [(_, ConnectionOutcome::Failed(ControllerError::ConnectionFailed { reason, .. }))] => {
                assert!(reason.contains("link loss"))
            }
            other => panic!("unexpected results {:?}", other),
        }
        assert_eq!(h.controller.state(), ControllerState::Scanning);

        // A late answer for the abandoned attempt changes nothing
        h.inject(TransportEvent::CharacteristicsDiscovered {
            id: a,
            service: SERVICE,
            characteristics: Ok(vec![NOTIFY, WRITE]),
        });
        assert_eq!(h.controller.state(), ControllerState::Scanning);
        assert!(h.observed().is_empty());
    }

    #[test]
    fn test_disconnect_connected_device() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));
        h.controller.connect(&a).unwrap();
        h.pump();
        h.observed();

        h.controller.disconnect(&a).unwrap();
        assert_eq!(h.controller.state(), ControllerState::Disconnecting(a.clone()));
        h.pump();

        assert_eq!(h.controller.state(), ControllerState::Scanning);
        match h.observed().as_slice() {
            [ControllerEvent::Disconnected { device, reason }] => {
                assert_eq!(device.id(), &a);
                assert_eq!(reason, &DisconnectReason::LocalRequest);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_unsolicited_disconnect() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));
        h.controller.connect(&a).unwrap();
        h.pump();
        h.observed();

        h.central.drop_link(&a, DisconnectReason::RemoteRequest);
        h.pump();

        assert!(h.controller.state().target().is_none());
        assert!(matches!(
            h.observed().as_slice(),
            [ControllerEvent::Disconnected {
                reason: DisconnectReason::RemoteRequest,
                ..
            }]
        ));
        // The owner may connect again
        h.controller.connect(&a).unwrap();
    }

    #[test]
    fn test_disconnect_non_target() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));
        let b = h.advertise(robot("Device_B"));

        assert_eq!(
            h.controller.disconnect(&a),
            Err(ControllerError::UnknownDevice(a.clone()))
        );

        h.controller.connect(&a).unwrap();
        h.pump();
        assert_eq!(
            h.controller.disconnect(&b),
            Err(ControllerError::UnknownDevice(b))
        );
        assert_eq!(h.controller.state().target(), Some(&a));
    }

    #[test]
    fn test_cancel_pending_attempt() {
        let mut h = Harness::manual();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));
        h.controller.connect(&a).unwrap();

        h.controller.disconnect(&a).unwrap();
        assert_eq!(h.controller.state(), ControllerState::Scanning);
        assert!(matches!(
            h.results().as_slice(),
            [(_, ConnectionOutcome::Failed(ControllerError::ConnectionFailed { .. }))]
        ));

        // The link comes up after the cancel and must not be left open
        let released = h.central.commands().len();
        h.inject(TransportEvent::Connected { id: a.clone() });
        assert_eq!(h.controller.state(), ControllerState::Scanning);
        assert!(h.observed().is_empty());
        assert_eq!(
            &h.central.commands()[released..],
            &[TransportCommand::Disconnect(a)][..]
        );
    }

    #[test]
    fn test_late_link_after_shutdown_is_released() {
        let mut h = Harness::manual();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));
        h.controller.connect(&a).unwrap();
        h.controller.shutdown();
        h.observed();

        let released = h.central.commands().len();
        h.inject(TransportEvent::Connected { id: a.clone() });

        assert_eq!(h.controller.state(), ControllerState::Idle);
        assert_eq!(
            &h.central.commands()[released..],
            &[TransportCommand::Disconnect(a)][..]
        );
        assert!(h.observed().is_empty());
    }

    #[test]
    fn test_repeated_connected_event_keeps_link() {
        let mut h = Harness::manual();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));
        h.controller.connect(&a).unwrap();
        h.inject(TransportEvent::Connected { id: a.clone() });

        let before = h.central.commands().len();
        h.inject(TransportEvent::Connected { id: a.clone() });

        assert_eq!(h.controller.state(), ControllerState::DiscoveringServices(a));
        assert_eq!(h.central.commands().len(), before);
    }

    #[test]
    fn test_stop_on_connect() {
        let mut config = Config::default();
        config.scan.stop_on_connect = true;
        let mut h = Harness::with_config(config, false);
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));

        h.controller.connect(&a).unwrap();
        assert!(!h.controller.is_scanning());
        assert!(!h.central.is_scanning());
    }

    #[test]
    fn test_no_required_services_resolves_everything() {
        let battery = GattUuid::from_u16(0x180F);
        let level = GattUuid::from_u16(0x2A19);
        let mut config = Config::default();
        config.scan.service_filters.clear();
        config.gatt.required_services.clear();
        let mut h = Harness::with_config(config, false);
        h.controller.start_discovery().unwrap();
        let id = h.advertise(robot("Device_A").with_service(battery, vec![level]));

        h.controller.connect(&id).unwrap();
        h.pump();

        match h.results().as_slice() {
            [(_, ConnectionOutcome::Connected(profile))] => {
                assert_eq!(profile.services().len(), 2);
                assert_eq!(profile.characteristics(&battery), Some(&[level][..]));
                assert!(h
                    .central
                    .commands()
                    .contains(&TransportCommand::DiscoverServices(id.clone(), vec![])));
            }
            other => panic!("unexpected results {:?}", other),
        }
    }

    #[test]
    fn test_required_characteristics_are_requested() {
        let mut config = Config::default();
        config.gatt.required_services = vec![RequiredService::new(SERVICE, vec![WRITE])];
        let mut h = Harness::with_config(config, false);
        h.controller.start_discovery().unwrap();
        let id = h.advertise(robot("Device_A"));

        h.controller.connect(&id).unwrap();
        h.pump();

        assert!(h.central.commands().contains(&TransportCommand::DiscoverCharacteristics(
            id,
            SERVICE,
            vec![WRITE]
        )));
    }

    #[test]
    fn test_repeated_required_service_merges_characteristics() {
        let extra = GattUuid::from_u16(0xFFE9);
        let mut config = Config::default();
        config.gatt.required_services = vec![
            RequiredService::new(SERVICE, vec![]),
            RequiredService::new(SERVICE, vec![extra]),
        ];
        let mut h = Harness::with_config(config, false);
        h.controller.start_discovery().unwrap();
        let id = h.advertise(SimulatedPeripheral::new("Device_A").with_service(SERVICE, vec![NOTIFY]));

        h.controller.connect(&id).unwrap();
        h.pump();

        let requests = h
            .central
            .commands()
            .into_iter()
            .filter(|command| matches!(command, TransportCommand::DiscoverCharacteristics(..)))
            .collect::<Vec<_>>();
        assert_eq!(
            requests,
            vec![TransportCommand::DiscoverCharacteristics(id, SERVICE, vec![extra])]
        );
        match h.results().as_slice() {
            [(_, ConnectionOutcome::Connected(profile))] => {
                assert_eq!(profile.services().len(), 1);
                match profile.service(&SERVICE) {
                    Some(ServiceResolution::Failed(reason)) => assert!(reason.contains("FFE9")),
                    other => panic!("unexpected resolution {:?}", other),
                }
            }
            other => panic!("unexpected results {:?}", other),
        }
    }

    #[test]
    fn test_repeated_required_service_fails_strict_handshake() {
        let mut config = Config::default();
        config.gatt.strict = true;
        config.gatt.required_services = vec![
            RequiredService::new(SERVICE, vec![]),
            RequiredService::new(SERVICE, vec![GattUuid::from_u16(0xFFE9)]),
        ];
        let mut h = Harness::with_config(config, false);
        h.controller.start_discovery().unwrap();
        let id = h.advertise(robot("Device_A"));

        h.controller.connect(&id).unwrap();
        h.pump();

        assert!(matches!(
            h.results().as_slice(),
            [(_, ConnectionOutcome::Failed(ControllerError::ServiceResolutionFailed { .. }))]
        ));
        assert!(!h.central.is_connected(&id));
    }

    #[test]
    fn test_scan_aborted_by_radio() {
        let mut h = Harness::new();
        h.controller.start_discovery().unwrap();
        h.advertise(robot("Device_A"));
        h.observed();

        assert!(h.central.fail_scan("adapter powered off"));
        h.pump();

        assert!(!h.controller.is_scanning());
        assert_eq!(h.controller.state(), ControllerState::Idle);
        match h.observed().as_slice() {
            [ControllerEvent::DiscoveryFailed(error)] => {
                assert_eq!(error, &ControllerError::TransportUnavailable)
            }
            other => panic!("unexpected events {:?}", other),
        }
        // The last list stays readable
        assert_eq!(names(&h.controller.devices()), vec!["Device_A"]);

        // A stale failure after the scan is gone is not reported again
        h.inject(TransportEvent::ScanFailed {
            reason: "adapter powered off".to_string(),
        });
        assert!(h.observed().is_empty());

        h.controller.start_discovery().unwrap();
        assert!(h.controller.is_scanning());
    }

    #[test]
    fn test_drop_tears_down() {
        let (tx, mut rx) = event_channel();
        let central = SimulatedCentral::new(tx);
        let mut controller = ConnectionController::new(central.clone());
        controller.start_discovery().unwrap();
        central.advertise(robot("Device_A"));
        while let Ok(event) = rx.try_recv() {
            controller.handle_event(event);
        }
        let a: DeviceId = "Device_A".into();
        controller.connect(&a).unwrap();
        while let Ok(event) = rx.try_recv() {
            controller.handle_event(event);
        }
        assert!(central.is_connected(&a));

        drop(controller);

        assert!(!central.is_scanning());
        assert!(!central.is_connected(&a));
    }

    #[test]
    fn test_shutdown_fails_pending_attempt() {
        let mut h = Harness::manual();
        h.controller.start_discovery().unwrap();
        let a = h.advertise(robot("Device_A"));
        h.controller.connect(&a).unwrap();

        h.controller.shutdown();

        assert_eq!(h.controller.state(), ControllerState::Idle);
        assert_eq!(h.results().len(), 1);
        h.controller.shutdown();
        assert!(h.observed().is_empty());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ControllerState::Idle.to_string(), "idle");
        assert_eq!(
            ControllerState::Connecting("Device_A".into()).to_string(),
            "connecting to Device_A"
        );
    }
}
