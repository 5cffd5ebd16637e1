/*!
 * Async front end for a connection controller.
 *
 * [`ControllerService::spawn`] moves a controller into its own task. That
 * task is the single owner of the controller: owner commands and transport
 * events are both processed there, one at a time. [`ControllerHandle`] is the
 * cloneable owner-facing side.
 */
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

use bluelink_core::logging::component_span;
use bluelink_core::types::DeviceId;
use bluelink_devices::{CentralTransport, Device, EventReceiver};

use crate::controller::{ConnectionController, ControllerState};
use crate::error::{ControllerError, Result};
use crate::events::ControllerEvent;

/// Capacity of the owner command queue
const COMMAND_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug)]
enum Command {
    StartDiscovery(oneshot::Sender<Result<()>>),
    StopDiscovery(oneshot::Sender<()>),
    ResetDiscovery(oneshot::Sender<()>),
    Connect(DeviceId, oneshot::Sender<Result<()>>),
    Disconnect(DeviceId, oneshot::Sender<Result<()>>),
    Devices(oneshot::Sender<Vec<Device>>),
    State(oneshot::Sender<ControllerState>),
    Shutdown(oneshot::Sender<()>),
}

/// Runs a connection controller on a tokio task
#[derive(Debug)]
pub struct ControllerService;

impl ControllerService {
    /// Spawn the processing task
    ///
    /// `transport_events` must be the receiving half of the channel the
    /// controller's transport emits on. The task ends on
    /// [`ControllerHandle::shutdown`] or when every handle is dropped; either
    /// way the controller is torn down.
    pub fn spawn<T>(
        controller: ConnectionController<T>,
        transport_events: EventReceiver,
    ) -> (ControllerHandle, JoinHandle<()>)
    where
        T: CentralTransport + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = ControllerHandle {
            commands: command_tx,
            events: controller.subscribe(),
        };
        let task = tokio::spawn(
            Self::run(controller, command_rx, transport_events)
                .instrument(component_span("controller_service", None)),
        );
        (handle, task)
    }

    async fn run<T: CentralTransport>(
        mut controller: ConnectionController<T>,
        mut commands: mpsc::Receiver<Command>,
        mut transport_events: EventReceiver,
    ) {
        info!("Controller service started");
        let mut transport_open = true;

        loop {
            // Radio events already queued are handled before the next command
            tokio::select! {
                biased;

                event = transport_events.recv(), if transport_open => match event {
                    Some(event) => controller.handle_event(event),
                    None => {
                        debug!("Transport event channel closed");
                        transport_open = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        controller.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => Self::dispatch(&mut controller, command),
                    None => {
                        debug!("All controller handles dropped");
                        break;
                    }
                },
            }
        }

        drop(controller);
        info!("Controller service stopped");
    }

    fn dispatch<T: CentralTransport>(controller: &mut ConnectionController<T>, command: Command) {
        // A dropped reply receiver only means the caller stopped waiting
        match command {
            Command::StartDiscovery(reply) => {
                let _ = reply.send(controller.start_discovery());
            }
            Command::StopDiscovery(reply) => {
                controller.stop_discovery();
                let _ = reply.send(());
            }
            Command::ResetDiscovery(reply) => {
                controller.reset_discovery();
                let _ = reply.send(());
            }
            Command::Connect(device, reply) => {
                let _ = reply.send(controller.connect(&device));
            }
            Command::Disconnect(device, reply) => {
                let _ = reply.send(controller.disconnect(&device));
            }
            Command::Devices(reply) => {
                let _ = reply.send(controller.devices());
            }
            Command::State(reply) => {
                let _ = reply.send(controller.state());
            }
            Command::Shutdown(reply) => {
                controller.shutdown();
                let _ = reply.send(());
            }
        }
    }
}

/// Owner-facing handle to a running controller
///
/// Every method waits only for the controller to accept or reject the
/// request. Radio outcomes arrive through [`ControllerHandle::subscribe`].
#[derive(Debug)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    // Only the controller holds the sender, so subscribers see `Closed` once the task ends
    events: broadcast::Receiver<ControllerEvent>,
}

impl Clone for ControllerHandle {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            events: self.events.resubscribe(),
        }
    }
}

impl ControllerHandle {
    /// Subscribe to observer events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.resubscribe()
    }

    /// Start a fresh scan session
    pub async fn start_discovery(&self) -> Result<()> {
        self.request(Command::StartDiscovery).await?
    }

    /// Stop scanning
    pub async fn stop_discovery(&self) -> Result<()> {
        self.request(Command::StopDiscovery).await
    }

    /// Forget discovered devices without stopping the scan
    pub async fn reset_discovery(&self) -> Result<()> {
        self.request(Command::ResetDiscovery).await
    }

    /// Start a connection attempt
    pub async fn connect<I: Into<DeviceId>>(&self, device: I) -> Result<()> {
        let device = device.into();
        self.request(|reply| Command::Connect(device, reply)).await?
    }

    /// Disconnect the session target or cancel a pending attempt
    pub async fn disconnect<I: Into<DeviceId>>(&self, device: I) -> Result<()> {
        let device = device.into();
        self.request(|reply| Command::Disconnect(device, reply)).await?
    }

    /// Discovered devices in first-discovery order
    pub async fn devices(&self) -> Result<Vec<Device>> {
        self.request(Command::Devices).await
    }

    /// The controller state
    pub async fn state(&self) -> Result<ControllerState> {
        self.request(Command::State).await
    }

    /// Tear the controller down and stop its task
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    /// Whether the processing task is still accepting commands
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request<R, F>(&self, build: F) -> Result<R>
    where
        F: FnOnce(oneshot::Sender<R>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| ControllerError::ServiceStopped)?;
        reply_rx.await.map_err(|_| ControllerError::ServiceStopped)
    }
}
