//! Runtime that owns a [`SessionController`] on its own task.
//!
//! [`BleClient::start`] spawns the task and returns the [`SessionEvent`]
//! receiver plus a cloneable [`SessionHandle`]. The task serializes three
//! inputs into the controller:
//!
//! * requests from every `SessionHandle` clone, in arrival order,
//! * events from the adapter,
//! * the deadline of the connect / discovery step in flight.
//!
//! A request waits while an earlier request or event is being processed, so
//! a second `connect` issued during a first one runs after it.
//!
//! ```no_run
//! use ble_session::prelude::*;
//!
//! # async fn demo() -> Result<(), BleError> {
//! let client = BleClient::new(ClientConfig::default());
//! let (mut events, handle, _adapter) = client.start_simulated();
//!
//! handle.start_scan().await?;
//! handle.on_data(|bytes| println!("notify: {bytes:02x?}")).await?;
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::PeripheralDiscovered { id } = event {
//!         handle.connect(&id).await?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use log::{debug, info, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::adapter::{AdapterEvent, BleAdapter};
use crate::config::ClientConfig;
use crate::error::BleError;
use crate::session::{DataCallback, SessionController};
use crate::simulator::SimulatedAdapter;
use crate::types::{SessionEvent, SessionPhase, SessionSnapshot};

type Reply<T> = oneshot::Sender<Result<T, BleError>>;

/// What a [`SessionHandle`] sends to the runtime task.
enum Request {
    Command(Command),
    /// Answered after the controller has shut down, just before the task
    /// exits.
    Shutdown(oneshot::Sender<()>),
}

enum Command {
    StartScan(Reply<()>),
    StopScan(Reply<()>),
    Connect(String, Reply<SessionPhase>),
    Disconnect(Reply<()>),
    Read(Reply<Vec<u8>>),
    Write(Vec<u8>, Reply<()>),
    ToggleNotify(Reply<bool>),
    RefreshRssi(Reply<i16>),
    SetDataCallback(Option<DataCallback>, oneshot::Sender<()>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

// ── BleClient ─────────────────────────────────────────────────────────────────

/// Starts session runtimes with a fixed [`ClientConfig`].
pub struct BleClient {
    config: ClientConfig,
}

impl BleClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Spawn the runtime task over `adapter` and its event stream.
    ///
    /// Must be called from within a Tokio runtime. The task runs until
    /// [`SessionHandle::shutdown`] is called or every handle is dropped; in
    /// both cases any session is disconnected first.
    pub fn start<A: BleAdapter>(
        &self,
        adapter: A,
        adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
    ) -> (mpsc::Receiver<SessionEvent>, SessionHandle) {
        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity.max(1));
        let (request_tx, request_rx) = mpsc::channel(64);
        let controller = SessionController::new(adapter, self.config.clone());
        tokio::spawn(run(controller, request_rx, adapter_events, event_tx));
        (
            event_rx,
            SessionHandle {
                requests: request_tx,
            },
        )
    }

    /// [`BleClient::start`] over [`SimulatedAdapter::with_sample_peripherals`].
    /// The adapter is returned too, for fault injection or
    /// [`SimulatedAdapter::spawn_ticker`].
    pub fn start_simulated(
        &self,
    ) -> (mpsc::Receiver<SessionEvent>, SessionHandle, SimulatedAdapter) {
        let (adapter, adapter_events) = SimulatedAdapter::with_sample_peripherals();
        let (events, handle) = self.start(adapter.clone(), adapter_events);
        (events, handle, adapter)
    }

    /// [`BleClient::start`] over the first Bluetooth adapter of the host.
    #[cfg(feature = "platform")]
    pub async fn start_platform(
        &self,
    ) -> anyhow::Result<(mpsc::Receiver<SessionEvent>, SessionHandle)> {
        let (adapter, adapter_events) = crate::platform::PlatformAdapter::new().await?;
        Ok(self.start(adapter, adapter_events))
    }
}

// ── Runtime task ──────────────────────────────────────────────────────────────

async fn run<A: BleAdapter>(
    mut controller: SessionController<A>,
    mut requests: mpsc::Receiver<Request>,
    mut adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut adapter_open = true;
    loop {
        let deadline = controller.pending_deadline();
        let wake_at = deadline.map_or_else(Instant::now, |(_, at)| at);

        tokio::select! {
            request = requests.recv() => match request {
                Some(Request::Shutdown(done)) => {
                    info!("Session runtime shutting down");
                    controller.shutdown().await;
                    forward(&mut controller, &events);
                    let _ = done.send(());
                    return;
                }
                Some(Request::Command(command)) => dispatch(&mut controller, command).await,
                None => {
                    info!("All session handles dropped, shutting down");
                    controller.shutdown().await;
                    forward(&mut controller, &events);
                    return;
                }
            },
            event = adapter_events.recv(), if adapter_open => match event {
                Some(event) => controller.handle_event(event).await,
                None => {
                    warn!("Adapter event stream closed");
                    adapter_open = false;
                }
            },
            _ = sleep_until(wake_at), if deadline.is_some() => {
                if let Some((epoch, _)) = deadline {
                    debug!("deadline of step {epoch} reached");
                    controller.on_deadline(epoch).await;
                }
            }
        }

        forward(&mut controller, &events);
    }
}

async fn dispatch<A: BleAdapter>(controller: &mut SessionController<A>, command: Command) {
    match command {
        Command::StartScan(reply) => {
            let _ = reply.send(controller.start_scan().await);
        }
        Command::StopScan(reply) => {
            let _ = reply.send(controller.stop_scan().await);
        }
        Command::Connect(id, reply) => {
            let _ = reply.send(controller.connect(&id).await);
        }
        Command::Disconnect(reply) => {
            let _ = reply.send(controller.disconnect().await);
        }
        Command::Read(reply) => {
            let _ = reply.send(controller.read().await);
        }
        Command::Write(value, reply) => {
            let _ = reply.send(controller.write(&value).await);
        }
        Command::ToggleNotify(reply) => {
            let _ = reply.send(controller.toggle_notify().await);
        }
        Command::RefreshRssi(reply) => {
            let _ = reply.send(controller.refresh_rssi().await);
        }
        Command::SetDataCallback(callback, done) => {
            controller.set_data_callback(callback);
            let _ = done.send(());
        }
        Command::Snapshot(reply) => {
            let _ = reply.send(controller.snapshot());
        }
    }
}

/// Move emitted events to the UI channel. A full channel drops the event;
/// a closed one (nobody listening) drops silently.
fn forward<A: BleAdapter>(controller: &mut SessionController<A>, events: &mpsc::Sender<SessionEvent>) {
    for event in controller.drain_events() {
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!("Event channel full, dropping {event:?}"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

// ── SessionHandle ─────────────────────────────────────────────────────────────

/// Cloneable command interface to a running session.
///
/// Every method waits for the runtime to process the request and returns
/// its outcome. Once the runtime has stopped, every method returns
/// [`BleError::Closed`].
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<Request>,
}

impl SessionHandle {
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, BleError> {
        self.send(|tx| Request::Command(command(tx))).await
    }

    async fn send<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, BleError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .await
            .map_err(|_| BleError::Closed)?;
        rx.await.map_err(|_| BleError::Closed)
    }

    /// Clear the registry and start scanning. Ignored while a scan runs.
    pub async fn start_scan(&self) -> Result<(), BleError> {
        self.call(Command::StartScan).await?
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        self.call(Command::StopScan).await?
    }

    /// Connect to a peripheral from the registry and bind the configured
    /// characteristic. Returns once the connect has been *requested*; watch
    /// for [`SessionEvent::PhaseChanged`] to reach
    /// [`SessionPhase::Ready`].
    pub async fn connect(&self, id: &str) -> Result<SessionPhase, BleError> {
        let id = id.to_owned();
        self.call(|reply| Command::Connect(id, reply)).await?
    }

    pub async fn disconnect(&self) -> Result<(), BleError> {
        self.call(Command::Disconnect).await?
    }

    pub async fn read(&self) -> Result<Vec<u8>, BleError> {
        self.call(Command::Read).await?
    }

    pub async fn write(&self, value: impl Into<Vec<u8>>) -> Result<(), BleError> {
        let value = value.into();
        self.call(|reply| Command::Write(value, reply)).await?
    }

    /// Flip notifications on the bound characteristic; returns the new state.
    pub async fn toggle_notify(&self) -> Result<bool, BleError> {
        self.call(Command::ToggleNotify).await?
    }

    pub async fn refresh_rssi(&self) -> Result<i16, BleError> {
        self.call(Command::RefreshRssi).await?
    }

    /// Route notification payloads of the bound characteristic to
    /// `callback`, replacing any previous one. The callback runs on the
    /// runtime task and must not block.
    pub async fn on_data<F>(&self, callback: F) -> Result<(), BleError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let callback: DataCallback = Box::new(callback);
        self.call(|done| Command::SetDataCallback(Some(callback), done))
            .await
    }

    /// Remove the data callback; later notifications are dropped.
    pub async fn clear_data_callback(&self) -> Result<(), BleError> {
        self.call(|done| Command::SetDataCallback(None, done)).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, BleError> {
        self.call(Command::Snapshot).await
    }

    /// Disconnect, stop scanning, and stop the runtime task.
    pub async fn shutdown(&self) -> Result<(), BleError> {
        self.send(Request::Shutdown).await
    }

    /// `false` once the runtime task has exited.
    pub fn is_running(&self) -> bool {
        !self.requests.is_closed()
    }
}
