//! The session state machine.
//!
//! [`SessionController`] owns the [`PeripheralRegistry`], the scan state,
//! and at most one [`Session`]. It is driven by two kinds of input:
//!
//! * **commands** from UI code (`start_scan`, `connect`, `read`, …), and
//! * **adapter events** passed to [`SessionController::handle_event`].
//!
//! Every method takes `&mut self`, so two transitions can never run at the
//! same time; [`crate::client`] queues inputs in front of a single
//! controller. Connect and discovery steps are tracked as a pending step
//! with an epoch and a deadline. The epoch goes out with the adapter
//! request as its [`RequestId`] and comes back in the outcome event;
//! outcomes that do not carry the pending step's epoch (because the
//! session was disconnected or replaced in the meantime) are logged and
//! discarded.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::adapter::{AdapterEvent, BleAdapter, RequestId};
use crate::config::ClientConfig;
use crate::error::BleError;
use crate::protocol::normalize_uuid;
use crate::registry::PeripheralRegistry;
use crate::types::{
    AdapterState, BoundCharacteristic, CharacteristicRecord, ConnectionState, GattTarget,
    ScanState, ServiceRecord, Session, SessionEvent, SessionPhase, SessionSnapshot,
};

/// Receives notification payloads from the bound characteristic.
pub type DataCallback = Box<dyn FnMut(&[u8]) + Send>;

/// The asynchronous steps that end with an adapter event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Connect,
    Services,
    Characteristics,
}

#[derive(Debug, Clone)]
struct PendingStep {
    epoch: u64,
    step: Step,
    peripheral_id: String,
    /// Service whose characteristics were requested.
    service_uuid: Option<String>,
    deadline: Instant,
}

/// Registry, scan state, and the single-session state machine.
pub struct SessionController<A> {
    adapter: A,
    config: ClientConfig,
    registry: PeripheralRegistry,
    scan: ScanState,
    adapter_state: AdapterState,
    phase: SessionPhase,
    /// Peripheral the current phase refers to; `Some` whenever the phase is
    /// not `Idle`.
    peripheral_id: Option<String>,
    session: Option<Session>,
    pending: Option<PendingStep>,
    epoch: u64,
    /// Peripherals we asked the adapter to disconnect whose `Disconnected`
    /// event has not arrived yet.
    own_disconnects: HashSet<String>,
    on_data: Option<DataCallback>,
    outbox: VecDeque<SessionEvent>,
}

impl<A: BleAdapter> SessionController<A> {
    pub fn new(adapter: A, config: ClientConfig) -> Self {
        Self {
            adapter,
            config,
            registry: PeripheralRegistry::new(),
            scan: ScanState::default(),
            adapter_state: AdapterState::Unknown,
            phase: SessionPhase::Idle,
            peripheral_id: None,
            session: None,
            pending: None,
            epoch: 0,
            own_disconnects: HashSet::new(),
            on_data: None,
            outbox: VecDeque::new(),
        }
    }

    // ── Read-only state ──────────────────────────────────────────────────────

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn peripheral_id(&self) -> Option<&str> {
        self.peripheral_id.as_deref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn registry(&self) -> &PeripheralRegistry {
        &self.registry
    }

    pub fn scan(&self) -> ScanState {
        self.scan
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter_state
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            peripheral_id: self.peripheral_id.clone(),
            session: self.session.clone(),
            scan: self.scan,
            adapter_state: self.adapter_state,
            peripherals: self.registry.list().to_vec(),
        }
    }

    /// Epoch and deadline of the connect / discovery step in flight.
    pub fn pending_deadline(&self) -> Option<(u64, Instant)> {
        self.pending.as_ref().map(|p| (p.epoch, p.deadline))
    }

    /// Take every event emitted since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.outbox.drain(..).collect()
    }

    /// Install (or remove) the notification sink. Notifications that
    /// arrive while no callback is installed are dropped.
    pub fn set_data_callback(&mut self, callback: Option<DataCallback>) {
        self.on_data = callback;
    }

    // ── Scanning ─────────────────────────────────────────────────────────────

    /// Clear the registry and start a new scan. No-op while one is running.
    ///
    /// The record of the session's peripheral survives the clear, so the
    /// snapshot keeps showing its link state and services.
    pub async fn start_scan(&mut self) -> Result<(), BleError> {
        if self.scan.active {
            debug!("start_scan: scan already active");
            return Ok(());
        }
        self.registry.clear_except(self.peripheral_id.as_deref());
        let request = self.config.scan_request();
        info!(
            "Scanning for {} s (filter: {} service(s), duplicates: {})",
            request.timeout_secs,
            request.service_uuids.len(),
            request.allow_duplicates
        );
        bounded(self.config.step_timeout, "start_scan", self.adapter.start_scan(&request))
            .await
            .map_err(BleError::Scan)?;
        self.set_scanning(true);
        Ok(())
    }

    pub async fn stop_scan(&mut self) -> Result<(), BleError> {
        if !self.scan.active {
            return Ok(());
        }
        bounded(self.config.step_timeout, "stop_scan", self.adapter.stop_scan())
            .await
            .map_err(BleError::Scan)?;
        self.set_scanning(false);
        Ok(())
    }

    // ── Session commands ─────────────────────────────────────────────────────

    /// Start a session with peripheral `id`.
    ///
    /// * Unknown ids fail with [`BleError::NotFound`].
    /// * A connect to the peripheral that is already connecting or
    ///   connected returns the current phase and does nothing else.
    /// * Any other active session is disconnected first.
    ///
    /// On success the controller is `Connecting`; the adapter's
    /// [`AdapterEvent::Connected`] moves it on.
    pub async fn connect(&mut self, id: &str) -> Result<SessionPhase, BleError> {
        if !self.registry.contains(id) {
            return Err(BleError::NotFound(format!("peripheral {id}")));
        }
        if self.phase.is_active() && self.peripheral_id.as_deref() == Some(id) {
            debug!("connect: {id} is already {}", self.phase);
            return Ok(self.phase);
        }
        if self.phase != SessionPhase::Idle {
            info!(
                "connect: disconnecting {} before connecting to {id}",
                self.peripheral_id.as_deref().unwrap_or("?")
            );
            self.disconnect().await?;
        }

        self.peripheral_id = Some(id.to_owned());
        self.registry
            .set_connection_state(id, ConnectionState::Connecting);
        let request = self.begin_step(Step::Connect, id, None);
        self.set_phase(SessionPhase::Connecting);
        info!("Connecting to {id} …");

        match bounded(
            self.config.step_timeout,
            "connect",
            self.adapter.connect(id, request),
        )
        .await
        {
            Ok(()) => Ok(self.phase),
            Err(msg) => {
                warn!("connect to {id} rejected: {msg}");
                self.reset_to_idle();
                Err(BleError::Connection(msg))
            }
        }
    }

    /// Tear the session down. Always ends in `Idle`, even when the adapter
    /// reports an error; those are logged.
    pub async fn disconnect(&mut self) -> Result<(), BleError> {
        if self.phase == SessionPhase::Idle {
            return Err(BleError::invalid_state("disconnect", self.phase));
        }
        let Some(id) = self.peripheral_id.clone() else {
            self.reset_to_idle();
            return Ok(());
        };

        self.pending = None;
        self.epoch += 1;
        self.registry
            .set_connection_state(&id, ConnectionState::Disconnecting);
        self.set_phase(SessionPhase::Disconnecting);

        let subscribed = self
            .session
            .as_ref()
            .filter(|s| s.notify_enabled)
            .and_then(|s| s.characteristic.clone());
        if let Some(bound) = subscribed {
            if let Err(msg) = bounded(
                self.config.step_timeout,
                "unsubscribe",
                self.adapter.unsubscribe(&bound.target),
            )
            .await
            {
                warn!("unsubscribe during disconnect failed: {msg}");
            }
        }

        match bounded(self.config.step_timeout, "disconnect", self.adapter.disconnect(&id)).await {
            Ok(()) => {
                self.own_disconnects.insert(id.clone());
            }
            Err(msg) => {
                warn!("disconnect from {id} reported an error: {msg} (resetting anyway)");
            }
        }

        info!("Disconnected from {id}");
        if let Some(id) = self.reset_to_idle() {
            self.emit(SessionEvent::Disconnected {
                peripheral_id: id,
                reason: None,
            });
        }
        Ok(())
    }

    /// Read the bound characteristic.
    pub async fn read(&mut self) -> Result<Vec<u8>, BleError> {
        let bound = self.bound_characteristic("read")?;
        let value = bounded(self.config.step_timeout, "read", self.adapter.read(&bound.target))
            .await
            .map_err(BleError::Read)?;
        debug!(
            "read {} byte(s) from {}",
            value.len(),
            bound.target.characteristic_uuid
        );
        Ok(value)
    }

    /// Write `value` to the bound characteristic, split into
    /// `write_chunk_size` pieces when that is set. A failed piece aborts
    /// the rest.
    pub async fn write(&mut self, value: &[u8]) -> Result<(), BleError> {
        let bound = self.bound_characteristic("write")?;
        let pieces: Vec<&[u8]> = match self.config.write_chunk_size {
            Some(size) if size > 0 && value.len() > size => value.chunks(size).collect(),
            _ => vec![value],
        };
        for piece in &pieces {
            bounded(
                self.config.step_timeout,
                "write",
                self.adapter
                    .write(&bound.target, piece, self.config.write_with_response),
            )
            .await
            .map_err(BleError::Write)?;
        }
        debug!(
            "wrote {} byte(s) in {} piece(s) to {}",
            value.len(),
            pieces.len(),
            bound.target.characteristic_uuid
        );
        Ok(())
    }

    /// Subscribe to the bound characteristic, or unsubscribe if already
    /// subscribed. Returns the new `notify_enabled` value. On failure the
    /// flag keeps its previous value.
    pub async fn toggle_notify(&mut self) -> Result<bool, BleError> {
        let bound = self.bound_characteristic("toggle notify")?;
        if !bound.supports_notify {
            return Err(BleError::Subscription(format!(
                "characteristic {} does not support notify",
                bound.target.characteristic_uuid
            )));
        }
        let enabled = self.session.as_ref().is_some_and(|s| s.notify_enabled);

        let result = if enabled {
            bounded(
                self.config.step_timeout,
                "unsubscribe",
                self.adapter.unsubscribe(&bound.target),
            )
            .await
        } else {
            bounded(
                self.config.step_timeout,
                "subscribe",
                self.adapter.subscribe(&bound.target),
            )
            .await
        };
        result.map_err(BleError::Subscription)?;

        let now = !enabled;
        if let Some(session) = self.session.as_mut() {
            session.notify_enabled = now;
        }
        self.registry.set_subscribed(&bound.target, now);
        info!(
            "Notifications {} on {}",
            if now { "enabled" } else { "disabled" },
            bound.target.characteristic_uuid
        );
        Ok(now)
    }

    /// Read the signal strength of the connected peripheral into the
    /// registry.
    pub async fn refresh_rssi(&mut self) -> Result<i16, BleError> {
        if self.phase != SessionPhase::Ready {
            return Err(BleError::invalid_state("refresh rssi", self.phase));
        }
        let Some(id) = self.peripheral_id.clone() else {
            return Err(BleError::invalid_state("refresh rssi", self.phase));
        };
        let rssi = bounded(self.config.step_timeout, "read_rssi", self.adapter.read_rssi(&id))
            .await
            .map_err(BleError::Read)?;
        self.registry.set_rssi(&id, rssi);
        self.emit(SessionEvent::RssiUpdated { id, rssi });
        Ok(rssi)
    }

    /// Disconnect any session and stop scanning. Errors are logged.
    pub async fn shutdown(&mut self) {
        if self.phase != SessionPhase::Idle {
            let _ = self.disconnect().await;
        }
        if let Err(e) = self.stop_scan().await {
            warn!("shutdown: {e}");
        }
    }

    // ── Adapter events ───────────────────────────────────────────────────────

    pub async fn handle_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Discovered(discovery) => {
                let id = discovery.id.clone();
                if self.registry.upsert(discovery) {
                    self.emit(SessionEvent::PeripheralDiscovered { id });
                }
            }
            AdapterEvent::Connected {
                peripheral_id,
                request,
                error,
            } => {
                self.on_connected(&peripheral_id, request, error).await;
            }
            AdapterEvent::Disconnected {
                peripheral_id,
                error,
            } => {
                self.on_disconnected(&peripheral_id, error);
            }
            AdapterEvent::ServicesDiscovered {
                peripheral_id,
                request,
                services,
                error,
            } => {
                self.on_services_discovered(&peripheral_id, request, services, error)
                    .await;
            }
            AdapterEvent::CharacteristicsDiscovered {
                peripheral_id,
                request,
                service_uuid,
                characteristics,
                error,
            } => {
                self.on_characteristics_discovered(
                    &peripheral_id,
                    request,
                    &service_uuid,
                    characteristics,
                    error,
                )
                .await;
            }
            AdapterEvent::CharacteristicData {
                peripheral_id,
                characteristic_uuid,
                value,
                is_notification,
            } => {
                self.on_characteristic_data(
                    &peripheral_id,
                    &characteristic_uuid,
                    &value,
                    is_notification,
                );
            }
            AdapterEvent::ScanStarted => self.set_scanning(true),
            AdapterEvent::ScanStopped => self.set_scanning(false),
            AdapterEvent::StateChanged(state) => self.on_adapter_state(state),
        }
    }

    /// Outcome of connect request `request`. Returns `false` when it did
    /// not belong to the pending step and was discarded.
    pub async fn on_connected(
        &mut self,
        id: &str,
        request: RequestId,
        error: Option<String>,
    ) -> bool {
        if !self.is_pending(Step::Connect, id, request, None) {
            debug!("discarding stale connect outcome for {id} (request {request})");
            return false;
        }
        if let Some(e) = error {
            warn!("connect to {id} failed: {e}");
            self.reset_to_idle();
            self.emit(SessionEvent::Failed(BleError::Connection(e)));
            return true;
        }

        info!("Connected to {id}, discovering services …");
        // Any disconnect still owed to us belongs to an earlier link.
        self.own_disconnects.remove(id);
        self.registry
            .set_connection_state(id, ConnectionState::Connected);
        let request = self.begin_step(Step::Services, id, None);
        self.set_phase(SessionPhase::ServiceDiscovery);

        if let Err(msg) = bounded(
            self.config.step_timeout,
            "discover_services",
            self.adapter.discover_services(id, request),
        )
        .await
        {
            self.abort(BleError::Discovery(msg)).await;
        }
        true
    }

    /// Services of the session's peripheral. Only applied in
    /// `ServiceDiscovery`; anything else is a late callback and is dropped.
    pub async fn on_services_discovered(
        &mut self,
        id: &str,
        request: RequestId,
        services: Vec<ServiceRecord>,
        error: Option<String>,
    ) -> bool {
        if self.phase != SessionPhase::ServiceDiscovery
            || !self.is_pending(Step::Services, id, request, None)
        {
            debug!("discarding stale service discovery for {id} (request {request})");
            return false;
        }
        if let Some(e) = error {
            self.abort(BleError::Discovery(e)).await;
            return true;
        }

        let services: Vec<ServiceRecord> = services.into_iter().map(normalize_service).collect();
        let target = self.config.target.clone();
        let found = services.iter().any(|s| s.uuid == target.service_uuid);
        debug!("{id}: {} service(s) discovered", services.len());
        self.registry.set_services(id, services);
        self.session = Some(Session {
            peripheral_id: id.to_owned(),
            target_service_uuid: target.service_uuid.clone(),
            target_characteristic_uuid: target.characteristic_uuid.clone(),
            notify_enabled: false,
            characteristic: None,
        });

        if !found {
            warn!("{id}: target service {} not found", target.service_uuid);
            self.pending = None;
            self.emit(SessionEvent::TargetNotFound {
                peripheral_id: id.to_owned(),
                uuid: target.service_uuid,
            });
            self.set_phase(SessionPhase::Ready);
            self.refresh_rssi_quietly().await;
            return true;
        }

        let request = self.begin_step(Step::Characteristics, id, Some(&target.service_uuid));
        self.set_phase(SessionPhase::CharacteristicDiscovery);
        let filter = [target.characteristic_uuid];
        if let Err(msg) = bounded(
            self.config.step_timeout,
            "discover_characteristics",
            self.adapter
                .discover_characteristics(id, request, &target.service_uuid, &filter),
        )
        .await
        {
            self.abort(BleError::Discovery(msg)).await;
        }
        true
    }

    /// Characteristics of the target service. Binds the target
    /// characteristic (if present) and moves to `Ready`.
    pub async fn on_characteristics_discovered(
        &mut self,
        id: &str,
        request: RequestId,
        service_uuid: &str,
        characteristics: Vec<CharacteristicRecord>,
        error: Option<String>,
    ) -> bool {
        let service_uuid = normalize_uuid(service_uuid);
        if self.phase != SessionPhase::CharacteristicDiscovery
            || !self.is_pending(Step::Characteristics, id, request, Some(&service_uuid))
        {
            debug!("discarding stale characteristic discovery for {id} (request {request})");
            return false;
        }
        if let Some(e) = error {
            self.abort(BleError::Discovery(e)).await;
            return true;
        }

        let characteristics: Vec<CharacteristicRecord> = characteristics
            .into_iter()
            .map(|mut c| {
                c.uuid = normalize_uuid(&c.uuid);
                c
            })
            .collect();
        let target_uuid = self.config.target.characteristic_uuid.clone();
        let bound = characteristics
            .iter()
            .find(|c| c.uuid == target_uuid)
            .map(|c| BoundCharacteristic {
                target: GattTarget {
                    peripheral_id: id.to_owned(),
                    service_uuid: service_uuid.clone(),
                    characteristic_uuid: c.uuid.clone(),
                },
                supports_notify: c.supports_notify,
            });

        if let Some(record) = self.registry.get(id) {
            let mut services = record.services.clone();
            match services.iter_mut().find(|s| s.uuid == service_uuid) {
                Some(service) => service.characteristics = characteristics,
                None => services.push(ServiceRecord::with_characteristics(
                    service_uuid.clone(),
                    characteristics,
                )),
            }
            self.registry.set_services(id, services);
        }

        self.pending = None;
        if let Some(session) = self.session.as_mut() {
            session.characteristic = bound.clone();
        }
        match &bound {
            Some(b) => info!(
                "{id}: bound characteristic {} (notify: {})",
                b.target.characteristic_uuid, b.supports_notify
            ),
            None => {
                warn!("{id}: target characteristic {target_uuid} not found");
                self.emit(SessionEvent::TargetNotFound {
                    peripheral_id: id.to_owned(),
                    uuid: target_uuid,
                });
            }
        }
        self.set_phase(SessionPhase::Ready);
        self.refresh_rssi_quietly().await;
        true
    }

    /// A value from a peripheral. Notifications on the bound characteristic
    /// go to the data callback while notify is enabled; everything else is
    /// dropped. Returns `true` when the callback ran.
    pub fn on_characteristic_data(
        &mut self,
        id: &str,
        characteristic_uuid: &str,
        value: &[u8],
        is_notification: bool,
    ) -> bool {
        let uuid = normalize_uuid(characteristic_uuid);
        if !is_notification {
            debug!("{id}: value for {uuid} ({} byte(s))", value.len());
            return false;
        }
        let subscribed = self.session.as_ref().is_some_and(|s| {
            s.notify_enabled
                && s.peripheral_id == id
                && s.characteristic
                    .as_ref()
                    .is_some_and(|b| b.target.characteristic_uuid == uuid)
        });
        if !subscribed {
            debug!("{id}: dropping notification on {uuid} (not subscribed)");
            return false;
        }
        match self.on_data.as_mut() {
            Some(callback) => {
                callback(value);
                true
            }
            None => {
                debug!("{id}: no data callback, notification dropped");
                false
            }
        }
    }

    /// The deadline of step `epoch` passed. Fails the step if it is still
    /// pending; returns `false` for deadlines of finished steps.
    pub async fn on_deadline(&mut self, epoch: u64) -> bool {
        let Some(pending) = self.pending.as_ref().filter(|p| p.epoch == epoch) else {
            return false;
        };
        let limit = self.config.step_timeout;
        let error = match pending.step {
            Step::Connect => BleError::Connection(format!(
                "connect to {} timed out after {limit:?}",
                pending.peripheral_id
            )),
            Step::Services => {
                BleError::Discovery(format!("service discovery timed out after {limit:?}"))
            }
            Step::Characteristics => BleError::Discovery(format!(
                "characteristic discovery timed out after {limit:?}"
            )),
        };
        self.abort(error).await;
        true
    }

    fn on_disconnected(&mut self, id: &str, error: Option<String>) {
        let requested = self.own_disconnects.remove(id);
        let ours = self.peripheral_id.as_deref() == Some(id);
        if ours && self.phase.is_linked() {
            let reason = error.unwrap_or_else(|| "link lost".to_owned());
            warn!("Link to {id} lost: {reason}");
            if let Some(id) = self.reset_to_idle() {
                self.emit(SessionEvent::Disconnected {
                    peripheral_id: id,
                    reason: Some(reason),
                });
            }
            return;
        }
        if ours && requested {
            // The end of the earlier link we tore down ourselves.
            debug!("ignoring requested disconnect of {id} while {}", self.phase);
            return;
        }
        if ours && self.phase == SessionPhase::Connecting {
            let reason = error.unwrap_or_else(|| "link dropped".to_owned());
            warn!("connect to {id} failed: {reason}");
            self.reset_to_idle();
            self.emit(SessionEvent::Failed(BleError::Connection(format!(
                "{id} disconnected while connecting: {reason}"
            ))));
            return;
        }
        if self.registry.contains(id) {
            self.registry
                .set_connection_state(id, ConnectionState::Disconnected);
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        if self.adapter_state == state {
            return;
        }
        info!("Adapter state: {state:?}");
        self.adapter_state = state;
        self.emit(SessionEvent::AdapterStateChanged(state));
        if state != AdapterState::PoweredOff {
            return;
        }
        self.set_scanning(false);
        if self.phase != SessionPhase::Idle {
            if let Some(id) = self.reset_to_idle() {
                self.emit(SessionEvent::Disconnected {
                    peripheral_id: id,
                    reason: Some("adapter powered off".to_owned()),
                });
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn bound_characteristic(
        &self,
        operation: &'static str,
    ) -> Result<BoundCharacteristic, BleError> {
        if self.phase != SessionPhase::Ready {
            return Err(BleError::invalid_state(operation, self.phase));
        }
        self.session
            .as_ref()
            .and_then(|s| s.characteristic.clone())
            .ok_or_else(|| {
                BleError::NotFound(format!(
                    "characteristic {}",
                    self.config.target.characteristic_uuid
                ))
            })
    }

    fn is_pending(
        &self,
        step: Step,
        id: &str,
        request: RequestId,
        service_uuid: Option<&str>,
    ) -> bool {
        self.pending.as_ref().is_some_and(|p| {
            p.epoch == request
                && p.step == step
                && p.peripheral_id == id
                && p.service_uuid.as_deref() == service_uuid
        })
    }

    /// Make `step` the pending step and return its epoch, which doubles as
    /// the adapter request token.
    fn begin_step(&mut self, step: Step, id: &str, service_uuid: Option<&str>) -> RequestId {
        self.epoch += 1;
        self.pending = Some(PendingStep {
            epoch: self.epoch,
            step,
            peripheral_id: id.to_owned(),
            service_uuid: service_uuid.map(str::to_owned),
            deadline: Instant::now() + self.config.step_timeout,
        });
        self.epoch
    }

    /// Fail the session: best-effort disconnect, back to `Idle`, report.
    async fn abort(&mut self, error: BleError) {
        warn!("{error}; tearing the session down");
        self.pending = None;
        self.epoch += 1;
        let linked = self.phase.is_linked();
        if let Some(id) = self.peripheral_id.clone() {
            match bounded(self.config.step_timeout, "disconnect", self.adapter.disconnect(&id)).await
            {
                Ok(()) => {
                    self.own_disconnects.insert(id);
                }
                Err(msg) => debug!("disconnect after failure: {msg}"),
            }
        }
        if let Some(id) = self.reset_to_idle() {
            if linked {
                self.emit(SessionEvent::Disconnected {
                    peripheral_id: id,
                    reason: Some(error.to_string()),
                });
            }
        }
        self.emit(SessionEvent::Failed(error));
    }

    /// Drop the session and pending step and return to `Idle`. Returns the
    /// peripheral the session referred to.
    fn reset_to_idle(&mut self) -> Option<String> {
        self.pending = None;
        self.epoch += 1;
        if let Some(session) = self.session.take() {
            if session.notify_enabled {
                if let Some(bound) = &session.characteristic {
                    self.registry.set_subscribed(&bound.target, false);
                }
            }
        }
        let id = self.peripheral_id.take();
        if let Some(id) = &id {
            self.registry
                .set_connection_state(id, ConnectionState::Disconnected);
        }
        self.set_phase(SessionPhase::Idle);
        id
    }

    async fn refresh_rssi_quietly(&mut self) {
        if let Err(e) = self.refresh_rssi().await {
            debug!("rssi refresh skipped: {e}");
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase == phase {
            return;
        }
        debug!("session: {} → {phase}", self.phase);
        self.phase = phase;
        self.emit(SessionEvent::PhaseChanged {
            peripheral_id: self.peripheral_id.clone(),
            phase,
        });
    }

    fn set_scanning(&mut self, active: bool) {
        if self.scan.active == active {
            return;
        }
        self.scan.active = active;
        self.emit(if active {
            SessionEvent::ScanStarted
        } else {
            SessionEvent::ScanStopped
        });
    }

    fn emit(&mut self, event: SessionEvent) {
        self.outbox.push_back(event);
    }
}

fn normalize_service(mut service: ServiceRecord) -> ServiceRecord {
    service.uuid = normalize_uuid(&service.uuid);
    for c in &mut service.characteristics {
        c.uuid = normalize_uuid(&c.uuid);
    }
    service
}

/// Run an adapter call with an upper bound, flattening both failure modes
/// into a message.
async fn bounded<T, F>(limit: Duration, what: &str, call: F) -> Result<T, String>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(_) => Err(format!("{what}() timed out after {limit:?}")),
    }
}
