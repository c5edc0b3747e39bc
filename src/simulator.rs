//! In-process BLE adapter with scripted peripherals.
//!
//! Used by the test-suite and by the `--simulate` mode of both binaries.
//! Every command is recorded as an [`AdapterCall`]; commands can be made to
//! fail with [`SimulatedAdapter::set_fault`]. In the default *responsive*
//! mode the adapter answers its own requests on the event stream the way a
//! real radio would. The *manual* mode only records and acknowledges, so a
//! test can inject each [`AdapterEvent`] itself and control the ordering.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::adapter::{AdapterEvent, BleAdapter, RequestId, ScanRequest};
use crate::protocol::normalize_uuid;
use crate::types::{CharacteristicRecord, DiscoveryEvent, GattTarget, ServiceRecord};

/// A scripted peripheral.
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub id: String,
    pub name: Option<String>,
    pub rssi: i16,
    /// Full GATT table including characteristics. Services are advertised
    /// in scan reports.
    pub services: Vec<ServiceRecord>,
}

impl SimulatedPeripheral {
    /// A peripheral exposing one service with one characteristic.
    pub fn new(
        id: &str,
        name: Option<&str>,
        rssi: i16,
        service_uuid: &str,
        characteristic_uuid: &str,
        supports_notify: bool,
    ) -> Self {
        Self {
            id: id.to_owned(),
            name: name.map(str::to_owned),
            rssi,
            services: vec![ServiceRecord::with_characteristics(
                normalize_uuid(service_uuid),
                vec![CharacteristicRecord::new(
                    normalize_uuid(characteristic_uuid),
                    supports_notify,
                )],
            )],
        }
    }
}

/// One command received by the adapter, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    StartScan(ScanRequest),
    StopScan,
    Connect(String),
    Disconnect(String),
    DiscoverServices(String),
    DiscoverCharacteristics {
        peripheral_id: String,
        service_uuid: String,
        uuid_filter: Vec<String>,
    },
    Read(GattTarget),
    Write {
        target: GattTarget,
        value: Vec<u8>,
        with_response: bool,
    },
    Subscribe(GattTarget),
    Unsubscribe(GattTarget),
    ReadRssi(String),
}

/// Commands that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Scan,
    /// `connect` is rejected outright.
    Connect,
    /// `connect` is accepted but the `Connected` event carries an error.
    ConnectEvent,
    Disconnect,
    /// The `ServicesDiscovered` event carries an error.
    DiscoverServices,
    Read,
    Write,
    Subscribe,
    Unsubscribe,
    Rssi,
}

#[derive(Default)]
struct SimState {
    calls: Vec<AdapterCall>,
    faults: HashSet<Fault>,
    connected: HashSet<String>,
    subscriptions: HashSet<GattTarget>,
    values: HashMap<GattTarget, Vec<u8>>,
    /// Bumped by every scan so a timer only stops the scan that started it.
    scan_generation: u64,
}

struct Inner {
    events: mpsc::UnboundedSender<AdapterEvent>,
    peripherals: Vec<SimulatedPeripheral>,
    responsive: bool,
    state: Mutex<SimState>,
}

/// Cloneable handle; all clones share calls, faults and GATT state.
#[derive(Clone)]
pub struct SimulatedAdapter {
    inner: Arc<Inner>,
}

impl SimulatedAdapter {
    /// A responsive adapter that answers its own requests.
    pub fn new(
        peripherals: Vec<SimulatedPeripheral>,
    ) -> (Self, mpsc::UnboundedReceiver<AdapterEvent>) {
        Self::build(peripherals, true)
    }

    /// An adapter that records and acknowledges commands but never emits
    /// events by itself.
    pub fn manual(
        peripherals: Vec<SimulatedPeripheral>,
    ) -> (Self, mpsc::UnboundedReceiver<AdapterEvent>) {
        Self::build(peripherals, false)
    }

    /// The demo set used by `--simulate`:
    ///
    /// | id | name | GATT |
    /// |---|---|---|
    /// | `AA:BB` | `echo` | `ec00` / `ec0e` (notify, echoes writes) |
    /// | `C0:FF:EE:00:00:01` | `HRM` | `180d` / `2a37` (notify) |
    /// | `12:34:56:78:9A:BC` | – | `180f` / `2a19` (read only) |
    pub fn with_sample_peripherals() -> (Self, mpsc::UnboundedReceiver<AdapterEvent>) {
        Self::new(sample_peripherals())
    }

    fn build(
        peripherals: Vec<SimulatedPeripheral>,
        responsive: bool,
    ) -> (Self, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            events,
            peripherals,
            responsive,
            state: Mutex::new(SimState::default()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Push an event onto the stream as if the radio had produced it.
    pub fn inject(&self, event: AdapterEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Commands received so far.
    pub fn calls(&self) -> Vec<AdapterCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn set_fault(&self, fault: Fault) {
        self.state().faults.insert(fault);
    }

    pub fn clear_fault(&self, fault: Fault) {
        self.state().faults.remove(&fault);
    }

    /// Characteristics that currently hold a subscription.
    pub fn subscriptions(&self) -> Vec<GattTarget> {
        self.state().subscriptions.iter().cloned().collect()
    }

    /// Emit a notification with a fresh value on every subscribed
    /// characteristic each `period`, like a heart-rate strap would.
    pub fn spawn_ticker(&self, period: Duration) -> JoinHandle<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut beat: u8 = 0;
            loop {
                interval.tick().await;
                beat = beat.wrapping_add(1);
                let targets = adapter.subscriptions();
                for target in targets {
                    // Heart Rate Measurement layout: flags byte + u8 bpm.
                    let bpm = 60 + (beat % 40);
                    adapter.inject(AdapterEvent::CharacteristicData {
                        peripheral_id: target.peripheral_id.clone(),
                        characteristic_uuid: target.characteristic_uuid.clone(),
                        value: vec![0x00, bpm],
                        is_notification: true,
                    });
                }
            }
        })
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A panic while holding the lock only happens inside a failing
        // test; the state is still usable for reporting.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: AdapterCall) {
        self.state().calls.push(call);
    }

    fn has_fault(&self, fault: Fault) -> bool {
        self.state().faults.contains(&fault)
    }

    fn emit(&self, event: AdapterEvent) {
        if self.inner.responsive {
            self.inject(event);
        }
    }

    fn peripheral(&self, id: &str) -> Result<&SimulatedPeripheral> {
        self.inner
            .peripherals
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| anyhow!("unknown peripheral {id}"))
    }

    fn characteristic(&self, target: &GattTarget) -> Result<&CharacteristicRecord> {
        self.peripheral(&target.peripheral_id)?
            .services
            .iter()
            .filter(|s| s.uuid == target.service_uuid)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == target.characteristic_uuid)
            .ok_or_else(|| anyhow!("characteristic {} not found", target.characteristic_uuid))
    }

    fn ensure_connected(&self, id: &str) -> Result<()> {
        if !self.state().connected.contains(id) && self.inner.responsive {
            bail!("peripheral {id} is not connected");
        }
        Ok(())
    }
}

impl BleAdapter for SimulatedAdapter {
    async fn start_scan(&self, request: &ScanRequest) -> Result<()> {
        self.record(AdapterCall::StartScan(request.clone()));
        if self.has_fault(Fault::Scan) {
            bail!("simulated scan failure");
        }
        let generation = {
            let mut state = self.state();
            state.scan_generation += 1;
            state.scan_generation
        };
        self.emit(AdapterEvent::ScanStarted);
        if self.inner.responsive && request.timeout_secs > 0 {
            let adapter = self.clone();
            let timeout = Duration::from_secs(request.timeout_secs);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if adapter.state().scan_generation == generation {
                    debug!("simulator: scan timed out");
                    adapter.emit(AdapterEvent::ScanStopped);
                }
            });
        }
        for p in &self.inner.peripherals {
            let advertised: Vec<String> = p.services.iter().map(|s| s.uuid.clone()).collect();
            let matches = request.service_uuids.is_empty()
                || advertised.iter().any(|u| request.service_uuids.contains(u));
            if matches {
                self.emit(AdapterEvent::Discovered(DiscoveryEvent {
                    id: p.id.clone(),
                    name: p.name.clone(),
                    rssi: p.rssi,
                    service_uuids: advertised,
                }));
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(AdapterCall::StopScan);
        self.state().scan_generation += 1;
        self.emit(AdapterEvent::ScanStopped);
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str, request: RequestId) -> Result<()> {
        self.record(AdapterCall::Connect(peripheral_id.to_owned()));
        self.peripheral(peripheral_id)?;
        if self.has_fault(Fault::Connect) {
            bail!("simulated connect rejection");
        }
        if self.has_fault(Fault::ConnectEvent) {
            self.emit(AdapterEvent::Connected {
                peripheral_id: peripheral_id.to_owned(),
                request,
                error: Some("simulated link failure".into()),
            });
            return Ok(());
        }
        self.state().connected.insert(peripheral_id.to_owned());
        info!("simulator: {peripheral_id} connected");
        self.emit(AdapterEvent::Connected {
            peripheral_id: peripheral_id.to_owned(),
            request,
            error: None,
        });
        Ok(())
    }

    async fn disconnect(&self, peripheral_id: &str) -> Result<()> {
        self.record(AdapterCall::Disconnect(peripheral_id.to_owned()));
        {
            let mut state = self.state();
            state.connected.remove(peripheral_id);
            state
                .subscriptions
                .retain(|t| t.peripheral_id != peripheral_id);
        }
        if self.has_fault(Fault::Disconnect) {
            bail!("simulated disconnect failure");
        }
        self.emit(AdapterEvent::Disconnected {
            peripheral_id: peripheral_id.to_owned(),
            error: None,
        });
        Ok(())
    }

    async fn discover_services(&self, peripheral_id: &str, request: RequestId) -> Result<()> {
        self.record(AdapterCall::DiscoverServices(peripheral_id.to_owned()));
        self.ensure_connected(peripheral_id)?;
        let peripheral = self.peripheral(peripheral_id)?;
        if self.has_fault(Fault::DiscoverServices) {
            self.emit(AdapterEvent::ServicesDiscovered {
                peripheral_id: peripheral_id.to_owned(),
                request,
                services: vec![],
                error: Some("simulated GATT error".into()),
            });
            return Ok(());
        }
        let services = peripheral
            .services
            .iter()
            .map(|s| ServiceRecord::new(s.uuid.clone()))
            .collect();
        self.emit(AdapterEvent::ServicesDiscovered {
            peripheral_id: peripheral_id.to_owned(),
            request,
            services,
            error: None,
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral_id: &str,
        request: RequestId,
        service_uuid: &str,
        uuid_filter: &[String],
    ) -> Result<()> {
        self.record(AdapterCall::DiscoverCharacteristics {
            peripheral_id: peripheral_id.to_owned(),
            service_uuid: service_uuid.to_owned(),
            uuid_filter: uuid_filter.to_vec(),
        });
        self.ensure_connected(peripheral_id)?;
        let service = self
            .peripheral(peripheral_id)?
            .services
            .iter()
            .find(|s| s.uuid == service_uuid)
            .ok_or_else(|| anyhow!("service {service_uuid} not found"))?;
        let characteristics = service
            .characteristics
            .iter()
            .filter(|c| uuid_filter.is_empty() || uuid_filter.contains(&c.uuid))
            .cloned()
            .collect();
        self.emit(AdapterEvent::CharacteristicsDiscovered {
            peripheral_id: peripheral_id.to_owned(),
            request,
            service_uuid: service_uuid.to_owned(),
            characteristics,
            error: None,
        });
        Ok(())
    }

    async fn read(&self, target: &GattTarget) -> Result<Vec<u8>> {
        self.record(AdapterCall::Read(target.clone()));
        if self.has_fault(Fault::Read) {
            bail!("simulated read failure");
        }
        self.characteristic(target)?;
        Ok(self
            .state()
            .values
            .get(target)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&self, target: &GattTarget, value: &[u8], with_response: bool) -> Result<()> {
        self.record(AdapterCall::Write {
            target: target.clone(),
            value: value.to_vec(),
            with_response,
        });
        if self.has_fault(Fault::Write) {
            bail!("simulated write rejection");
        }
        self.characteristic(target)?;
        let echo = {
            let mut state = self.state();
            state.values.insert(target.clone(), value.to_vec());
            state.subscriptions.contains(target)
        };
        if echo {
            debug!("simulator: echoing {} byte(s) as a notification", value.len());
            self.emit(AdapterEvent::CharacteristicData {
                peripheral_id: target.peripheral_id.clone(),
                characteristic_uuid: target.characteristic_uuid.clone(),
                value: value.to_vec(),
                is_notification: true,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, target: &GattTarget) -> Result<()> {
        self.record(AdapterCall::Subscribe(target.clone()));
        if self.has_fault(Fault::Subscribe) {
            bail!("simulated subscribe failure");
        }
        if !self.characteristic(target)?.supports_notify {
            bail!("characteristic does not support notify");
        }
        self.state().subscriptions.insert(target.clone());
        Ok(())
    }

    async fn unsubscribe(&self, target: &GattTarget) -> Result<()> {
        self.record(AdapterCall::Unsubscribe(target.clone()));
        if self.has_fault(Fault::Unsubscribe) {
            bail!("simulated unsubscribe failure");
        }
        self.state().subscriptions.remove(target);
        Ok(())
    }

    async fn read_rssi(&self, peripheral_id: &str) -> Result<i16> {
        self.record(AdapterCall::ReadRssi(peripheral_id.to_owned()));
        if self.has_fault(Fault::Rssi) {
            bail!("simulated rssi failure");
        }
        Ok(self.peripheral(peripheral_id)?.rssi)
    }
}

fn sample_peripherals() -> Vec<SimulatedPeripheral> {
    vec![
        SimulatedPeripheral::new("AA:BB", Some("echo"), -40, "ec00", "ec0e", true),
        SimulatedPeripheral::new("C0:FF:EE:00:00:01", Some("HRM"), -62, "180d", "2a37", true),
        SimulatedPeripheral::new("12:34:56:78:9A:BC", None, -81, "180f", "2a19", false),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_target() -> GattTarget {
        GattTarget {
            peripheral_id: "AA:BB".into(),
            service_uuid: normalize_uuid("ec00"),
            characteristic_uuid: normalize_uuid("ec0e"),
        }
    }

    #[tokio::test]
    async fn scan_reports_every_sample_peripheral() {
        let (adapter, mut rx) = SimulatedAdapter::with_sample_peripherals();
        adapter
            .start_scan(&ScanRequest {
                service_uuids: vec![],
                timeout_secs: 10,
                allow_duplicates: true,
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(AdapterEvent::ScanStarted));
        let mut ids = vec![];
        while let Ok(AdapterEvent::Discovered(d)) = rx.try_recv() {
            ids.push(d.id);
        }
        assert_eq!(ids, ["AA:BB", "C0:FF:EE:00:00:01", "12:34:56:78:9A:BC"]);
    }

    #[tokio::test]
    async fn scan_filter_limits_reports() {
        let (adapter, mut rx) = SimulatedAdapter::with_sample_peripherals();
        adapter
            .start_scan(&ScanRequest {
                service_uuids: vec![normalize_uuid("180d")],
                timeout_secs: 10,
                allow_duplicates: false,
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(AdapterEvent::ScanStarted));
        match rx.recv().await {
            Some(AdapterEvent::Discovered(d)) => assert_eq!(d.name.as_deref(), Some("HRM")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn writes_echo_as_notifications_when_subscribed() {
        let (adapter, mut rx) = SimulatedAdapter::with_sample_peripherals();
        adapter.connect("AA:BB", 1).await.unwrap();
        let _ = rx.recv().await;

        adapter.write(&echo_target(), b"hi", true).await.unwrap();
        assert!(rx.try_recv().is_err());

        adapter.subscribe(&echo_target()).await.unwrap();
        adapter.write(&echo_target(), b"hey", true).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(AdapterEvent::CharacteristicData {
                peripheral_id: "AA:BB".into(),
                characteristic_uuid: normalize_uuid("ec0e"),
                value: b"hey".to_vec(),
                is_notification: true,
            })
        );
        assert_eq!(adapter.read(&echo_target()).await.unwrap(), b"hey");
    }

    #[tokio::test]
    async fn outcome_events_carry_the_request_token() {
        let (adapter, mut rx) = SimulatedAdapter::with_sample_peripherals();
        adapter.connect("AA:BB", 7).await.unwrap();
        adapter.discover_services("AA:BB", 8).await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(AdapterEvent::Connected { request: 7, error: None, .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(AdapterEvent::ServicesDiscovered { request: 8, error: None, .. })
        ));
    }

    #[tokio::test]
    async fn faults_fail_the_matching_command() {
        let (adapter, _rx) = SimulatedAdapter::manual(sample_peripherals());
        adapter.set_fault(Fault::Read);
        assert!(adapter.read(&echo_target()).await.is_err());
        adapter.clear_fault(Fault::Read);
        assert!(adapter.read(&echo_target()).await.is_ok());
        assert_eq!(
            adapter.calls(),
            [
                AdapterCall::Read(echo_target()),
                AdapterCall::Read(echo_target())
            ]
        );
    }

    #[tokio::test]
    async fn manual_mode_emits_nothing() {
        let (adapter, mut rx) = SimulatedAdapter::manual(sample_peripherals());
        adapter.connect("AA:BB", 1).await.unwrap();
        adapter.discover_services("AA:BB", 2).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
