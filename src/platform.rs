//! [`BleAdapter`] over the host's Bluetooth stack via btleplug.
//!
//! btleplug's calls complete inline, so `connect` and `discover_services`
//! run on spawned tasks and report through the event stream, matching the
//! request / event split of [`crate::adapter`]. Two long-lived tasks feed
//! the stream:
//!
//! * a central pump translating [`CentralEvent`]s (discovery, link loss,
//!   radio power state), and
//! * one notification pump per peripheral, started on the first subscribe.
//!
//! Peripherals are cached by id the first time they are seen so commands do
//! not have to walk `adapter.peripherals()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::adapter::{AdapterEvent, BleAdapter, RequestId, ScanRequest};
use crate::protocol::{normalize_uuid, parse_uuid};
use crate::types::{
    AdapterState, CharacteristicRecord, DiscoveryEvent, GattTarget, ServiceRecord,
};

/// Reported when an advertisement carries no RSSI.
const RSSI_UNAVAILABLE: i16 = -127;

struct Shared {
    adapter: Adapter,
    events: mpsc::UnboundedSender<AdapterEvent>,
    peripherals: Mutex<HashMap<String, Peripheral>>,
    notification_pumps: Mutex<HashMap<String, JoinHandle<()>>>,
    scanning: AtomicBool,
    /// Bumped by every start / stop so a scan timer only ends its own scan.
    scan_generation: AtomicU64,
    service_filter: Mutex<Vec<String>>,
}

impl Shared {
    fn send(&self, event: AdapterEvent) {
        if self.events.send(event).is_err() {
            debug!("platform: event receiver dropped");
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Peripheral>> {
        self.peripherals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pumps(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.notification_pumps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stop_pump(&self, peripheral_id: &str) {
        if let Some(pump) = self.pumps().remove(peripheral_id) {
            pump.abort();
        }
    }
}

/// The first Bluetooth adapter of the host.
#[derive(Clone)]
pub struct PlatformAdapter {
    shared: Arc<Shared>,
}

impl PlatformAdapter {
    /// Open the first adapter and start the central event pump.
    ///
    /// On macOS, `CBCentralManager` starts in an "unknown" state and
    /// silently ignores scans until it reaches *poweredOn*; this waits up to
    /// 3 s for that.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<AdapterEvent>)> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        #[cfg(target_os = "macos")]
        wait_powered_on(&adapter).await;

        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            adapter,
            events,
            peripherals: Mutex::new(HashMap::new()),
            notification_pumps: Mutex::new(HashMap::new()),
            scanning: AtomicBool::new(false),
            scan_generation: AtomicU64::new(0),
            service_filter: Mutex::new(vec![]),
        });

        match shared.adapter.adapter_state().await {
            Ok(state) => shared.send(AdapterEvent::StateChanged(map_state(state))),
            Err(e) => debug!("adapter_state() unavailable: {e}"),
        }

        let central = shared.adapter.events().await?;
        tokio::spawn(central_pump(Arc::clone(&shared), central));
        info!("Bluetooth adapter ready");
        Ok((Self { shared }, rx))
    }

    async fn peripheral(&self, id: &str) -> Result<Peripheral> {
        let cached = self.shared.cache().get(id).cloned();
        if let Some(p) = cached {
            return Ok(p);
        }
        for p in self.shared.adapter.peripherals().await? {
            if p.id().to_string() == id {
                self.shared.cache().insert(id.to_owned(), p.clone());
                return Ok(p);
            }
        }
        Err(anyhow!("unknown peripheral {id}"))
    }

    async fn characteristic(&self, target: &GattTarget) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(&target.peripheral_id).await?;
        let service = peripheral
            .services()
            .into_iter()
            .find(|s| normalize_uuid(&s.uuid.to_string()) == target.service_uuid)
            .ok_or_else(|| anyhow!("service {} not found", target.service_uuid))?;
        let characteristic = service
            .characteristics
            .into_iter()
            .find(|c| normalize_uuid(&c.uuid.to_string()) == target.characteristic_uuid)
            .ok_or_else(|| anyhow!("characteristic {} not found", target.characteristic_uuid))?;
        Ok((peripheral, characteristic))
    }

    /// Start forwarding notifications of `peripheral` unless a pump for it
    /// is already running.
    async fn ensure_notification_pump(&self, peripheral: &Peripheral) -> Result<()> {
        let id = peripheral.id().to_string();
        if self
            .shared
            .pumps()
            .get(&id)
            .is_some_and(|pump| !pump.is_finished())
        {
            return Ok(());
        }
        let mut notifications = peripheral.notifications().await?;
        let shared = Arc::clone(&self.shared);
        let peripheral_id = id.clone();
        let pump = tokio::spawn(async move {
            debug!("{peripheral_id}: notification stream open");
            while let Some(n) = notifications.next().await {
                shared.send(AdapterEvent::CharacteristicData {
                    peripheral_id: peripheral_id.clone(),
                    characteristic_uuid: normalize_uuid(&n.uuid.to_string()),
                    value: n.value,
                    is_notification: true,
                });
            }
            debug!("{peripheral_id}: notification stream ended");
        });
        self.shared.pumps().insert(id, pump);
        Ok(())
    }
}

impl BleAdapter for PlatformAdapter {
    async fn start_scan(&self, request: &ScanRequest) -> Result<()> {
        let services = request
            .service_uuids
            .iter()
            .filter_map(|u| parse_uuid(u))
            .collect();
        if !request.allow_duplicates {
            debug!("platform: btleplug always reports repeated advertisements");
        }
        *self
            .shared
            .service_filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = request.service_uuids.clone();

        let generation = self.shared.scan_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared
            .adapter
            .start_scan(ScanFilter { services })
            .await
            .context("start_scan")?;
        self.shared.scanning.store(true, Ordering::SeqCst);
        self.shared.send(AdapterEvent::ScanStarted);

        if request.timeout_secs == 0 {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let timeout = Duration::from_secs(request.timeout_secs);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if shared.scan_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            info!("Scan finished after {} s", timeout.as_secs());
            if let Err(e) = shared.adapter.stop_scan().await {
                warn!("stop_scan after timeout: {e}");
            }
            shared.scanning.store(false, Ordering::SeqCst);
            shared.send(AdapterEvent::ScanStopped);
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.shared.scan_generation.fetch_add(1, Ordering::SeqCst);
        self.shared.scanning.store(false, Ordering::SeqCst);
        self.shared.adapter.stop_scan().await?;
        self.shared.send(AdapterEvent::ScanStopped);
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str, request: RequestId) -> Result<()> {
        let peripheral = self.peripheral(peripheral_id).await?;
        let shared = Arc::clone(&self.shared);
        let id = peripheral_id.to_owned();
        tokio::spawn(async move {
            let error = match peripheral.connect().await {
                Ok(()) => None,
                Err(e) => Some(e.to_string()),
            };
            shared.send(AdapterEvent::Connected {
                peripheral_id: id,
                request,
                error,
            });
        });
        Ok(())
    }

    async fn disconnect(&self, peripheral_id: &str) -> Result<()> {
        self.shared.stop_pump(peripheral_id);
        let peripheral = self.peripheral(peripheral_id).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_services(&self, peripheral_id: &str, request: RequestId) -> Result<()> {
        let peripheral = self.peripheral(peripheral_id).await?;
        let shared = Arc::clone(&self.shared);
        let id = peripheral_id.to_owned();
        tokio::spawn(async move {
            // BlueZ signals the connection before its GATT cache is filled;
            // discovering right away can return an empty set.
            #[cfg(target_os = "linux")]
            tokio::time::sleep(Duration::from_millis(600)).await;

            let (services, error) = match peripheral.discover_services().await {
                Ok(()) => (
                    peripheral
                        .services()
                        .iter()
                        .map(|s| ServiceRecord::new(normalize_uuid(&s.uuid.to_string())))
                        .collect(),
                    None,
                ),
                Err(e) => (vec![], Some(e.to_string())),
            };
            shared.send(AdapterEvent::ServicesDiscovered {
                peripheral_id: id,
                request,
                services,
                error,
            });
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
        // btleplug enumerates characteristics together with services.
        let peripheral = self.peripheral(peripheral_id).await?;
        let service = peripheral
            .services()
            .into_iter()
            .find(|s| normalize_uuid(&s.uuid.to_string()) == service_uuid);
        let (characteristics, error) = match service {
            Some(service) => (
                service
                    .characteristics
                    .iter()
                    .map(|c| {
                        CharacteristicRecord::new(
                            normalize_uuid(&c.uuid.to_string()),
                            c.properties
                                .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
                        )
                    })
                    .filter(|c| uuid_filter.is_empty() || uuid_filter.contains(&c.uuid))
                    .collect(),
                None,
            ),
            None => (vec![], Some(format!("service {service_uuid} not found"))),
        };
        self.shared.send(AdapterEvent::CharacteristicsDiscovered {
            peripheral_id: peripheral_id.to_owned(),
            request,
            service_uuid: service_uuid.to_owned(),
            characteristics,
            error,
        });
        Ok(())
    }

    async fn read(&self, target: &GattTarget) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.characteristic(target).await?;
        Ok(peripheral.read(&characteristic).await?)
    }

    async fn write(&self, target: &GattTarget, value: &[u8], with_response: bool) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(target).await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral.write(&characteristic, value, write_type).await?;
        Ok(())
    }

    async fn subscribe(&self, target: &GattTarget) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(target).await?;
        peripheral.subscribe(&characteristic).await?;
        self.ensure_notification_pump(&peripheral).await
    }

    async fn unsubscribe(&self, target: &GattTarget) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(target).await?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn read_rssi(&self, peripheral_id: &str) -> Result<i16> {
        let peripheral = self.peripheral(peripheral_id).await?;
        peripheral
            .properties()
            .await?
            .and_then(|p| p.rssi)
            .ok_or_else(|| anyhow!("RSSI not available for {peripheral_id}"))
    }
}

// ── Central event pump ────────────────────────────────────────────────────────

async fn central_pump(
    shared: Arc<Shared>,
    mut central: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
) {
    while let Some(event) = central.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if !shared.scanning.load(Ordering::SeqCst) {
                    continue;
                }
                let Ok(peripheral) = shared.adapter.peripheral(&id).await else {
                    continue;
                };
                if let Some(discovery) = describe(&shared, &peripheral).await {
                    shared.cache().insert(discovery.id.clone(), peripheral);
                    shared.send(AdapterEvent::Discovered(discovery));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let id = id.to_string();
                debug!("platform: {id} disconnected");
                shared.stop_pump(&id);
                shared.send(AdapterEvent::Disconnected {
                    peripheral_id: id,
                    error: None,
                });
            }
            CentralEvent::StateUpdate(state) => {
                let state = map_state(state);
                if state == AdapterState::PoweredOff {
                    shared.scanning.store(false, Ordering::SeqCst);
                }
                shared.send(AdapterEvent::StateChanged(state));
            }
            _ => {}
        }
    }
    warn!("Central event stream ended");
}

/// Build a discovery report, applying the scan's service filter on
/// platforms where `ScanFilter` is advisory.
async fn describe(shared: &Shared, peripheral: &Peripheral) -> Option<DiscoveryEvent> {
    let props = match peripheral.properties().await {
        Ok(Some(props)) => props,
        Ok(None) => return None,
        Err(e) => {
            debug!("properties(): {e}");
            return None;
        }
    };
    let advertised: Vec<String> = props
        .services
        .iter()
        .map(|u| normalize_uuid(&u.to_string()))
        .collect();
    let filter = shared
        .service_filter
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    if !filter.is_empty() && !advertised.iter().any(|u| filter.contains(u)) {
        return None;
    }
    Some(DiscoveryEvent {
        id: peripheral.id().to_string(),
        name: props.local_name,
        rssi: props.rssi.unwrap_or(RSSI_UNAVAILABLE),
        service_uuids: advertised,
    })
}

fn map_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => {
                info!("macOS: adapter is PoweredOn");
                break;
            }
            Ok(state) => {
                if tokio::time::Instant::now() >= deadline {
                    warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                    break;
                }
                debug!("macOS: adapter state = {state:?}, waiting…");
            }
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}
