//! The capability interface a BLE binding implements for the core.
//!
//! A binding has two halves:
//!
//! * **Commands**: the async methods of [`BleAdapter`]. `connect`,
//!   `discover_services` and `discover_characteristics` only *request* the
//!   operation; their outcome arrives later on the event stream. `read`,
//!   `write`, `subscribe`, `unsubscribe` and `read_rssi` complete inline.
//!   Each request carries a [`RequestId`] that the binding copies into the
//!   outcome event, so the controller can tell a late answer to an
//!   abandoned request from the answer it is waiting for.
//! * **Events**: an [`AdapterEvent`] stream, handed to
//!   [`crate::client::BleClient::start`] next to the adapter itself.
//!
//! The crate ships two bindings: [`crate::simulator::SimulatedAdapter`] and,
//! with the `platform` feature, `crate::platform::PlatformAdapter` over
//! btleplug.

use std::future::Future;

use anyhow::Result;

use crate::types::{AdapterState, CharacteristicRecord, DiscoveryEvent, GattTarget, ServiceRecord};

/// Token passed with `connect` and discovery requests and echoed in their
/// outcome events.
pub type RequestId = u64;

/// Parameters for [`BleAdapter::start_scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Only report peripherals advertising one of these (normalized)
    /// service UUIDs. Empty means no filter.
    pub service_uuids: Vec<String>,
    /// The adapter stops scanning on its own after this many seconds and
    /// emits [`AdapterEvent::ScanStopped`].
    pub timeout_secs: u64,
    /// Report every advertisement instead of only the first per device.
    /// The registry deduplicates either way.
    pub allow_duplicates: bool,
}

/// Everything a binding reports without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Discovered(DiscoveryEvent),
    /// Outcome of [`BleAdapter::connect`]; `error` is `None` on success.
    Connected {
        peripheral_id: String,
        request: RequestId,
        error: Option<String>,
    },
    /// The link to a peripheral went down.
    Disconnected {
        peripheral_id: String,
        error: Option<String>,
    },
    /// Outcome of [`BleAdapter::discover_services`].
    ServicesDiscovered {
        peripheral_id: String,
        request: RequestId,
        services: Vec<ServiceRecord>,
        error: Option<String>,
    },
    /// Outcome of [`BleAdapter::discover_characteristics`].
    CharacteristicsDiscovered {
        peripheral_id: String,
        request: RequestId,
        service_uuid: String,
        characteristics: Vec<CharacteristicRecord>,
        error: Option<String>,
    },
    /// A value arrived for a characteristic, either as a notification or
    /// as the echo of a read.
    CharacteristicData {
        peripheral_id: String,
        characteristic_uuid: String,
        value: Vec<u8>,
        is_notification: bool,
    },
    ScanStarted,
    ScanStopped,
    StateChanged(AdapterState),
}

/// Scanning, connection, and GATT primitives supplied by a platform.
///
/// UUID arguments are always in normalized form. Implementations should
/// normalize the UUIDs they report with
/// [`crate::protocol::normalize_uuid`]; the controller normalizes again
/// on receipt, so this is not load-bearing.
pub trait BleAdapter: Send + Sync + 'static {
    fn start_scan(&self, request: &ScanRequest) -> impl Future<Output = Result<()>> + Send;

    fn stop_scan(&self) -> impl Future<Output = Result<()>> + Send;

    /// Request a connection. Completion is reported as
    /// [`AdapterEvent::Connected`].
    fn connect(
        &self,
        peripheral_id: &str,
        request: RequestId,
    ) -> impl Future<Output = Result<()>> + Send;

    fn disconnect(&self, peripheral_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Request service enumeration. Completion is reported as
    /// [`AdapterEvent::ServicesDiscovered`].
    fn discover_services(
        &self,
        peripheral_id: &str,
        request: RequestId,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Request characteristic enumeration within one service, optionally
    /// restricted to `uuid_filter`. Completion is reported as
    /// [`AdapterEvent::CharacteristicsDiscovered`].
    fn discover_characteristics(
        &self,
        peripheral_id: &str,
        request: RequestId,
        service_uuid: &str,
        uuid_filter: &[String],
    ) -> impl Future<Output = Result<()>> + Send;

    fn read(&self, target: &GattTarget) -> impl Future<Output = Result<Vec<u8>>> + Send;

    fn write(
        &self,
        target: &GattTarget,
        value: &[u8],
        with_response: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    fn subscribe(&self, target: &GattTarget) -> impl Future<Output = Result<()>> + Send;

    fn unsubscribe(&self, target: &GattTarget) -> impl Future<Output = Result<()>> + Send;

    /// Current signal strength of a connected peripheral in dBm.
    fn read_rssi(&self, peripheral_id: &str) -> impl Future<Output = Result<i16>> + Send;
}
