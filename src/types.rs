use std::fmt;

use serde::Serialize;

use crate::error::BleError;

/// Link state of a single peripheral as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A characteristic found inside a discovered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacteristicRecord {
    /// Normalized 32-digit UUID (see [`crate::protocol::normalize_uuid`]).
    pub uuid: String,
    /// The characteristic advertises the notify (or indicate) property.
    pub supports_notify: bool,
    /// The active session currently holds a subscription on it.
    pub subscribed: bool,
}

impl CharacteristicRecord {
    pub fn new(uuid: impl Into<String>, supports_notify: bool) -> Self {
        Self {
            uuid: uuid.into(),
            supports_notify,
            subscribed: false,
        }
    }
}

/// A GATT service and whatever characteristics have been discovered in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    /// Normalized 32-digit UUID.
    pub uuid: String,
    /// Empty until characteristic discovery ran for this service.
    pub characteristics: Vec<CharacteristicRecord>,
}

impl ServiceRecord {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            characteristics: vec![],
        }
    }

    pub fn with_characteristics(
        uuid: impl Into<String>,
        characteristics: Vec<CharacteristicRecord>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            characteristics,
        }
    }
}

/// Everything the registry knows about one discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeripheralRecord {
    /// Platform identifier.
    /// • macOS / Windows: a UUID string
    /// • Linux / Android: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub id: String,
    /// Advertised local name, if any advertisement carried one.
    pub display_name: Option<String>,
    /// Last-seen signal strength in dBm.
    pub rssi: i16,
    pub connection_state: ConnectionState,
    /// Overwritten as a whole after each successful service discovery.
    pub services: Vec<ServiceRecord>,
    /// Normalized service UUIDs from the most recent advertisement that
    /// listed any.
    pub advertised_services: Vec<String>,
}

impl PeripheralRecord {
    /// Name for list views: the advertised name or `"Unknown"`.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or("Unknown")
    }
}

/// One advertisement report from a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub id: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub service_uuids: Vec<String>,
}

impl DiscoveryEvent {
    pub fn new(id: impl Into<String>, name: Option<&str>, rssi: i16) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_owned),
            rssi,
            service_uuids: vec![],
        }
    }
}

/// Phase of the session state machine.
///
/// ```text
/// Idle → Connecting → ServiceDiscovery → CharacteristicDiscovery → Ready
///   ↑                                                               │
///   └──────────────────────── Disconnecting ←───────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    ServiceDiscovery,
    CharacteristicDiscovery,
    Ready,
    Disconnecting,
}

impl SessionPhase {
    /// A connect for the same peripheral in one of these phases is a no-op.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionPhase::Connecting
                | SessionPhase::ServiceDiscovery
                | SessionPhase::CharacteristicDiscovery
                | SessionPhase::Ready
        )
    }

    /// The link is up (the adapter reported a successful connect).
    pub fn is_linked(self) -> bool {
        matches!(
            self,
            SessionPhase::ServiceDiscovery
                | SessionPhase::CharacteristicDiscovery
                | SessionPhase::Ready
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Connecting => "connecting",
            SessionPhase::ServiceDiscovery => "discovering services",
            SessionPhase::CharacteristicDiscovery => "discovering characteristics",
            SessionPhase::Ready => "ready",
            SessionPhase::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Fully-qualified address of a characteristic on a connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct GattTarget {
    pub peripheral_id: String,
    pub service_uuid: String,
    pub characteristic_uuid: String,
}

/// The characteristic a session bound to after discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundCharacteristic {
    pub target: GattTarget,
    pub supports_notify: bool,
}

/// The single active session.
///
/// Holds only the peripheral's id; the record itself stays owned by the
/// registry and may disappear when a new scan clears it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub peripheral_id: String,
    pub target_service_uuid: String,
    pub target_characteristic_uuid: String,
    pub notify_enabled: bool,
    /// `None` when the target service or characteristic was not found.
    pub characteristic: Option<BoundCharacteristic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScanState {
    pub active: bool,
}

/// Radio state as last reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AdapterState {
    #[default]
    Unknown,
    PoweredOn,
    PoweredOff,
}

/// Read-only view of the core handed to UI code.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    /// Peripheral the current phase refers to (set from `Connecting` on).
    pub peripheral_id: Option<String>,
    pub session: Option<Session>,
    pub scan: ScanState,
    pub adapter_state: AdapterState,
    pub peripherals: Vec<PeripheralRecord>,
}

/// Notifications the core emits for UI code.
///
/// Consumers receive these through the `mpsc::Receiver` returned by
/// [`crate::client::BleClient::start`]. Characteristic payloads are *not*
/// sent here; they go to the data callback registered with
/// [`crate::client::SessionHandle::on_data`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ScanStarted,
    ScanStopped,
    /// A peripheral was added to the registry. Later advertisements from
    /// the same device only update the record; poll a snapshot for RSSI.
    PeripheralDiscovered { id: String },
    PhaseChanged {
        peripheral_id: Option<String>,
        phase: SessionPhase,
    },
    /// Discovery finished but the configured target service or
    /// characteristic does not exist. The session is `Ready` but unbound.
    TargetNotFound { peripheral_id: String, uuid: String },
    RssiUpdated { id: String, rssi: i16 },
    /// The session's link went down, by request or otherwise.
    Disconnected {
        peripheral_id: String,
        reason: Option<String>,
    },
    AdapterStateChanged(AdapterState),
    /// An asynchronous step failed; the session is back in `Idle`.
    Failed(BleError),
}
