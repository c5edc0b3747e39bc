//! # ble-session
//!
//! Platform-agnostic core for a BLE central: a registry of discovered
//! peripherals and a single-session state machine that connects, discovers
//! one target service / characteristic, and then reads, writes, and toggles
//! notifications on it.
//!
//! ## Session lifecycle
//!
//! ```text
//! Idle → Connecting → ServiceDiscovery → CharacteristicDiscovery → Ready
//!   ↑                                                               │
//!   └──────────────────────── Disconnecting ←───────────────────────┘
//! ```
//!
//! Any failure, link loss, or adapter power-off returns the session to
//! `Idle`. Read / write / notify are only accepted in `Ready`.
//!
//! ## Quick start
//!
//! ```no_run
//! use ble_session::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = BleClient::new(ClientConfig {
//!         target: SessionTarget::new("180d", "2a37"),
//!         ..Default::default()
//!     });
//!     let (mut events, handle, _sim) = client.start_simulated();
//!     handle.on_data(|bytes| println!("{bytes:02x?}")).await?;
//!     handle.start_scan().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::PeripheralDiscovered { id } if id.starts_with("C0:FF") => {
//!                 handle.connect(&id).await?;
//!             }
//!             SessionEvent::PhaseChanged { phase: SessionPhase::Ready, .. } => {
//!                 handle.toggle_notify().await?;
//!             }
//!             SessionEvent::Disconnected { .. } => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Cargo features
//!
//! | Feature | Enables |
//! |---|---|
//! | `platform` | [`platform::PlatformAdapter`] over btleplug (BlueZ / CoreBluetooth / WinRT) |
//! | `tui` | the `tui` binary (ratatui + crossterm) |
//!
//! Without `platform` the crate has no system dependencies; the
//! [`simulator`] stands in for a radio.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`client`] | Runtime task and the [`client::SessionHandle`] command API |
//! | [`session`] | The [`session::SessionController`] state machine |
//! | [`registry`] | [`registry::PeripheralRegistry`], one record per discovered peripheral |
//! | [`adapter`] | The [`adapter::BleAdapter`] trait and its [`adapter::AdapterEvent`] stream |
//! | [`simulator`] | Scripted in-process adapter for tests and `--simulate` |
//! | [`types`] | Records, phases, snapshots, and session events |
//! | [`config`] | [`config::ClientConfig`] and command-line flags |
//! | [`protocol`] | UUID normalization and default targets |
//! | [`error`] | [`error::BleError`] |

pub mod adapter;
pub mod client;
pub mod config;
pub mod error;
#[cfg(feature = "platform")]
pub mod platform;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod simulator;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// ```no_run
/// use ble_session::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), BleError> {
/// let (_events, handle, _sim) = BleClient::new(ClientConfig::default()).start_simulated();
/// handle.start_scan().await?;
/// for p in handle.snapshot().await?.peripherals {
///     println!("{} {} dBm", p.label(), p.rssi);
/// }
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    // ── Runtime ───────────────────────────────────────────────────────────────
    pub use crate::client::{BleClient, SessionHandle};
    pub use crate::config::{ClientConfig, SessionTarget};
    pub use crate::error::BleError;

    // ── Adapters ──────────────────────────────────────────────────────────────
    pub use crate::adapter::{AdapterEvent, BleAdapter, ScanRequest};
    #[cfg(feature = "platform")]
    pub use crate::platform::PlatformAdapter;
    pub use crate::simulator::{SimulatedAdapter, SimulatedPeripheral};

    // ── State and events ──────────────────────────────────────────────────────
    pub use crate::session::SessionController;
    pub use crate::types::{
        AdapterState, CharacteristicRecord, ConnectionState, GattTarget, PeripheralRecord,
        ServiceRecord, Session, SessionEvent, SessionPhase, SessionSnapshot,
    };

    // ── UUID helpers ──────────────────────────────────────────────────────────
    pub use crate::protocol::{normalize_uuid, short_uuid};
}
