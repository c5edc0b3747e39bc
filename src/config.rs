use std::time::Duration;

use clap::Parser;

use crate::adapter::ScanRequest;
use crate::protocol::{
    normalize_uuid, DEFAULT_CHARACTERISTIC_UUID, DEFAULT_SCAN_TIMEOUT_SECS,
    DEFAULT_SERVICE_UUID, DEFAULT_STEP_TIMEOUT_SECS,
};

/// The service / characteristic pair a session binds to after discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    /// Normalized service UUID.
    pub service_uuid: String,
    /// Normalized characteristic UUID inside `service_uuid`.
    pub characteristic_uuid: String,
}

impl SessionTarget {
    /// Build a target from UUIDs in any accepted form (`"ec00"`,
    /// `"0x2A37"`, full 128-bit with or without dashes).
    pub fn new(service_uuid: &str, characteristic_uuid: &str) -> Self {
        Self {
            service_uuid: normalize_uuid(service_uuid),
            characteristic_uuid: normalize_uuid(characteristic_uuid),
        }
    }
}

impl Default for SessionTarget {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_UUID, DEFAULT_CHARACTERISTIC_UUID)
    }
}

/// Configuration for [`crate::client::BleClient`] and
/// [`crate::session::SessionController`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Characteristic used for read / write / notify. Default: `ec00`/`ec0e`.
    pub target: SessionTarget,
    /// Scan duration in seconds before the adapter stops. Default: `10`.
    pub scan_timeout_secs: u64,
    /// Ask the adapter for every advertisement (keeps RSSI fresh).
    /// Default: `true`.
    pub allow_duplicates: bool,
    /// Only report peripherals advertising one of these services.
    /// Default: empty (no filter).
    pub service_filter: Vec<String>,
    /// Upper bound on each connect / discovery step and on every inline
    /// adapter call. Default: 15 s.
    pub step_timeout: Duration,
    /// Use write-with-response for [`crate::client::SessionHandle::write`].
    /// Default: `true`.
    pub write_with_response: bool,
    /// Split writes longer than this many bytes into consecutive writes of
    /// at most this size. `None` or `Some(0)` writes in one piece.
    /// Default: `None`.
    pub write_chunk_size: Option<usize>,
    /// Capacity of the [`crate::types::SessionEvent`] channel. Events that
    /// do not fit are dropped with a warning. Default: `256`.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target: SessionTarget::default(),
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
            allow_duplicates: true,
            service_filter: vec![],
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            write_with_response: true,
            write_chunk_size: None,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub(crate) fn scan_request(&self) -> ScanRequest {
        ScanRequest {
            service_uuids: self.service_filter.iter().map(|u| normalize_uuid(u)).collect(),
            timeout_secs: self.scan_timeout_secs,
            allow_duplicates: self.allow_duplicates,
        }
    }
}

// ── Command-line flags ────────────────────────────────────────────────────────

/// Flags shared by the `ble-session` and `tui` binaries.
#[derive(Debug, Clone, Parser)]
#[command(version, about = "Scan for BLE peripherals and talk to one characteristic")]
pub struct CliOptions {
    /// Use the built-in simulated peripherals instead of a radio.
    #[arg(long)]
    pub simulate: bool,

    /// Target service UUID (16-bit short form or full 128-bit).
    #[arg(long, default_value = DEFAULT_SERVICE_UUID)]
    pub service: String,

    /// Target characteristic UUID inside the service.
    #[arg(long, default_value = DEFAULT_CHARACTERISTIC_UUID)]
    pub characteristic: String,

    /// Stop scanning after this many seconds; 0 scans until stopped.
    #[arg(long, default_value_t = DEFAULT_SCAN_TIMEOUT_SECS)]
    pub scan_secs: u64,

    /// Only report peripherals advertising this service. Repeatable.
    #[arg(long)]
    pub filter: Vec<String>,

    /// Write without response.
    #[arg(long)]
    pub no_response: bool,

    /// Split writes into pieces of at most this many bytes.
    #[arg(long)]
    pub chunk: Option<usize>,
}

impl CliOptions {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            target: SessionTarget::new(&self.service, &self.characteristic),
            scan_timeout_secs: self.scan_secs,
            service_filter: self.filter.clone(),
            write_with_response: !self.no_response,
            write_chunk_size: self.chunk,
            ..ClientConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_target_is_normalized() {
        let target = SessionTarget::default();
        assert_eq!(target.service_uuid, "0000ec0000001000800000805f9b34fb");
        assert_eq!(target.characteristic_uuid, "0000ec0e00001000800000805f9b34fb");
    }

    fn cli(args: &[&str]) -> Result<CliOptions, clap::Error> {
        CliOptions::try_parse_from(std::iter::once("ble-session").chain(args.iter().copied()))
    }

    #[test]
    fn cli_defaults() {
        let options = cli(&[]).unwrap();
        assert!(!options.simulate);
        let config = options.client_config();
        assert_eq!(config.target, SessionTarget::default());
        assert_eq!(config.scan_timeout_secs, 10);
        assert_eq!(config.write_chunk_size, None);
        assert!(config.write_with_response);
    }

    #[test]
    fn cli_overrides_target_and_scan() {
        let options = cli(&[
            "--simulate",
            "--service",
            "180d",
            "--characteristic",
            "0x2A37",
            "--scan-secs",
            "3",
            "--filter",
            "180D",
            "--filter",
            "ec00",
            "--no-response",
            "--chunk",
            "2",
        ])
        .unwrap();
        assert!(options.simulate);
        let config = options.client_config();
        assert_eq!(config.target, SessionTarget::new("180d", "2a37"));
        assert_eq!(config.scan_timeout_secs, 3);
        assert_eq!(config.service_filter, ["180D", "ec00"]);
        assert!(!config.write_with_response);
        assert_eq!(config.write_chunk_size, Some(2));
    }

    #[test]
    fn cli_rejects_bad_input() {
        assert!(cli(&["--scan-secs"]).is_err());
        assert!(cli(&["--scan-secs", "soon"]).is_err());
        assert!(cli(&["--chunk", "-1"]).is_err());
        assert!(cli(&["--verbose"]).is_err());
    }

    #[test]
    fn scan_request_normalizes_filter() {
        let config = ClientConfig {
            service_filter: vec!["180D".into()],
            scan_timeout_secs: 3,
            allow_duplicates: false,
            ..Default::default()
        };
        assert_eq!(
            config.scan_request(),
            ScanRequest {
                service_uuids: vec!["0000180d00001000800000805f9b34fb".into()],
                timeout_secs: 3,
                allow_duplicates: false,
            }
        );
    }
}
