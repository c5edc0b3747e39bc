use thiserror::Error;

use crate::types::SessionPhase;

/// Errors surfaced by the session core.
///
/// Adapter failures are folded into the variant for the operation that
/// failed; `InvalidState` is raised by the controller itself and never
/// involves the adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    /// The adapter rejected or timed out a connect.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Service or characteristic enumeration failed or timed out.
    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("subscription failed: {0}")]
    Subscription(String),

    #[error("{operation} is not valid while the session is {phase}")]
    InvalidState {
        operation: &'static str,
        phase: SessionPhase,
    },

    /// A peripheral id, service, or characteristic is not known.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("scan failed: {0}")]
    Scan(String),

    /// The session runtime task has exited.
    #[error("session runtime has stopped")]
    Closed,
}

impl BleError {
    pub(crate) fn invalid_state(operation: &'static str, phase: SessionPhase) -> Self {
        BleError::InvalidState { operation, phase }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ble_error_display() {
        let err = BleError::Connection("BLE connect() timed out after 15 s".to_string());
        assert_eq!(
            err.to_string(),
            "connection failed: BLE connect() timed out after 15 s"
        );

        let err = BleError::invalid_state("read", SessionPhase::Connecting);
        assert_eq!(
            err.to_string(),
            "read is not valid while the session is connecting"
        );

        let err = BleError::NotFound("peripheral AA:BB".to_string());
        assert_eq!(err.to_string(), "not found: peripheral AA:BB");

        assert_eq!(BleError::Closed.to_string(), "session runtime has stopped");
    }
}
