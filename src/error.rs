//! Error types for the SAS discovery engine

use std::time::Duration;

use thiserror::Error;

use crate::domain::ports::{DeviceHandle, HookError, PortId, SasAddress};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while discovering or maintaining a SAS domain
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Discovery Errors
    // =========================================================================
    /// Nothing attached to the port, or the port has no member PHYs
    #[error("No device attached to port {port}")]
    NoDevice { port: PortId },

    /// Allocation of a device or its reporting object failed
    #[error("Allocation failed: {0}")]
    OutOfMemory(String),

    /// The identification payload declared a device type we cannot handle
    #[error("Unknown device type {0}")]
    UnknownDeviceType(u8),

    /// A collaborator rejected the device
    #[error("Probe failed for device {address}: {code}")]
    ProbeFailed { address: SasAddress, code: HookError },

    /// The previous occupant of the port did not clear in time
    #[error("Timed out after {waited:?} waiting for port {port} to clear")]
    Timeout { port: PortId, waited: Duration },

    /// Revalidation postponed while link recovery is active
    #[error("Revalidation of port {port} deferred: link recovery active")]
    Deferred { port: PortId },

    /// Connection error reported while interrogating the domain
    #[error("Link error on port {port}: {reason}")]
    Link { port: PortId, reason: String },

    /// The handle no longer refers to a live device
    #[error("Stale device handle: {0}")]
    StaleHandle(DeviceHandle),

    /// The port is not known to the host adapter
    #[error("Unknown port: {0}")]
    UnknownPort(PortId),

    /// The event dispatcher no longer accepts work
    #[error("Event dispatcher is shutting down")]
    ShuttingDown,

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for conditions that are back-pressure signals rather than failures.
    pub fn is_deferral(&self) -> bool {
        matches!(self, Error::Deferred { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Timeout {
            port: PortId(3),
            waited: Duration::from_secs(180),
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 180s waiting for port 3 to clear"
        );

        let err = Error::UnknownDeviceType(4);
        assert_eq!(err.to_string(), "Unknown device type 4");
    }

    #[test]
    fn test_deferral_is_not_failure() {
        assert!(Error::Deferred { port: PortId(0) }.is_deferral());
        assert!(!Error::NoDevice { port: PortId(0) }.is_deferral());
    }
}
