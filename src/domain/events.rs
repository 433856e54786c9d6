//! Topology Events
//!
//! Immutable records of significant occurrences in a SAS domain: devices
//! appearing, being registered, failing to register, being removed and
//! finally released, plus port-level suspend/resume/revalidation outcomes.
//!
//! # Usage
//!
//! Topology events are used for:
//! - Audit logging
//! - Test observation of the lifecycle engine
//! - Decoupling consumers from the discovery engine
//!
//! # Example
//!
//! ```ignore
//! let event = TopologyEvent::device_discovered(PortId(0), addr, DeviceKind::EndDevice);
//! sink.publish(event);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ports::{DeviceKind, PortId, SasAddress};

/// Device lifecycle event kind carried by the work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceEventKind {
    Add,
    Delete,
}

impl std::fmt::Display for DeviceEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEventKind::Add => write!(f, "add"),
            DeviceEventKind::Delete => write!(f, "delete"),
        }
    }
}

/// Topology event representing a significant occurrence in the domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TopologyEvent {
    // =========================================================================
    // Device Events
    // =========================================================================
    /// A device was classified and allocated.
    DeviceDiscovered {
        port: u32,
        sas_address: String,
        kind: String,
        parent: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A lifecycle event was queued for a device.
    DeviceEventQueued {
        sas_address: String,
        event: DeviceEventKind,
        timestamp: DateTime<Utc>,
    },

    /// A device became visible to the consumer layer.
    DeviceRegistered {
        sas_address: String,
        timestamp: DateTime<Utc>,
    },

    /// The consumer layer (or ATA probe) rejected a device.
    DeviceRegistrationFailed {
        sas_address: String,
        code: i32,
        timestamp: DateTime<Utc>,
    },

    /// A device was unregistered.
    DeviceRemoved {
        sas_address: String,
        was_registered: bool,
        timestamp: DateTime<Utc>,
    },

    /// The last reference to a device was dropped.
    DeviceReleased {
        sas_address: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Port Events
    // =========================================================================
    /// Discovery on a port did not produce a device.
    DiscoveryFailed {
        port: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Revalidation was postponed because link recovery is active.
    RevalidationDeferred {
        port: u32,
        timestamp: DateTime<Utc>,
    },

    /// A port was suspended.
    PortSuspended {
        port: u32,
        devices: usize,
        timestamp: DateTime<Utc>,
    },

    /// A port's SATA bridges were resumed.
    PortResumed {
        port: u32,
        timestamp: DateTime<Utc>,
    },
}

impl TopologyEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TopologyEvent::DeviceDiscovered { timestamp, .. } => *timestamp,
            TopologyEvent::DeviceEventQueued { timestamp, .. } => *timestamp,
            TopologyEvent::DeviceRegistered { timestamp, .. } => *timestamp,
            TopologyEvent::DeviceRegistrationFailed { timestamp, .. } => *timestamp,
            TopologyEvent::DeviceRemoved { timestamp, .. } => *timestamp,
            TopologyEvent::DeviceReleased { timestamp, .. } => *timestamp,
            TopologyEvent::DiscoveryFailed { timestamp, .. } => *timestamp,
            TopologyEvent::RevalidationDeferred { timestamp, .. } => *timestamp,
            TopologyEvent::PortSuspended { timestamp, .. } => *timestamp,
            TopologyEvent::PortResumed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            TopologyEvent::DeviceDiscovered { .. } => "DeviceDiscovered",
            TopologyEvent::DeviceEventQueued { .. } => "DeviceEventQueued",
            TopologyEvent::DeviceRegistered { .. } => "DeviceRegistered",
            TopologyEvent::DeviceRegistrationFailed { .. } => "DeviceRegistrationFailed",
            TopologyEvent::DeviceRemoved { .. } => "DeviceRemoved",
            TopologyEvent::DeviceReleased { .. } => "DeviceReleased",
            TopologyEvent::DiscoveryFailed { .. } => "DiscoveryFailed",
            TopologyEvent::RevalidationDeferred { .. } => "RevalidationDeferred",
            TopologyEvent::PortSuspended { .. } => "PortSuspended",
            TopologyEvent::PortResumed { .. } => "PortResumed",
        }
    }

    /// Get the device address if applicable.
    pub fn sas_address(&self) -> Option<&str> {
        match self {
            TopologyEvent::DeviceDiscovered { sas_address, .. } => Some(sas_address),
            TopologyEvent::DeviceEventQueued { sas_address, .. } => Some(sas_address),
            TopologyEvent::DeviceRegistered { sas_address, .. } => Some(sas_address),
            TopologyEvent::DeviceRegistrationFailed { sas_address, .. } => Some(sas_address),
            TopologyEvent::DeviceRemoved { sas_address, .. } => Some(sas_address),
            TopologyEvent::DeviceReleased { sas_address, .. } => Some(sas_address),
            _ => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl TopologyEvent {
    pub fn device_discovered(
        port: PortId,
        sas_address: SasAddress,
        kind: DeviceKind,
        parent: Option<SasAddress>,
    ) -> Self {
        TopologyEvent::DeviceDiscovered {
            port: port.0,
            sas_address: sas_address.to_string(),
            kind: kind.to_string(),
            parent: parent.map(|p| p.to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn device_event_queued(sas_address: SasAddress, event: DeviceEventKind) -> Self {
        TopologyEvent::DeviceEventQueued {
            sas_address: sas_address.to_string(),
            event,
            timestamp: Utc::now(),
        }
    }

    pub fn device_registered(sas_address: SasAddress) -> Self {
        TopologyEvent::DeviceRegistered {
            sas_address: sas_address.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn device_registration_failed(sas_address: SasAddress, code: i32) -> Self {
        TopologyEvent::DeviceRegistrationFailed {
            sas_address: sas_address.to_string(),
            code,
            timestamp: Utc::now(),
        }
    }

    pub fn device_removed(sas_address: SasAddress, was_registered: bool) -> Self {
        TopologyEvent::DeviceRemoved {
            sas_address: sas_address.to_string(),
            was_registered,
            timestamp: Utc::now(),
        }
    }

    pub fn device_released(sas_address: SasAddress) -> Self {
        TopologyEvent::DeviceReleased {
            sas_address: sas_address.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn discovery_failed(port: PortId, reason: impl Into<String>) -> Self {
        TopologyEvent::DiscoveryFailed {
            port: port.0,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn revalidation_deferred(port: PortId) -> Self {
        TopologyEvent::RevalidationDeferred {
            port: port.0,
            timestamp: Utc::now(),
        }
    }

    pub fn port_suspended(port: PortId, devices: usize) -> Self {
        TopologyEvent::PortSuspended {
            port: port.0,
            devices,
            timestamp: Utc::now(),
        }
    }

    pub fn port_resumed(port: PortId) -> Self {
        TopologyEvent::PortResumed {
            port: port.0,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
