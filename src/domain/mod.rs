//! Domain Layer
//!
//! Value objects, collaborator ports and topology events shared by the
//! discovery engine and its adapters.
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for external collaborators
//! - **Events** (`events.rs`) - Topology events for audit and observation

pub mod events;
pub mod ports;

pub use events::{DeviceEventKind, TopologyEvent};
pub use ports::{
    AttachedDevice, DeviceHandle, DeviceInfo, DeviceKind, EventSink, ExpanderPhy,
    ExpanderProtocol, HashedAddress, HookError, HookResult, LinkRate, LowLevelDriver, OobMode,
    PortId, Protocol, ReportingId, ReportingLayer, SasAddress, SataHost, SataPortId,
};
