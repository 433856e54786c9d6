//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │ LowLevelDriver │ ReportingLayer │ SataHost │ ExpanderProto │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ RecordingDriver │ SimulatedFabric │ LoggingEventSink       │ │
//! │  │ InMemoryEventSink │ CompositeEventSink                     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use sas_discovery::adapters::{InMemoryEventSink, RecordingDriver, SimulatedFabric};
//! use sas_discovery::discovery::{Collaborators, HostAdapter};
//!
//! let driver = Arc::new(RecordingDriver::new());
//! let collaborators = Collaborators {
//!     driver: driver.clone(),
//!     reporting: driver.clone(),
//!     sata: driver.clone(),
//!     expander: Arc::new(SimulatedFabric::new()),
//!     events: Arc::new(InMemoryEventSink::new()),
//! };
//! let host = HostAdapter::new("hba0", DiscoveryConfig::default(), collaborators)?;
//! ```

mod event_sink;
mod fabric;
mod recording;

pub use event_sink::{CompositeEventSink, InMemoryEventSink, LoggingEventSink};
pub use fabric::{parse_address, PhyAttachment, PortTopology, SimulatedFabric, Step, Topology, TopologyNode};
pub use recording::{Call, FailPoint, RecordingDriver};
