//! Discovery Engine
//!
//! Discovers the devices reachable through the ports of a SAS host bus
//! adapter, registers them with the consumer layer, keeps the topology in
//! step with link changes, and tears it down when links go away.
//!
//! # Architecture
//!
//! ```text
//! link up ──► Discover ──► classify ──► allocate ──► pending list
//!                                                      │ Add
//!                                                      ▼
//!   Revalidate ──► reconcile expander tree        active list
//!                                                      │ Delete
//!                                                      ▼
//!                                              last reference ──► freed
//! ```
//!
//! # Modules
//!
//! - `frame` - Classifier for identify frames and D2H FIS signatures
//! - `device` / `registry` - Device objects and the reference-counted arena
//! - `port` - PHYs, ports and their device lists
//! - `host` - Host adapter, domain lock and collaborator bundle
//! - `dispatcher` - Per-port event lanes
//! - `driver` / `expander` / `sata` / `lifecycle` - Discovery, revalidation,
//!   power management, registration and teardown

mod device;
mod dispatcher;
mod driver;
mod expander;
mod frame;
mod host;
mod lifecycle;
mod port;
mod proptest;
mod registry;
mod sata;

pub use device::{Device, DeviceSnapshot, DeviceSpec, ExpanderState, Phase, SataState};
pub use dispatcher::{DomainEventKind, EventDispatcher};
pub use frame::{classify, d2h_signature_fis, identify_frame, Classification, ReceivedFrame};
pub use host::{Collaborators, DomainGuard, DomainLock, HostAdapter, PortSnapshot};
pub use port::{LinkState, ListSnapshot, PendingEvents, Phy, Port, WalkState};
pub use registry::DeviceRegistry;
