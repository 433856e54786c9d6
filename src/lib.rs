//! SAS Discovery - Domain Discovery Engine for SAS Host Bus Adapters
//!
//! Discovers the devices reachable through the ports of a SAS host bus
//! adapter, classifies them from the frames their links deliver, registers
//! them with a reporting layer, and tears them down when links go away.
//! Every device is reference counted so that asynchronous events, expander
//! children and driver notifications can all keep it alive safely.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   events   ┌──────────────┐   hooks   ┌──────────────┐
//! │  PHY / link  │───────────▶│  Discovery   │──────────▶│ Collaborators│
//! │   changes    │            │   engine     │           │ (ports)      │
//! └──────────────┘            └──────────────┘           └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Recording, simulated and logging implementations of the ports
//! - [`config`] - Engine configuration
//! - [`discovery`] - Classifier, registry, ports, lifecycle and event dispatch
//! - [`domain`] - Value objects, collaborator ports and topology events
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics

pub mod adapters;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::DiscoveryConfig;
pub use discovery::{Collaborators, DomainEventKind, HostAdapter, Phy, Port};
pub use error::{Error, Result};
pub use metrics::DiscoveryMetrics;
