//! Metrics module
//!
//! Prometheus counters describing discovery activity.

mod collector;

pub use collector::DiscoveryMetrics;
