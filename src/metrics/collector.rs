//! Discovery metrics collector
//!
//! Each host adapter owns a private registry so several hosts (or tests)
//! can coexist in one process without clashing on metric names.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::domain::events::DeviceEventKind;
use crate::error::{Error, Result};

/// Prometheus metrics for one host adapter.
#[derive(Clone)]
pub struct DiscoveryMetrics {
    registry: Registry,
    discovery_runs: IntCounterVec,
    device_events: IntCounterVec,
    domain_events: IntCounterVec,
    devices_live: IntGauge,
    revalidations_deferred: IntCounter,
}

impl DiscoveryMetrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let discovery_runs = IntCounterVec::new(
            Opts::new("sas_discovery_runs_total", "Discovery runs by result"),
            &["result"],
        )?;
        let device_events = IntCounterVec::new(
            Opts::new("sas_device_events_total", "Device lifecycle events executed"),
            &["kind"],
        )?;
        let domain_events = IntCounterVec::new(
            Opts::new("sas_domain_events_total", "Port-level domain events executed"),
            &["kind"],
        )?;
        let devices_live = IntGauge::new("sas_devices_live", "Devices currently allocated")?;
        let revalidations_deferred = IntCounter::new(
            "sas_revalidations_deferred_total",
            "Revalidations postponed by link recovery",
        )?;

        registry.register(Box::new(discovery_runs.clone()))?;
        registry.register(Box::new(device_events.clone()))?;
        registry.register(Box::new(domain_events.clone()))?;
        registry.register(Box::new(devices_live.clone()))?;
        registry.register(Box::new(revalidations_deferred.clone()))?;

        Ok(Self {
            registry,
            discovery_runs,
            device_events,
            domain_events,
            devices_live,
            revalidations_deferred,
        })
    }

    pub fn record_discovery(&self, result: &str) {
        self.discovery_runs.with_label_values(&[result]).inc();
    }

    pub fn record_device_event(&self, kind: DeviceEventKind) {
        let kind = kind.to_string();
        self.device_events.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_domain_event(&self, kind: &str) {
        self.domain_events.with_label_values(&[kind]).inc();
    }

    pub fn device_allocated(&self) {
        self.devices_live.inc();
    }

    pub fn device_freed(&self) {
        self.devices_live.dec();
    }

    pub fn record_deferred(&self) {
        self.revalidations_deferred.inc();
    }

    /// Number of device events of a kind executed so far.
    pub fn device_events(&self, kind: DeviceEventKind) -> u64 {
        let kind = kind.to_string();
        self.device_events.with_label_values(&[kind.as_str()]).get()
    }

    /// Number of devices currently allocated.
    pub fn devices_live(&self) -> i64 {
        self.devices_live.get()
    }

    /// Render all metrics in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for DiscoveryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryMetrics")
            .field("devices_live", &self.devices_live.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = DiscoveryMetrics::new().unwrap();

        metrics.record_device_event(DeviceEventKind::Add);
        metrics.record_device_event(DeviceEventKind::Add);
        metrics.record_device_event(DeviceEventKind::Delete);
        assert_eq!(metrics.device_events(DeviceEventKind::Add), 2);
        assert_eq!(metrics.device_events(DeviceEventKind::Delete), 1);

        metrics.device_allocated();
        metrics.device_allocated();
        metrics.device_freed();
        assert_eq!(metrics.devices_live(), 1);
    }

    #[test]
    fn test_gather_text() {
        let metrics = DiscoveryMetrics::new().unwrap();
        metrics.record_discovery("ok");
        metrics.record_deferred();

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("sas_discovery_runs_total{result=\"ok\"} 1"));
        assert!(text.contains("sas_revalidations_deferred_total 1"));
    }
}
