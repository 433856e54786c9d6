//! Host adapter
//!
//! The [`HostAdapter`] ties together the ports of one SAS host bus adapter,
//! the device registry, the event dispatcher and the external collaborators.
//!
//! # Locking
//!
//! ```text
//! DomainLock (async, coarse)   list membership, port roots, discovery and
//!                              revalidation of a whole domain
//! per-object mutexes (fine)    PHY targets, received frames, children,
//!                              pending bits; never held across an await
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, trace};

use super::device::{Device, DeviceSnapshot};
use super::dispatcher::{DomainEventKind, Event, EventDispatcher};
use super::port::{PendingEvents, Port};
use super::registry::DeviceRegistry;
use crate::config::DiscoveryConfig;
use crate::domain::events::{DeviceEventKind, TopologyEvent};
use crate::domain::ports::{
    DeviceHandle, EventSink, ExpanderProtocol, LowLevelDriver, PortId, ReportingLayer, SataHost,
};
use crate::error::{Error, Result};
use crate::metrics::DiscoveryMetrics;

// =============================================================================
// Domain Lock
// =============================================================================

/// Coarse lock serializing structural changes to a host's domains.
#[derive(Debug, Default)]
pub struct DomainLock(tokio::sync::Mutex<()>);

impl DomainLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> DomainGuard<'_> {
        DomainGuard(self.0.lock().await)
    }
}

/// Proof that the domain lock is held.
pub struct DomainGuard<'a>(#[allow(dead_code)] tokio::sync::MutexGuard<'a, ()>);

// =============================================================================
// Collaborators
// =============================================================================

/// External collaborators the engine reaches through its ports.
#[derive(Clone)]
pub struct Collaborators {
    pub driver: Arc<dyn LowLevelDriver>,
    pub reporting: Arc<dyn ReportingLayer>,
    pub sata: Arc<dyn SataHost>,
    pub expander: Arc<dyn ExpanderProtocol>,
    pub events: Arc<dyn EventSink>,
}

#[derive(Debug, Default)]
struct SspRecovery {
    queue: Vec<DeviceHandle>,
    active: usize,
}

/// Serializable view of one port.
#[derive(Debug, Clone, Serialize)]
pub struct PortSnapshot {
    pub port: u32,
    pub attached_sas_address: String,
    pub suspended: bool,
    pub root: Option<String>,
    pub pending: usize,
    pub devices: Vec<DeviceSnapshot>,
}

// =============================================================================
// Host Adapter
// =============================================================================

/// One SAS host bus adapter and the domains behind its ports.
pub struct HostAdapter {
    name: String,
    pub(crate) config: DiscoveryConfig,
    pub(crate) domain: DomainLock,
    pub(crate) registry: DeviceRegistry,
    ports: DashMap<PortId, Arc<Port>>,
    pub(crate) driver: Arc<dyn LowLevelDriver>,
    pub(crate) reporting: Arc<dyn ReportingLayer>,
    pub(crate) sata: Arc<dyn SataHost>,
    pub(crate) expander: Arc<dyn ExpanderProtocol>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) metrics: DiscoveryMetrics,
    ata_recovery: AtomicBool,
    ssp_recovery: Mutex<SspRecovery>,
}

impl HostAdapter {
    /// Create a host adapter with no ports.
    pub fn new(
        name: impl Into<String>,
        config: DiscoveryConfig,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let metrics = DiscoveryMetrics::new()?;
        let registry = DeviceRegistry::new(
            collaborators.reporting.clone(),
            collaborators.sata.clone(),
            collaborators.events.clone(),
            metrics.clone(),
        );
        let dispatcher = EventDispatcher::new(config.max_concurrent_events);

        Ok(Arc::new(Self {
            name: name.into(),
            config,
            domain: DomainLock::new(),
            registry,
            ports: DashMap::new(),
            driver: collaborators.driver,
            reporting: collaborators.reporting,
            sata: collaborators.sata,
            expander: collaborators.expander,
            events: collaborators.events,
            dispatcher,
            metrics,
            ata_recovery: AtomicBool::new(false),
            ssp_recovery: Mutex::new(SspRecovery::default()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &DiscoveryMetrics {
        &self.metrics
    }

    /// Acquire the coarse domain lock.
    pub async fn lock_domain(&self) -> DomainGuard<'_> {
        self.domain.lock().await
    }

    // -------------------------------------------------------------------------
    // Ports
    // -------------------------------------------------------------------------

    /// Register a formed port, replacing any port with the same id.
    pub fn add_port(&self, port: Port) -> Arc<Port> {
        let port = Arc::new(port);
        info!(host = %self.name, port = %port.id(), phys = port.num_phys(), "port formed");
        self.ports.insert(port.id(), port.clone());
        port
    }

    pub fn port(&self, id: PortId) -> Result<Arc<Port>> {
        self.ports
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or(Error::UnknownPort(id))
    }

    pub fn port_ids(&self) -> Vec<PortId> {
        let mut ids: Vec<_> = self.ports.iter().map(|p| *p.key()).collect();
        ids.sort();
        ids
    }

    // -------------------------------------------------------------------------
    // Event submission
    // -------------------------------------------------------------------------

    /// Queue a device event, holding a reference until it has run.
    pub(crate) fn notify_device_event(
        self: &Arc<Self>,
        device: &Arc<Device>,
        kind: DeviceEventKind,
    ) -> Result<()> {
        self.registry.retain(device);
        let event = Event::Device {
            kind,
            device: device.clone(),
        };
        if let Err(e) = self.dispatcher.submit(self, device.port(), event) {
            self.registry.release(device);
            return Err(e);
        }

        trace!(device = %device.handle(), event = %kind, "device event queued");
        self.events.publish(TopologyEvent::device_event_queued(
            device.sas_address(),
            kind,
        ));
        Ok(())
    }

    /// Queue a domain event for a port.
    ///
    /// Revalidate, suspend and resume coalesce: while one is pending a
    /// second request is dropped and `Ok(false)` is returned.
    pub fn notify_domain_event(self: &Arc<Self>, port: PortId, kind: DomainEventKind) -> Result<bool> {
        let port_ref = self.port(port)?;
        let bit = kind.pending_bit();

        if let Some(bit) = bit {
            if !port_ref.set_pending(bit) {
                trace!(port = %port, event = %kind, "coalesced with pending event");
                return Ok(false);
            }
        }

        if let Err(e) = self.dispatcher.submit(self, port, Event::Domain { kind, port }) {
            if let Some(bit) = bit {
                port_ref.clear_pending(bit);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Queue discovery of a port's domain.
    pub fn queue_discovery(self: &Arc<Self>, port: PortId) -> Result<bool> {
        self.notify_domain_event(port, DomainEventKind::Discover)
    }

    pub fn queue_revalidation(self: &Arc<Self>, port: PortId) -> Result<bool> {
        self.notify_domain_event(port, DomainEventKind::Revalidate)
    }

    pub fn queue_suspend(self: &Arc<Self>, port: PortId) -> Result<bool> {
        self.notify_domain_event(port, DomainEventKind::Suspend)
    }

    pub fn queue_resume(self: &Arc<Self>, port: PortId) -> Result<bool> {
        self.notify_domain_event(port, DomainEventKind::Resume)
    }

    /// Wait until every queued event, including chained ones, has run.
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
    }

    /// Stop accepting domain events, drain in-flight work and stop the lanes.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        info!(host = %self.name, "event dispatcher stopped");
    }

    // -------------------------------------------------------------------------
    // Error-handling linkage
    // -------------------------------------------------------------------------

    /// Link recovery on a SATA link has started; revalidations defer.
    pub fn begin_ata_recovery(&self) {
        self.ata_recovery.store(true, Ordering::Release);
        debug!(host = %self.name, "ATA recovery active");
    }

    pub fn ata_recovery_active(&self) -> bool {
        self.ata_recovery.load(Ordering::Acquire)
    }

    /// Link recovery finished; re-queue every deferred revalidation.
    #[instrument(skip(self), fields(host = %self.name))]
    pub fn finish_ata_recovery(self: &Arc<Self>) -> Result<usize> {
        self.ata_recovery.store(false, Ordering::Release);

        let mut requeued = 0;
        for id in self.port_ids() {
            let port = self.port(id)?;
            if !port.pending().contains(PendingEvents::REVALIDATE) {
                continue;
            }
            let event = Event::Domain {
                kind: DomainEventKind::Revalidate,
                port: id,
            };
            self.dispatcher.submit(self, id, event)?;
            requeued += 1;
        }

        if requeued > 0 {
            info!(requeued, "re-queued deferred revalidations");
        }
        Ok(requeued)
    }

    /// Link an end device into the SSP recovery list.
    pub fn queue_ssp_recovery(&self, handle: DeviceHandle) -> Result<bool> {
        let device = self.registry.get(handle).ok_or(Error::StaleHandle(handle))?;
        if !device.enter_recovery() {
            return Ok(false);
        }
        let mut eh = self.ssp_recovery.lock();
        eh.queue.push(handle);
        eh.active += 1;
        Ok(true)
    }

    /// Unlink a device from the SSP recovery list.
    pub fn complete_ssp_recovery(&self, handle: DeviceHandle) -> bool {
        match self.registry.get(handle) {
            Some(device) => self.cancel_ssp_recovery(&device),
            None => false,
        }
    }

    pub(crate) fn cancel_ssp_recovery(&self, device: &Device) -> bool {
        if !device.leave_recovery() {
            return false;
        }
        let mut eh = self.ssp_recovery.lock();
        if let Some(pos) = eh.queue.iter().position(|h| *h == device.handle()) {
            eh.queue.remove(pos);
        }
        eh.active = eh.active.saturating_sub(1);
        true
    }

    pub fn ssp_recovery_queue(&self) -> Vec<DeviceHandle> {
        self.ssp_recovery.lock().queue.clone()
    }

    pub fn ssp_recovery_active(&self) -> usize {
        self.ssp_recovery.lock().active
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Serializable view of every port and the devices listed on it.
    pub fn topology(&self) -> Vec<PortSnapshot> {
        self.port_ids()
            .into_iter()
            .filter_map(|id| self.port(id).ok())
            .map(|port| {
                let lists = port.lists();
                let devices = lists
                    .expanders
                    .iter()
                    .chain(lists.devices.iter())
                    .chain(lists.disco.iter())
                    .filter_map(|h| self.registry.get(*h))
                    .map(|d| d.snapshot())
                    .collect();
                let pending = port.pending().bits().count_ones() as usize;
                PortSnapshot {
                    port: port.id().0,
                    attached_sas_address: port.link().attached_sas_address.to_string(),
                    suspended: port.is_suspended(),
                    root: self
                        .registry
                        .find_root(&port)
                        .map(|d| d.sas_address().to_string()),
                    pending,
                    devices,
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for HostAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAdapter")
            .field("name", &self.name)
            .field("ports", &self.ports.len())
            .field("registry", &self.registry)
            .finish()
    }
}
