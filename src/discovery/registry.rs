//! Device registry
//!
//! Arena of live devices keyed by [`DeviceHandle`]. The registry owns the
//! reference-count protocol: [`DeviceRegistry::retain`] and
//! [`DeviceRegistry::release`] are the only ways counts change, and the
//! destructor runs exactly once, on whichever release reaches zero.
//!
//! # Reference Holders
//!
//! ```text
//! allocation ──────► 1   (list membership, port root, or parent's child slot)
//! dev_found          +1  (dropped by the matching dev_gone)
//! child              +1  on its parent
//! queued event       +1  (dropped when the event finishes)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, trace};

use super::device::{Device, DeviceSpec};
use super::port::Port;
use crate::domain::events::TopologyEvent;
use crate::domain::ports::{DeviceHandle, EventSink, ReportingLayer, SataHost};
use crate::error::{Error, Result};
use crate::metrics::DiscoveryMetrics;

/// Arena of live devices.
pub struct DeviceRegistry {
    devices: DashMap<DeviceHandle, Arc<Device>>,
    next_handle: AtomicU64,
    reporting: Arc<dyn ReportingLayer>,
    sata: Arc<dyn SataHost>,
    events: Arc<dyn EventSink>,
    metrics: DiscoveryMetrics,
}

impl DeviceRegistry {
    pub fn new(
        reporting: Arc<dyn ReportingLayer>,
        sata: Arc<dyn SataHost>,
        events: Arc<dyn EventSink>,
        metrics: DiscoveryMetrics,
    ) -> Self {
        Self {
            devices: DashMap::new(),
            next_handle: AtomicU64::new(1),
            reporting,
            sata,
            events,
            metrics,
        }
    }

    /// Allocate a device with a reference count of one.
    ///
    /// A child takes a counted reference on its parent, released by the
    /// child's destructor.
    pub fn allocate(&self, spec: DeviceSpec) -> Result<Arc<Device>> {
        if let Some(parent) = spec.parent {
            let parent = self.get(parent).ok_or(Error::StaleHandle(parent))?;
            self.retain(&parent);
        }

        let handle = DeviceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let device = Arc::new(Device::new(handle, spec));
        self.devices.insert(handle, device.clone());
        self.metrics.device_allocated();

        trace!(device = %handle, address = %device.sas_address(), "allocated");
        Ok(device)
    }

    /// Look up a live device.
    pub fn get(&self, handle: DeviceHandle) -> Option<Arc<Device>> {
        self.devices.get(&handle).map(|d| d.value().clone())
    }

    /// The device at the root of a port's domain, if any.
    pub fn find_root(&self, port: &Port) -> Option<Arc<Device>> {
        port.root().and_then(|h| self.get(h))
    }

    /// Take an additional reference.
    pub fn retain(&self, device: &Device) {
        let prev = device
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c > 0).then(|| c + 1)
            });

        if prev.is_err() {
            error!(device = %device.handle(), "retain on a released device");
            debug_assert!(false, "retain on a released device");
        }
    }

    /// Drop a reference, running the destructor when it was the last.
    pub fn release(&self, device: &Device) {
        match device
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(1) => self.destroy(device),
            Ok(_) => {}
            Err(_) => {
                error!(device = %device.handle(), "reference count underflow");
                debug_assert!(false, "reference count underflow");
            }
        }
    }

    /// Number of live devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Handles of all live devices, in allocation order.
    pub fn handles(&self) -> Vec<DeviceHandle> {
        let mut handles: Vec<_> = self.devices.iter().map(|e| *e.key()).collect();
        handles.sort();
        handles
    }

    fn destroy(&self, device: &Device) {
        // Out of the arena before any collaborator runs, so nothing can
        // resurrect the device through a lookup.
        self.devices.remove(&device.handle());

        if let Some(id) = device.take_reporting() {
            self.reporting.release(id);
        }

        if let Some(parent) = device.parent() {
            match self.get(parent) {
                Some(parent) => self.release(&parent),
                None => error!(device = %device.handle(), parent = %parent, "parent freed before child"),
            }
        }

        device.unpin_phy();

        let orphans = device.clear_sub_state();
        if orphans > 0 {
            error!(device = %device.handle(), orphans, "expander freed with children linked");
        }

        if let Some(ap) = device.take_sata_bridge() {
            self.sata.destroy(ap);
        }

        self.metrics.device_freed();
        self.events
            .publish(TopologyEvent::device_released(device.sas_address()));
        debug!(device = %device.handle(), address = %device.sas_address(), "device freed");
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventSink, RecordingDriver};
    use crate::discovery::frame::Classification;
    use crate::domain::ports::{DeviceKind, LinkRate, PortId, Protocol, SasAddress};

    fn registry() -> (DeviceRegistry, Arc<RecordingDriver>, Arc<InMemoryEventSink>) {
        let driver = Arc::new(RecordingDriver::new());
        let sink = Arc::new(InMemoryEventSink::new());
        let registry = DeviceRegistry::new(
            driver.clone(),
            driver.clone(),
            sink.clone(),
            DiscoveryMetrics::new().unwrap(),
        );
        (registry, driver, sink)
    }

    fn spec(kind: DeviceKind, addr: u64, parent: Option<&Device>) -> DeviceSpec {
        DeviceSpec {
            port: PortId(0),
            sas_address: SasAddress::from_u64(addr),
            classification: Classification {
                kind,
                initiator_protocols: Protocol::empty(),
                target_protocols: Protocol::SSP,
            },
            linkrate: LinkRate::G6,
            pathways: 1,
            phy_identifier: 0,
            parent: parent.map(|p| p.handle()),
            parent_address: parent.map(|p| p.sas_address()),
        }
    }

    #[test]
    fn test_destructor_runs_once_at_zero() {
        let (registry, _, sink) = registry();
        let dev = registry.allocate(spec(DeviceKind::EndDevice, 0x10, None)).unwrap();
        let handle = dev.handle();

        registry.retain(&dev);
        registry.release(&dev);
        assert!(registry.get(handle).is_some());
        assert_eq!(dev.refcount(), 1);

        registry.release(&dev);
        assert!(registry.get(handle).is_none());
        assert_eq!(sink.count_by_type("DeviceReleased"), 1);
    }

    #[test]
    fn test_handles_are_never_reused() {
        let (registry, _, _) = registry();
        let a = registry.allocate(spec(DeviceKind::EndDevice, 0x10, None)).unwrap();
        registry.release(&a);
        let b = registry.allocate(spec(DeviceKind::EndDevice, 0x10, None)).unwrap();
        assert_ne!(a.handle(), b.handle());
        assert!(registry.get(a.handle()).is_none());
    }

    #[test]
    fn test_child_pins_parent() {
        let (registry, _, _) = registry();
        let parent = registry
            .allocate(spec(DeviceKind::EdgeExpander, 0x20, None))
            .unwrap();
        let child = registry
            .allocate(spec(DeviceKind::EndDevice, 0x21, Some(&parent)))
            .unwrap();
        assert_eq!(parent.refcount(), 2);

        registry.release(&parent);
        assert!(registry.get(parent.handle()).is_some());

        registry.release(&child);
        assert!(registry.get(child.handle()).is_none());
        assert!(registry.get(parent.handle()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_destructor_releases_reporting_and_bridge() {
        let (registry, driver, _) = registry();
        let dev = registry.allocate(spec(DeviceKind::SataDevice, 0x30, None)).unwrap();

        let info = dev.info();
        let id = driver.allocate_object(&info);
        driver.retain_object(id);
        dev.set_reporting(id);
        dev.set_sata_bridge(crate::domain::ports::SataPortId(7));

        registry.release(&dev);
        assert_eq!(driver.object_refs(id), 1);
        assert!(driver.bridge_destroyed(crate::domain::ports::SataPortId(7)));
    }

    #[test]
    fn test_allocate_under_stale_parent_fails() {
        let (registry, _, _) = registry();
        let parent = registry
            .allocate(spec(DeviceKind::EdgeExpander, 0x20, None))
            .unwrap();
        let stale = spec(DeviceKind::EndDevice, 0x21, Some(&parent));
        registry.release(&parent);

        let err = registry.allocate(stale).unwrap_err();
        assert!(matches!(err, Error::StaleHandle(_)));
        assert!(registry.is_empty());
    }
}
