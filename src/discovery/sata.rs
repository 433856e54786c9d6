//! SATA discovery and power management
//!
//! SATA devices and port multipliers attached directly to a port are
//! bridged by an ATA port created when the device is built. Suspend makes
//! the driver forget every listed device and deforms the port; resume only
//! wakes the bridges, since the SAS-level lists are left intact.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::device::Device;
use super::host::HostAdapter;
use super::port::PendingEvents;
use crate::domain::events::{DeviceEventKind, TopologyEvent};
use crate::domain::ports::PortId;
use crate::error::Result;

impl HostAdapter {
    /// Offer a directly attached SATA device to the driver and queue its Add.
    pub(crate) fn discover_sata(self: &Arc<Self>, device: &Arc<Device>) -> Result<()> {
        self.notify_found(device)?;
        self.notify_device_event(device, DeviceEventKind::Add)
    }

    /// Suspend every device of a port's domain.
    #[instrument(skip(self))]
    pub(crate) async fn suspend_devices(self: &Arc<Self>, port: PortId) -> Result<()> {
        let port = self.port(port)?;
        port.clear_pending(PendingEvents::SUSPEND);

        let _guard = self.domain.lock().await;
        let lists = port.lists();

        let devices: Vec<Arc<Device>> = lists
            .devices
            .iter()
            .chain(lists.expanders.iter())
            .filter_map(|h| self.registry.get(*h))
            .collect();

        for device in &devices {
            if let Some(ap) = device.sata().and_then(|s| s.bridge()) {
                self.sata.suspend(ap);
            }
        }
        for device in &devices {
            self.notify_gone(device);
        }

        for phy in port.phys() {
            self.driver.port_deformed(port.id(), phy.id());
            phy.set_suspended(true);
        }
        port.set_suspended(true);

        info!(port = %port.id(), devices = devices.len(), "port suspended");
        self.events
            .publish(TopologyEvent::port_suspended(port.id(), devices.len()));
        Ok(())
    }

    /// Resume the SATA bridges of a port's domain.
    #[instrument(skip(self))]
    pub(crate) async fn resume_devices(self: &Arc<Self>, port: PortId) -> Result<()> {
        let port = self.port(port)?;
        port.clear_pending(PendingEvents::RESUME);

        let _guard = self.domain.lock().await;
        let mut resumed = 0;
        for handle in port.lists().devices {
            let Some(device) = self.registry.get(handle) else {
                continue;
            };
            if let Some(ap) = device.sata().and_then(|s| s.bridge()) {
                self.sata.resume(ap);
                resumed += 1;
            }
        }

        debug!(port = %port.id(), resumed, "SATA bridges resumed");
        self.events.publish(TopologyEvent::port_resumed(port.id()));
        Ok(())
    }
}
