//! Device lifecycle
//!
//! Registration (Add), withdrawal (Delete) and the driver notifications
//! that bracket a device's time in the domain.
//!
//! ```text
//!  Discovered ──Add──► Registered ──Delete──► Unregistered ──last ref──► freed
//!      │                   ▲
//!      └── probe or register fails ──► ProbeFailed ──Delete──┘
//! ```

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::device::{Device, Phase};
use super::host::{DomainGuard, HostAdapter};
use super::port::Port;
use crate::domain::events::{DeviceEventKind, TopologyEvent};
use crate::domain::ports::{DeviceHandle, HookError, PortId};
use crate::error::{Error, Result};

impl HostAdapter {
    // =========================================================================
    // Driver Notifications
    // =========================================================================

    /// Offer a classified device to the driver.
    ///
    /// Success takes a reference owned by the found flag; it is dropped by
    /// the matching [`notify_gone`](Self::notify_gone).
    pub(crate) fn notify_found(&self, device: &Device) -> Result<()> {
        match self.driver.dev_found(&device.info()) {
            Ok(()) => {
                self.registry.retain(device);
                device.set_found();
                Ok(())
            }
            Err(code) => {
                warn!(device = %device.handle(), address = %device.sas_address(), %code, "driver rejected device");
                Err(Error::ProbeFailed {
                    address: device.sas_address(),
                    code,
                })
            }
        }
    }

    /// Tell the driver to forget the device, once per successful found.
    pub(crate) fn notify_gone(&self, device: &Device) {
        if device.take_found() {
            self.driver.dev_gone(&device.info());
            self.registry.release(device);
        }
    }

    // =========================================================================
    // Add
    // =========================================================================

    /// Register a discovered device with the consumer layer.
    #[instrument(skip(self, device), fields(device = %device.handle(), address = %device.sas_address()))]
    pub(crate) async fn add_device(self: &Arc<Self>, device: &Arc<Device>) {
        let Ok(port) = self.port(device.port()) else {
            error!("add for device on unknown port");
            return;
        };

        {
            let guard = self.domain.lock().await;
            if !port.is_pending(&guard, device.handle()) {
                error!("add for device not on the pending list");
                debug_assert!(false, "add for device not on the pending list");
                return;
            }
            if device.is_destroy_requested() {
                port.remove_pending(&guard, device.handle());
                debug!("destroy requested before add; skipping registration");
                return;
            }
            port.activate(&guard, device.handle());
        }

        if let Some(ap) = device.sata().and_then(|s| s.bridge()) {
            if let Err(code) = self.sata.probe(&device.info(), ap) {
                self.fail_probe(device, code);
                return;
            }
        }

        let Some(id) = device.reporting() else {
            error!("device has no reporting object");
            return;
        };
        match self.reporting.register(id) {
            Ok(()) => {
                device.set_phase(Phase::Registered);
                info!(kind = %device.kind(), "device registered");
                self.events
                    .publish(TopologyEvent::device_registered(device.sas_address()));
            }
            Err(code) => self.fail_probe(device, code),
        }
    }

    /// Mark a device failed-to-probe and request its removal.
    fn fail_probe(self: &Arc<Self>, device: &Arc<Device>, code: HookError) {
        warn!(device = %device.handle(), %code, "probe failed");
        device.set_phase(Phase::ProbeFailed);
        self.events.publish(TopologyEvent::device_registration_failed(
            device.sas_address(),
            code.0,
        ));
        if let Err(e) = self.unregister_device_ref(device) {
            warn!(device = %device.handle(), error = %e, "could not queue removal");
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Withdraw a device and drop its list reference.
    #[instrument(skip(self, device), fields(device = %device.handle(), address = %device.sas_address()))]
    pub(crate) async fn del_device(self: &Arc<Self>, device: &Arc<Device>) {
        let Ok(port) = self.port(device.port()) else {
            error!("delete for device on unknown port");
            return;
        };
        let reporting = device.reporting();

        if device.kind().is_expander() {
            if let Some(id) = reporting {
                self.reporting.detach_expander_port(id);
            }
        }

        let was_registered = match device.phase() {
            Phase::Registered => {
                self.driver.before_dev_gone(&device.info());
                if let Some(id) = reporting {
                    self.reporting.remove_children(id);
                    self.reporting.withdraw(id);
                }
                true
            }
            Phase::ProbeFailed | Phase::Discovered => {
                device.take_probe_failed();
                if let Some(id) = reporting {
                    self.reporting.discard(id);
                }
                false
            }
            Phase::Unregistered => {
                error!("delete for an already unregistered device");
                debug_assert!(false, "delete for an already unregistered device");
                return;
            }
        };

        {
            let guard = self.domain.lock().await;
            self.detach(&guard, &port, device);
        }

        if let Some(id) = reporting {
            if self.reporting.parent_port_phys(id) == 0 {
                self.reporting.delete_parent_port(id);
            }
        }

        info!(was_registered, "device removed");
        self.events.publish(TopologyEvent::device_removed(
            device.sas_address(),
            was_registered,
        ));
    }

    /// Unlink a device from the domain and drop the list reference.
    ///
    /// Clears the port root (or the parent's child slot), every list entry,
    /// SATA recovery and SSP recovery linkage. The caller must still hold
    /// its own reference.
    pub(crate) fn detach(&self, guard: &DomainGuard<'_>, port: &Port, device: &Device) {
        self.notify_gone(device);

        match device.parent() {
            None => {
                port.clear_root(guard, device.handle());
                port.clear_phy_targets(device.handle());
            }
            Some(parent) => {
                if let Some(parent) = self.registry.get(parent) {
                    if let Some(exp) = parent.expander() {
                        exp.remove_child(device.handle());
                    }
                }
            }
        }
        port.unlink(guard, device.handle());

        if let Some(ap) = device.sata().and_then(|s| s.bridge()) {
            self.sata.end_recovery(ap);
        }
        self.cancel_ssp_recovery(device);

        device.set_phase(Phase::Unregistered);
        self.registry.release(device);
    }

    // =========================================================================
    // Unregistration
    // =========================================================================

    /// Request removal of a device by handle.
    ///
    /// Returns `Ok(false)` when a removal was already requested.
    pub fn unregister_device(self: &Arc<Self>, handle: DeviceHandle) -> Result<bool> {
        let device = self.registry.get(handle).ok_or(Error::StaleHandle(handle))?;
        self.unregister_device_ref(&device)
    }

    pub(crate) fn unregister_device_ref(self: &Arc<Self>, device: &Arc<Device>) -> Result<bool> {
        if !device.request_destroy() {
            return Ok(false);
        }
        if let Err(e) = self.notify_device_event(device, DeviceEventKind::Delete) {
            device.cancel_destroy();
            return Err(e);
        }
        Ok(true)
    }

    /// Request removal of a device and, for expanders, everything below it.
    ///
    /// Children are queued before their parent so they are withdrawn first.
    pub(crate) fn unregister_subtree(self: &Arc<Self>, device: &Arc<Device>) {
        if let Some(exp) = device.expander() {
            for child in exp.children().into_iter().rev() {
                if let Some(child) = self.registry.get(child) {
                    self.unregister_subtree(&child);
                }
            }
        }
        if let Err(e) = self.unregister_device_ref(device) {
            warn!(device = %device.handle(), error = %e, "could not queue removal");
        }
    }

    /// Request removal of every device of a port's domain.
    ///
    /// With `gone` set the link was lost, and listed devices are flagged so
    /// their consumers stop issuing commands.
    #[instrument(skip(self))]
    pub async fn unregister_domain_devices(self: &Arc<Self>, port: PortId, gone: bool) -> Result<usize> {
        let port = self.port(port)?;
        let _guard = self.domain.lock().await;
        let lists = port.lists();
        let mut requested = 0;

        let ordered = lists
            .disco
            .iter()
            .map(|h| (*h, false))
            .chain(lists.devices.iter().rev().map(|h| (*h, gone)))
            .chain(lists.expanders.iter().rev().map(|h| (*h, gone)));

        for (handle, mark_gone) in ordered {
            let Some(device) = self.registry.get(handle) else {
                continue;
            };
            if mark_gone {
                device.mark_gone();
            }
            if self.unregister_device_ref(&device)? {
                requested += 1;
            }
        }

        debug!(requested, "domain unregistration queued");
        Ok(requested)
    }
}
