//! Discovery driver
//!
//! Builds the root device of a port from the frame its link delivered and
//! dispatches discovery by device kind. Everything allocated along the way
//! is unwound if discovery fails.
//!
//! # Flow
//!
//! ```text
//! discover_domain
//!   ├─ wait for the previous occupant to drain (root was set)
//!   ├─ lock domain
//!   ├─ get_port_device: capture → classify → allocate → list
//!   └─ by kind
//!        end device   → found, queue Add
//!        SATA         → found, queue Add
//!        expander     → register, found, walk the tree
//! ```

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::device::{Device, DeviceSpec, Phase};
use super::frame::classify;
use super::host::{DomainGuard, HostAdapter};
use super::port::Port;
use crate::domain::events::{DeviceEventKind, TopologyEvent};
use crate::domain::ports::{DeviceHandle, PortId};
use crate::error::{Error, Result};

impl HostAdapter {
    /// Discover the domain behind a port and install its root device.
    #[instrument(skip(self), fields(host = %self.name()))]
    pub async fn discover_domain(self: &Arc<Self>, port: PortId) -> Result<DeviceHandle> {
        let port = self.port(port)?;
        self.drain_port(&port).await?;
        self.discover_drained(&port).await
    }

    /// Wait for the previous occupant of a port, if any, to unregister.
    ///
    /// Runs without the domain lock held and without an event permit, so the
    /// Delete events being waited on can make progress.
    pub(crate) async fn drain_port(&self, port: &Port) -> Result<()> {
        if port.root().is_none() {
            return Ok(());
        }
        if let Err(e) = self.wait_port_clear(port).await {
            self.record_discovery_failure(port, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Discover a port whose previous occupant has drained.
    pub(crate) async fn discover_drained(self: &Arc<Self>, port: &Port) -> Result<DeviceHandle> {
        let guard = self.domain.lock().await;

        let device = match self.get_port_device(&guard, port) {
            Ok(device) => device,
            Err(e) => {
                self.record_discovery_failure(port, &e);
                return Err(e);
            }
        };

        info!(
            port = %port.id(),
            device = %device.handle(),
            address = %device.sas_address(),
            kind = %device.kind(),
            "discovering domain"
        );

        let kind = device.kind();
        let result = if kind.is_expander() {
            self.discover_root_expander(&guard, port, &device).await
        } else if kind.is_sata() {
            self.discover_sata(&device)
        } else {
            self.discover_end_device(&device)
        };

        if let Err(e) = result {
            self.abandon(&guard, port, &device);
            self.record_discovery_failure(port, &e);
            return Err(e);
        }

        self.metrics.record_discovery("ok");
        debug!(port = %port.id(), "discovery done");
        Ok(device.handle())
    }

    /// Poll until all three device lists of the port are empty.
    async fn wait_port_clear(&self, port: &Port) -> Result<()> {
        let attempts = self.config.drain_attempts();

        for _ in 0..attempts {
            tokio::time::sleep(self.config.drain_poll_interval).await;
            let _guard = self.domain.lock().await;
            if port.is_clear() {
                return Ok(());
            }
        }

        warn!(port = %port.id(), "timed out waiting for port to clear");
        Err(Error::Timeout {
            port: port.id(),
            waited: self.config.drain_timeout,
        })
    }

    /// Build the device attached directly to the port.
    ///
    /// On success the device is the port's root, sits on the pending list
    /// (or the expander list), and every member PHY targets it.
    pub(crate) fn get_port_device(&self, guard: &DomainGuard<'_>, port: &Port) -> Result<Arc<Device>> {
        let (frame, phy) = port
            .capture_frame(self.config.max_frame_size)
            .ok_or(Error::NoDevice { port: port.id() })?;
        let link = port.link();
        let classification = classify(&frame, link.oob_mode)?;

        let device = self.registry.allocate(DeviceSpec {
            port: port.id(),
            sas_address: link.attached_sas_address,
            classification,
            linkrate: link.linkrate,
            pathways: port.num_phys(),
            phy_identifier: phy.id(),
            parent: None,
            parent_address: None,
        })?;

        if let Err(e) = self.attach_collaborators(&device) {
            self.registry.release(&device);
            return Err(e);
        }

        device.pin_phy(phy);
        port.reset_walk();
        port.set_root(guard, Some(device.handle()));
        if device.kind().is_expander() {
            port.push_expander(guard, device.handle());
        } else {
            port.push_pending(guard, device.handle());
        }
        port.set_phy_targets(Some(device.handle()));

        self.events.publish(TopologyEvent::device_discovered(
            port.id(),
            device.sas_address(),
            device.kind(),
            None,
        ));
        Ok(device)
    }

    /// Create the SATA bridge (if any) and the reporting object.
    pub(crate) fn attach_collaborators(&self, device: &Device) -> Result<()> {
        let info = device.info();

        if device.kind().is_sata() {
            let ap = self.sata.init(&info).map_err(|code| Error::ProbeFailed {
                address: device.sas_address(),
                code,
            })?;
            device.set_sata_bridge(ap);
        }

        let id = self.reporting.allocate(&info).ok_or_else(|| {
            Error::OutOfMemory(format!("reporting object for {}", device.sas_address()))
        })?;
        self.reporting.retain(id);
        device.set_reporting(id);
        Ok(())
    }

    fn discover_end_device(self: &Arc<Self>, device: &Arc<Device>) -> Result<()> {
        self.notify_found(device)?;
        self.notify_device_event(device, DeviceEventKind::Add)
    }

    /// Undo a partially built device during a failed discovery.
    ///
    /// Children an expander already gained are queued for removal.
    pub(crate) fn abandon(self: &Arc<Self>, guard: &DomainGuard<'_>, port: &Port, device: &Arc<Device>) {
        if let Some(exp) = device.expander() {
            for child in exp.children().into_iter().rev() {
                if let Some(child) = self.registry.get(child) {
                    self.unregister_subtree(&child);
                }
            }
        }
        if let Some(id) = device.reporting() {
            if device.phase() == Phase::Registered {
                self.reporting.withdraw(id);
            } else {
                self.reporting.discard(id);
            }
        }
        debug!(device = %device.handle(), "abandoning device");
        self.detach(guard, port, device);
    }

    fn record_discovery_failure(&self, port: &Port, error: &Error) {
        warn!(port = %port.id(), error = %error, "discovery failed");
        let result = match error {
            Error::Timeout { .. } => "timeout",
            Error::NoDevice { .. } => "no_device",
            _ => "error",
        };
        self.metrics.record_discovery(result);
        self.events
            .publish(TopologyEvent::discovery_failed(port.id(), error.to_string()));
    }
}
