//! Expander discovery and revalidation
//!
//! Walks the tree below an expander through the [`ExpanderProtocol`] port,
//! allocating a child for every attached address. Revalidation reconciles
//! the current PHY tables against the known children by SAS address:
//! unchanged children are left untouched, vanished subtrees are unregistered
//! leaves first, and newly attached devices are discovered.
//!
//! [`ExpanderProtocol`]: crate::domain::ports::ExpanderProtocol

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use super::device::{Device, DeviceSpec, Phase};
use super::frame::{classify, ReceivedFrame};
use super::host::{DomainGuard, HostAdapter};
use super::port::{PendingEvents, Port};
use crate::domain::events::{DeviceEventKind, TopologyEvent};
use crate::domain::ports::{AttachedDevice, DeviceKind, ExpanderPhy, PortId, SasAddress};
use crate::error::{Error, Result};

/// Attached devices of a PHY table, one entry per address.
///
/// Wide links report the same address on several PHYs; the lowest PHY wins.
fn attached_devices(phys: &[ExpanderPhy]) -> Vec<(u8, &AttachedDevice)> {
    let mut seen = HashSet::new();
    phys.iter()
        .filter_map(|phy| phy.attached.as_ref().map(|att| (phy.phy_id, att)))
        .filter(|(_, att)| !att.sas_address.is_zero())
        .filter(|(_, att)| seen.insert(att.sas_address))
        .collect()
}

impl HostAdapter {
    /// Register the root expander, offer it to the driver and walk its tree.
    pub(crate) async fn discover_root_expander(
        self: &Arc<Self>,
        guard: &DomainGuard<'_>,
        port: &Port,
        device: &Arc<Device>,
    ) -> Result<()> {
        self.register_expander(device)?;
        self.notify_found(device)?;
        self.walk_expander(guard, port, device, 0).await
    }

    fn register_expander(&self, device: &Device) -> Result<()> {
        let id = device
            .reporting()
            .ok_or_else(|| Error::Internal(format!("{} has no reporting object", device.handle())))?;
        self.reporting.register(id).map_err(|code| {
            self.events.publish(TopologyEvent::device_registration_failed(
                device.sas_address(),
                code.0,
            ));
            Error::ProbeFailed {
                address: device.sas_address(),
                code,
            }
        })?;
        device.set_phase(Phase::Registered);
        self.events
            .publish(TopologyEvent::device_registered(device.sas_address()));
        Ok(())
    }

    /// Interrogate an expander's PHY table under its command mutex.
    async fn report_phys(&self, port: PortId, expander: &Device) -> Result<Vec<ExpanderPhy>> {
        let state = expander
            .expander()
            .ok_or_else(|| Error::Internal(format!("{} is not an expander", expander.handle())))?;

        let phys = {
            let _cmd = state.cmd.lock().await;
            self.expander.report_phys(&expander.info()).await
        }
        .map_err(|code| Error::Link {
            port,
            reason: format!("report phys of {} failed: {}", expander.sas_address(), code),
        })?;

        state.record_phys(&phys);
        Ok(phys)
    }

    /// Depth-first walk below a freshly discovered expander.
    fn walk_expander<'a>(
        self: &'a Arc<Self>,
        guard: &'a DomainGuard<'a>,
        port: &'a Port,
        expander: &'a Arc<Device>,
        depth: usize,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let phys = self.report_phys(port.id(), expander).await?;
            port.update_walk(|w| w.max_level = w.max_level.max(depth + 1));

            for (phy_id, attached) in attached_devices(&phys) {
                let result = self
                    .discover_child(guard, port, expander, phy_id, attached, depth)
                    .await;
                self.skip_child_failure(expander, phy_id, result)?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Log and skip a child that could not be discovered.
    ///
    /// Link errors abort the walk; the link itself is recovered elsewhere.
    fn skip_child_failure(&self, expander: &Device, phy_id: u8, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e @ Error::Link { .. }) => Err(e),
            Err(e) => {
                warn!(
                    expander = %expander.sas_address(),
                    phy = phy_id,
                    error = %e,
                    "skipping attached device"
                );
                Ok(())
            }
        }
    }

    /// True if `address` is the expander itself or one of its ancestors.
    fn is_upstream(&self, expander: &Device, address: SasAddress) -> bool {
        if expander.sas_address() == address {
            return true;
        }
        let mut current = expander.parent();
        while let Some(handle) = current {
            let Some(device) = self.registry.get(handle) else {
                break;
            };
            if device.sas_address() == address {
                return true;
            }
            current = device.parent();
        }
        false
    }

    /// Allocate, list and announce one device attached below `parent`.
    async fn discover_child(
        self: &Arc<Self>,
        guard: &DomainGuard<'_>,
        port: &Port,
        parent: &Arc<Device>,
        phy_id: u8,
        attached: &AttachedDevice,
        depth: usize,
    ) -> Result<()> {
        if self.is_upstream(parent, attached.sas_address) {
            debug!(address = %attached.sas_address, "upstream link; not a child");
            return Ok(());
        }

        let frame = ReceivedFrame::capture(&attached.frame, self.config.max_frame_size);
        let classification = classify(&frame, attached.oob_mode)?;

        if classification.kind.is_expander() && depth + 1 >= self.config.max_expander_depth {
            warn!(
                address = %attached.sas_address,
                depth = depth + 1,
                "expander tree too deep; not descending"
            );
            return Ok(());
        }

        let child = self.registry.allocate(DeviceSpec {
            port: port.id(),
            sas_address: attached.sas_address,
            classification,
            linkrate: attached.linkrate,
            pathways: 1,
            phy_identifier: phy_id,
            parent: Some(parent.handle()),
            parent_address: Some(parent.sas_address()),
        })?;

        if let Err(e) = self.attach_collaborators(&child) {
            self.registry.release(&child);
            return Err(e);
        }

        if let Some(exp) = parent.expander() {
            exp.add_child(child.handle());
        }
        self.update_walk_state(port, parent, &child);

        self.events.publish(TopologyEvent::device_discovered(
            port.id(),
            child.sas_address(),
            child.kind(),
            Some(parent.sas_address()),
        ));
        debug!(
            parent = %parent.sas_address(),
            address = %child.sas_address(),
            kind = %child.kind(),
            phy = phy_id,
            "found attached device"
        );

        let result = if child.kind().is_expander() {
            port.push_expander(guard, child.handle());
            match self
                .register_expander(&child)
                .and_then(|_| self.notify_found(&child))
            {
                Ok(()) => self.walk_expander(guard, port, &child, depth + 1).await,
                Err(e) => Err(e),
            }
        } else {
            port.push_pending(guard, child.handle());
            self.notify_found(&child)
                .and_then(|_| self.notify_device_event(&child, DeviceEventKind::Add))
        };

        if let Err(e) = result {
            self.abandon(guard, port, &child);
            return Err(e);
        }
        Ok(())
    }

    fn update_walk_state(&self, port: &Port, parent: &Device, child: &Device) {
        port.update_walk(|w| match (parent.kind(), child.kind()) {
            (_, DeviceKind::FanoutExpander) => w.fanout_sas_address = Some(child.sas_address()),
            (DeviceKind::EdgeExpander, DeviceKind::EdgeExpander) if w.eeds_a.is_none() => {
                w.eeds_a = Some(parent.sas_address());
                w.eeds_b = Some(child.sas_address());
            }
            _ => {}
        });
    }

    // =========================================================================
    // Revalidation
    // =========================================================================

    /// Reconcile a port's domain with what the fabric now reports.
    ///
    /// Deferred while ATA link recovery is active; the pending bit then
    /// stays set so [`finish_ata_recovery`](Self::finish_ata_recovery) can
    /// re-queue the work.
    #[instrument(skip(self), fields(host = %self.name()))]
    pub(crate) async fn revalidate_domain(self: &Arc<Self>, port: PortId) -> Result<()> {
        let port = self.port(port)?;
        let guard = self.domain.lock().await;

        if self.ata_recovery_active() {
            info!(port = %port.id(), "revalidation deferred: ATA recovery active");
            self.metrics.record_deferred();
            self.events
                .publish(TopologyEvent::revalidation_deferred(port.id()));
            return Err(Error::Deferred { port: port.id() });
        }

        port.clear_pending(PendingEvents::REVALIDATE);

        let Some(root) = self.registry.find_root(&port) else {
            debug!(port = %port.id(), "no root device; nothing to revalidate");
            return Ok(());
        };
        if !root.kind().is_expander() || root.is_destroy_requested() {
            return Ok(());
        }

        self.revalidate_expander(&guard, &port, &root, 0).await
    }

    fn revalidate_expander<'a>(
        self: &'a Arc<Self>,
        guard: &'a DomainGuard<'a>,
        port: &'a Port,
        expander: &'a Arc<Device>,
        depth: usize,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let phys = self.report_phys(port.id(), expander).await?;
            let reported = attached_devices(&phys);
            let reported_addrs: HashSet<SasAddress> =
                reported.iter().map(|(_, att)| att.sas_address).collect();

            let children: Vec<Arc<Device>> = expander
                .expander()
                .map(|e| e.children())
                .unwrap_or_default()
                .into_iter()
                .filter_map(|h| self.registry.get(h))
                .collect();
            let known: HashSet<SasAddress> = children.iter().map(|c| c.sas_address()).collect();

            for child in &children {
                if child.is_destroy_requested() {
                    continue;
                }
                if !reported_addrs.contains(&child.sas_address()) {
                    info!(
                        expander = %expander.sas_address(),
                        address = %child.sas_address(),
                        "attached device vanished"
                    );
                    self.unregister_subtree(child);
                } else if child.kind().is_expander() {
                    match self.revalidate_expander(guard, port, child, depth + 1).await {
                        Ok(()) => {}
                        Err(e @ Error::Link { .. }) => return Err(e),
                        Err(e) => {
                            warn!(expander = %child.sas_address(), error = %e, "revalidation failed below expander")
                        }
                    }
                }
            }

            for (phy_id, attached) in reported {
                if known.contains(&attached.sas_address) {
                    continue;
                }
                let result = self
                    .discover_child(guard, port, expander, phy_id, attached, depth)
                    .await;
                self.skip_child_failure(expander, phy_id, result)?;
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{LinkRate, OobMode};
    use bytes::Bytes;

    fn phy(id: u8, addr: Option<u64>) -> ExpanderPhy {
        ExpanderPhy {
            phy_id: id,
            attached: addr.map(|a| AttachedDevice {
                sas_address: SasAddress::from_u64(a),
                oob_mode: OobMode::Sas,
                frame: Bytes::new(),
                linkrate: LinkRate::G6,
            }),
        }
    }

    #[test]
    fn test_attached_devices_dedupes_wide_links() {
        let phys = vec![
            phy(0, Some(0x10)),
            phy(1, Some(0x10)),
            phy(2, None),
            phy(3, Some(0)),
            phy(4, Some(0x20)),
        ];
        let attached = attached_devices(&phys);
        let ids: Vec<u8> = attached.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 4]);
    }
}
