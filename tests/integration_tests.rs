//! SAS Discovery Integration Tests
//!
//! End-to-end scenarios driven through the public host adapter API with the
//! recording collaborators and the simulated expander fabric:
//! - Discovery of directly attached devices
//! - Device lifecycle and reference counting
//! - Expander trees and revalidation
//! - Suspend, resume and link loss
//! - Event dispatch

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use sas_discovery::adapters::{Call, FailPoint, InMemoryEventSink, RecordingDriver, SimulatedFabric};
use sas_discovery::discovery::{
    d2h_signature_fis, identify_frame, Collaborators, Device, HostAdapter, LinkState,
    PendingEvents, Phase, Phy, Port,
};
use sas_discovery::domain::events::{DeviceEventKind, TopologyEvent};
use sas_discovery::domain::ports::{
    AttachedDevice, DeviceHandle, DeviceKind, LinkRate, OobMode, PortId, Protocol, SasAddress,
    SataPortId,
};
use sas_discovery::{DiscoveryConfig, Error};

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    host: Arc<HostAdapter>,
    driver: Arc<RecordingDriver>,
    fabric: Arc<SimulatedFabric>,
    sink: Arc<InMemoryEventSink>,
}

fn harness() -> Harness {
    harness_with(DiscoveryConfig::default())
}

fn harness_with(config: DiscoveryConfig) -> Harness {
    let driver = Arc::new(RecordingDriver::new());
    let fabric = Arc::new(SimulatedFabric::new());
    let sink = Arc::new(InMemoryEventSink::new());
    let host = HostAdapter::new(
        "hba0",
        config,
        Collaborators {
            driver: driver.clone(),
            reporting: driver.clone(),
            sata: driver.clone(),
            expander: fabric.clone(),
            events: sink.clone(),
        },
    )
    .unwrap();
    Harness {
        host,
        driver,
        fabric,
        sink,
    }
}

fn addr(a: u64) -> SasAddress {
    SasAddress::from_u64(0x5000_0000_0000_0000 | a)
}

fn sas(kind: DeviceKind, address: SasAddress) -> AttachedDevice {
    let (init, target) = if kind.is_expander() {
        (Protocol::SMP, Protocol::SMP)
    } else {
        (Protocol::empty(), Protocol::SSP)
    };
    AttachedDevice {
        sas_address: address,
        oob_mode: OobMode::Sas,
        frame: identify_frame(kind, init, target, address, 0),
        linkrate: LinkRate::G6,
    }
}

fn sata(address: SasAddress, port_multiplier: bool) -> AttachedDevice {
    AttachedDevice {
        sas_address: address,
        oob_mode: OobMode::Sata,
        frame: d2h_signature_fis(port_multiplier),
        linkrate: LinkRate::G3,
    }
}

/// Form port `id` with `phys` PHYs whose links all reached `attached`.
fn attach_port(h: &Harness, id: u32, attached: &AttachedDevice, phys: u8) -> Arc<Port> {
    let port = Port::new(
        PortId(id),
        LinkState {
            attached_sas_address: attached.sas_address,
            oob_mode: attached.oob_mode,
            linkrate: attached.linkrate,
        },
    );
    for phy in 0..phys {
        port.add_phy(Arc::new(Phy::with_frame(phy, attached.frame.clone())));
    }
    h.host.add_port(port)
}

fn find(h: &Harness, address: SasAddress) -> Option<Arc<Device>> {
    h.host
        .registry()
        .handles()
        .into_iter()
        .filter_map(|handle| h.host.registry().get(handle))
        .find(|d| d.sas_address() == address)
}

/// Root edge expander 0x100 with an end device on PHY 0 and a fanout
/// expander on PHY 1 that has a SATA drive on its PHY 0.
fn build_tree(h: &Harness) -> Arc<Port> {
    h.fabric.add_expander(addr(0x100), 4);
    h.fabric.add_expander(addr(0x200), 2);
    h.fabric
        .attach(addr(0x100), 0, sas(DeviceKind::EndDevice, addr(0x101)))
        .unwrap();
    h.fabric
        .attach(addr(0x100), 1, sas(DeviceKind::FanoutExpander, addr(0x200)))
        .unwrap();
    h.fabric.attach(addr(0x200), 0, sata(addr(0x201), false)).unwrap();
    attach_port(h, 0, &sas(DeviceKind::EdgeExpander, addr(0x100)), 4)
}

fn refcounts(h: &Harness) -> Vec<(DeviceHandle, usize)> {
    h.host
        .registry()
        .handles()
        .into_iter()
        .filter_map(|handle| h.host.registry().get(handle))
        .map(|d| (d.handle(), d.refcount()))
        .collect()
}

// =============================================================================
// Discovery of Directly Attached Devices
// =============================================================================

mod discovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_end_device_gets_single_add() {
        let h = harness();
        let address = addr(0x1);
        let port = attach_port(&h, 0, &sas(DeviceKind::EndDevice, address), 2);

        let handle = h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        assert_eq!(h.driver.count(&Call::DevFound(address)), 1);
        let found = h.driver.position(&Call::DevFound(address)).unwrap();
        let registered = h.driver.position(&Call::Register(address)).unwrap();
        assert!(found < registered);

        let queued = h.sink.events_of_type("DeviceEventQueued");
        assert_eq!(queued.len(), 1);
        assert_matches!(
            &queued[0],
            TopologyEvent::DeviceEventQueued {
                event: DeviceEventKind::Add,
                ..
            }
        );

        let lists = port.lists();
        assert_eq!(lists.devices, vec![handle]);
        assert!(lists.disco.is_empty());
        assert!(lists.expanders.is_empty());

        let device = h.host.registry().get(handle).unwrap();
        assert_eq!(device.phase(), Phase::Registered);
        assert_eq!(device.kind(), DeviceKind::EndDevice);
        assert_eq!(device.info().pathways, 2);
        // list membership + found
        assert_eq!(device.refcount(), 2);
        assert!(device.pinned_phy().is_some());
        assert_eq!(port.root(), Some(handle));
        assert!(port.phys().iter().all(|p| p.target() == Some(handle)));
        assert!(h.driver.is_registered(address));
        assert_eq!(h.host.metrics().device_events(DeviceEventKind::Add), 1);
    }

    #[tokio::test]
    async fn test_port_multiplier_signature() {
        let h = harness();
        let address = addr(0x2);
        attach_port(&h, 0, &sata(address, true), 1);

        let handle = h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        let device = h.host.registry().get(handle).unwrap();
        assert_eq!(device.kind(), DeviceKind::SataPortMultiplier);
        assert!(device.sata().and_then(|s| s.bridge()).is_some());
        assert_eq!(h.driver.count(&Call::SataInit(address)), 1);
        assert_eq!(h.driver.count(&Call::SataProbe(address)), 1);
        assert!(h.driver.is_registered(address));
    }

    #[tokio::test]
    async fn test_plain_sata_device() {
        let h = harness();
        attach_port(&h, 0, &sata(addr(0x3), false), 1);

        let handle = h.host.discover_domain(PortId(0)).await.unwrap();
        let device = h.host.registry().get(handle).unwrap();
        assert_eq!(device.kind(), DeviceKind::SataDevice);
    }

    #[tokio::test]
    async fn test_unknown_device_type_leaves_nothing() {
        let h = harness();
        let mut frame = vec![0u8; 28];
        frame[0] = 4 << 4;
        let attached = AttachedDevice {
            sas_address: addr(0x4),
            oob_mode: OobMode::Sas,
            frame: Bytes::from(frame),
            linkrate: LinkRate::G6,
        };
        let port = attach_port(&h, 0, &attached, 1);

        let err = h.host.discover_domain(PortId(0)).await.unwrap_err();
        assert_matches!(err, Error::UnknownDeviceType(4));

        assert!(h.host.registry().is_empty());
        assert_eq!(port.root(), None);
        assert!(port.is_clear());
        assert!(h.driver.calls().is_empty());
        assert_eq!(h.sink.count_by_type("DiscoveryFailed"), 1);
    }

    #[tokio::test]
    async fn test_port_without_phys() {
        let h = harness();
        h.host.add_port(Port::new(
            PortId(7),
            LinkState {
                attached_sas_address: SasAddress::ZERO,
                oob_mode: OobMode::Sas,
                linkrate: LinkRate::Unknown,
            },
        ));

        let err = h.host.discover_domain(PortId(7)).await.unwrap_err();
        assert_matches!(err, Error::NoDevice { port: PortId(7) });

        let err = h.host.discover_domain(PortId(8)).await.unwrap_err();
        assert_matches!(err, Error::UnknownPort(PortId(8)));
    }

    #[tokio::test]
    async fn test_reporting_allocation_failure() {
        let h = harness();
        let address = addr(0x5);
        h.driver.fail(FailPoint::Allocate, address);
        let port = attach_port(&h, 0, &sas(DeviceKind::EndDevice, address), 1);

        let err = h.host.discover_domain(PortId(0)).await.unwrap_err();
        assert_matches!(err, Error::OutOfMemory(_));
        assert!(h.host.registry().is_empty());
        assert_eq!(port.root(), None);
        assert_eq!(h.host.metrics().devices_live(), 0);
    }

    #[tokio::test]
    async fn test_driver_rejection_unwinds_discovery() {
        let h = harness();
        let address = addr(0x6);
        h.driver.fail(FailPoint::DevFound, address);
        let port = attach_port(&h, 0, &sas(DeviceKind::EndDevice, address), 2);

        let err = h.host.discover_domain(PortId(0)).await.unwrap_err();
        assert_matches!(err, Error::ProbeFailed { .. });
        h.host.flush().await;

        assert!(h.host.registry().is_empty());
        assert_eq!(port.root(), None);
        assert!(port.is_clear());
        assert!(port.phys().iter().all(|p| p.target().is_none()));
        assert_eq!(h.driver.count(&Call::DevGone(address)), 0);
        assert_eq!(h.driver.count(&Call::Discard(address)), 1);
        assert_eq!(h.driver.live_objects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_wait_timeout_leaves_port_untouched() {
        let h = harness_with(DiscoveryConfig {
            drain_timeout: Duration::from_secs(1),
            ..Default::default()
        });
        let port = attach_port(&h, 0, &sas(DeviceKind::EndDevice, addr(0x7)), 1);

        let handle = h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;
        let before = port.lists();

        let err = h.host.discover_domain(PortId(0)).await.unwrap_err();
        assert_matches!(err, Error::Timeout { port: PortId(0), .. });

        assert_eq!(port.lists(), before);
        assert_eq!(port.root(), Some(handle));
        assert_eq!(h.host.registry().len(), 1);
        assert_eq!(h.sink.count_by_type("DiscoveryFailed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscovery_waits_for_previous_occupant() {
        let h = harness();
        let address = addr(0x8);
        let port = attach_port(&h, 0, &sas(DeviceKind::EndDevice, address), 1);

        let old = h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        h.host.unregister_domain_devices(PortId(0), true).await.unwrap();
        let new = h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        assert_ne!(old, new);
        assert!(h.host.registry().get(old).is_none());
        assert_eq!(h.driver.count(&Call::DevFound(address)), 2);
        assert_eq!(h.driver.count(&Call::DevGone(address)), 1);
        assert_eq!(port.lists().devices, vec![new]);
        assert_eq!(port.root(), Some(new));
    }
}

// =============================================================================
// Device Lifecycle and Reference Counting
// =============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_double_unregister_queues_one_delete() {
        let h = harness();
        let address = addr(0x10);
        let port = attach_port(&h, 0, &sas(DeviceKind::EndDevice, address), 1);
        let handle = h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        assert!(h.host.unregister_device(handle).unwrap());
        assert!(!h.host.unregister_device(handle).unwrap());
        h.host.flush().await;

        assert_eq!(h.host.metrics().device_events(DeviceEventKind::Delete), 1);
        assert_eq!(h.driver.count(&Call::BeforeDevGone(address)), 1);
        assert_eq!(h.driver.count(&Call::Withdraw(address)), 1);
        assert_eq!(h.driver.count(&Call::DevGone(address)), 1);
        assert!(h.host.registry().get(handle).is_none());
        assert!(port.is_clear());
        assert_eq!(port.root(), None);
        assert_eq!(h.driver.live_objects(), 0);
        assert_matches!(
            h.host.unregister_device(handle),
            Err(Error::StaleHandle(_))
        );
    }

    #[tokio::test]
    async fn test_registration_failure_releases_device() {
        let h = harness();
        let address = addr(0x11);
        h.driver.fail(FailPoint::Register, address);
        let port = attach_port(&h, 0, &sas(DeviceKind::EndDevice, address), 1);

        h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        assert_eq!(h.sink.count_by_type("DeviceRegistered"), 0);
        assert_eq!(h.sink.count_by_type("DeviceRegistrationFailed"), 1);
        assert_eq!(h.sink.count_by_type("DeviceReleased"), 1);
        assert!(!h.driver.is_registered(address));
        assert_eq!(h.driver.count(&Call::Withdraw(address)), 0);
        assert_eq!(h.driver.count(&Call::Discard(address)), 1);
        assert_eq!(h.driver.count(&Call::DevGone(address)), 1);
        assert!(h.host.registry().is_empty());
        assert!(port.is_clear());
        assert_eq!(h.driver.live_objects(), 0);
        assert_eq!(h.host.metrics().devices_live(), 0);
    }

    #[tokio::test]
    async fn test_sata_probe_failure_destroys_bridge() {
        let h = harness();
        let address = addr(0x12);
        h.driver.fail(FailPoint::SataProbe, address);
        attach_port(&h, 0, &sata(address, false), 1);

        h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        assert_eq!(h.driver.count(&Call::Register(address)), 0);
        assert!(h.host.registry().is_empty());
        assert!(h.driver.bridge_destroyed(SataPortId(1)));
    }

    #[tokio::test]
    async fn test_destroy_requested_before_add_skips_registration() {
        let h = harness();
        let address = addr(0x13);
        let port = attach_port(&h, 0, &sas(DeviceKind::EndDevice, address), 1);

        let handle = h.host.discover_domain(PortId(0)).await.unwrap();
        assert!(h.host.unregister_device(handle).unwrap());
        h.host.flush().await;

        assert_eq!(h.driver.count(&Call::Register(address)), 0);
        assert_eq!(h.driver.count(&Call::Discard(address)), 1);
        assert!(h.host.registry().is_empty());
        assert!(port.is_clear());
    }

    #[tokio::test]
    async fn test_parent_port_teardown() {
        let h = harness();
        h.driver.set_parent_port_phys(0);
        let address = addr(0x14);
        attach_port(&h, 0, &sas(DeviceKind::EndDevice, address), 1);

        let handle = h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;
        h.host.unregister_device(handle).unwrap();
        h.host.flush().await;

        assert_eq!(h.driver.count(&Call::DeleteParentPort(address)), 1);
    }

    #[tokio::test]
    async fn test_link_loss_marks_gone_and_clears_recovery() {
        let h = harness();
        let port = attach_port(&h, 0, &sas(DeviceKind::EndDevice, addr(0x15)), 1);
        let handle = h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;
        let device = h.host.registry().get(handle).unwrap();

        assert!(h.host.queue_ssp_recovery(handle).unwrap());
        assert!(!h.host.queue_ssp_recovery(handle).unwrap());
        assert_eq!(h.host.ssp_recovery_active(), 1);

        let requested = h
            .host
            .unregister_domain_devices(PortId(0), true)
            .await
            .unwrap();
        assert_eq!(requested, 1);
        assert!(device.is_gone());
        assert!(device.is_destroy_requested());

        h.host.flush().await;
        assert_eq!(h.host.ssp_recovery_active(), 0);
        assert!(h.host.ssp_recovery_queue().is_empty());
        assert!(h.host.registry().is_empty());
        assert!(port.is_clear());
        assert_eq!(device.phase(), Phase::Unregistered);
    }
}

// =============================================================================
// Expander Trees and Revalidation
// =============================================================================

mod expander_tests {
    use super::*;

    #[tokio::test]
    async fn test_expander_tree_discovery() {
        let h = harness();
        let port = build_tree(&h);

        let root = h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        assert_eq!(h.host.registry().len(), 4);
        assert_eq!(h.driver.registered_count(), 4);

        let lists = port.lists();
        assert_eq!(lists.expanders.len(), 2);
        assert_eq!(lists.devices.len(), 2);
        assert!(lists.disco.is_empty());

        let root = h.host.registry().get(root).unwrap();
        assert_eq!(root.kind(), DeviceKind::EdgeExpander);
        assert_eq!(root.expander().unwrap().children().len(), 2);
        // list membership + found + two children
        assert_eq!(root.refcount(), 4);

        let drive = find(&h, addr(0x201)).unwrap();
        assert_eq!(drive.kind(), DeviceKind::SataDevice);
        assert_eq!(drive.info().parent, Some(addr(0x200)));

        let walk = port.walk_state();
        assert_eq!(walk.fanout_sas_address, Some(addr(0x200)));
        assert_eq!(walk.max_level, 2);
    }

    #[tokio::test]
    async fn test_wide_link_yields_one_child() {
        let h = harness();
        h.fabric.add_expander(addr(0x100), 4);
        for phy in 0..2 {
            h.fabric
                .attach(addr(0x100), phy, sas(DeviceKind::EndDevice, addr(0x101)))
                .unwrap();
        }
        attach_port(&h, 0, &sas(DeviceKind::EdgeExpander, addr(0x100)), 1);

        h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        assert_eq!(h.host.registry().len(), 2);
        assert_eq!(h.driver.count(&Call::DevFound(addr(0x101))), 1);
    }

    #[tokio::test]
    async fn test_unchanged_revalidation_is_quiet() {
        let h = harness();
        build_tree(&h);
        h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        let before = refcounts(&h);
        let queued = h.sink.count_by_type("DeviceEventQueued");
        let found = h.driver.count(&Call::DevFound(addr(0x101)));

        assert!(h.host.queue_revalidation(PortId(0)).unwrap());
        h.host.flush().await;

        assert_eq!(refcounts(&h), before);
        assert_eq!(h.sink.count_by_type("DeviceEventQueued"), queued);
        assert_eq!(h.driver.count(&Call::DevFound(addr(0x101))), found);
        assert_eq!(h.host.metrics().device_events(DeviceEventKind::Delete), 0);
    }

    #[tokio::test]
    async fn test_vanished_subtree_removed_leaves_first() {
        let h = harness();
        let port = build_tree(&h);
        let root = h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        h.fabric.detach(addr(0x100), 1);
        h.host.queue_revalidation(PortId(0)).unwrap();
        h.host.flush().await;

        let drive = h.driver.position(&Call::Withdraw(addr(0x201))).unwrap();
        let fanout = h.driver.position(&Call::Withdraw(addr(0x200))).unwrap();
        assert!(drive < fanout);
        assert_eq!(h.driver.count(&Call::DetachExpanderPort(addr(0x200))), 1);

        assert_eq!(h.host.registry().len(), 2);
        assert!(find(&h, addr(0x200)).is_none());
        assert!(find(&h, addr(0x201)).is_none());

        let root = h.host.registry().get(root).unwrap();
        assert_eq!(root.expander().unwrap().children().len(), 1);
        assert_eq!(root.refcount(), 3);
        assert_eq!(port.lists().expanders.len(), 1);
        assert_eq!(port.lists().devices.len(), 1);
    }

    #[tokio::test]
    async fn test_new_device_found_on_revalidation() {
        let h = harness();
        build_tree(&h);
        h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        h.fabric
            .attach(addr(0x100), 3, sas(DeviceKind::EndDevice, addr(0x102)))
            .unwrap();
        h.host.queue_revalidation(PortId(0)).unwrap();
        h.host.flush().await;

        assert_eq!(h.host.registry().len(), 5);
        assert!(h.driver.is_registered(addr(0x102)));
        assert_eq!(h.driver.count(&Call::DevFound(addr(0x101))), 1);
    }

    #[tokio::test]
    async fn test_nested_link_error_aborts_discovery() {
        let h = harness();
        h.fabric.add_expander(addr(0x100), 2);
        h.fabric.add_expander(addr(0x200), 1);
        h.fabric
            .attach(addr(0x100), 0, sas(DeviceKind::FanoutExpander, addr(0x200)))
            .unwrap();
        h.fabric
            .attach(addr(0x100), 1, sas(DeviceKind::EndDevice, addr(0x101)))
            .unwrap();
        h.fabric.fail_reports(addr(0x200));
        let port = attach_port(&h, 0, &sas(DeviceKind::EdgeExpander, addr(0x100)), 1);

        let err = h.host.discover_domain(PortId(0)).await.unwrap_err();
        assert_matches!(err, Error::Link { port: PortId(0), .. });
        h.host.flush().await;

        // the walk stopped at the failing expander
        assert_eq!(h.driver.count(&Call::DevFound(addr(0x101))), 0);
        assert!(h.host.registry().is_empty());
        assert_eq!(port.root(), None);
        assert!(port.is_clear());
        assert_eq!(h.driver.live_objects(), 0);
        assert_eq!(h.host.metrics().devices_live(), 0);
    }

    #[tokio::test]
    async fn test_link_error_unwinds_children_already_found() {
        let h = harness();
        h.fabric.add_expander(addr(0x100), 2);
        h.fabric.add_expander(addr(0x200), 1);
        h.fabric
            .attach(addr(0x100), 0, sas(DeviceKind::EndDevice, addr(0x101)))
            .unwrap();
        h.fabric
            .attach(addr(0x100), 1, sas(DeviceKind::FanoutExpander, addr(0x200)))
            .unwrap();
        h.fabric.fail_reports(addr(0x200));
        let port = attach_port(&h, 0, &sas(DeviceKind::EdgeExpander, addr(0x100)), 1);

        let err = h.host.discover_domain(PortId(0)).await.unwrap_err();
        assert_matches!(err, Error::Link { .. });
        h.host.flush().await;

        assert_eq!(h.driver.count(&Call::DevFound(addr(0x101))), 1);
        assert_eq!(h.driver.count(&Call::Register(addr(0x101))), 0);
        assert_eq!(h.driver.count(&Call::DevGone(addr(0x101))), 1);
        assert!(h.host.registry().is_empty());
        assert!(port.is_clear());
        assert_eq!(h.driver.registered_count(), 0);
        assert_eq!(h.driver.live_objects(), 0);
    }

    #[tokio::test]
    async fn test_link_error_during_revalidation_keeps_domain() {
        let h = harness();
        build_tree(&h);
        h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        h.fabric.fail_reports(addr(0x200));
        h.fabric
            .attach(addr(0x100), 3, sas(DeviceKind::EndDevice, addr(0x102)))
            .unwrap();
        h.host.queue_revalidation(PortId(0)).unwrap();
        h.host.flush().await;

        // nothing was added after the failed report, nothing was removed
        assert!(find(&h, addr(0x102)).is_none());
        assert_eq!(h.host.registry().len(), 4);
        assert_eq!(h.host.metrics().device_events(DeviceEventKind::Delete), 0);
    }

    #[tokio::test]
    async fn test_deferred_revalidation_runs_after_recovery() {
        let h = harness();
        let port = build_tree(&h);
        h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        h.fabric.detach(addr(0x100), 0);
        h.host.begin_ata_recovery();
        assert!(h.host.queue_revalidation(PortId(0)).unwrap());
        assert!(!h.host.queue_revalidation(PortId(0)).unwrap());
        h.host.flush().await;

        assert_eq!(h.sink.count_by_type("RevalidationDeferred"), 1);
        assert!(port.pending().contains(PendingEvents::REVALIDATE));
        assert!(h.driver.is_registered(addr(0x101)));

        assert_eq!(h.host.finish_ata_recovery().unwrap(), 1);
        h.host.flush().await;

        assert!(!port.pending().contains(PendingEvents::REVALIDATE));
        assert!(!h.driver.is_registered(addr(0x101)));
        assert!(find(&h, addr(0x101)).is_none());
    }

    #[tokio::test]
    async fn test_teardown_of_whole_tree() {
        let h = harness();
        let port = build_tree(&h);
        h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;

        let requested = h
            .host
            .unregister_domain_devices(PortId(0), false)
            .await
            .unwrap();
        assert_eq!(requested, 4);
        h.host.flush().await;

        assert!(h.host.registry().is_empty());
        assert!(port.is_clear());
        assert_eq!(port.root(), None);
        assert_eq!(h.driver.live_objects(), 0);
        assert_eq!(h.driver.registered_count(), 0);
        assert_eq!(h.host.metrics().devices_live(), 0);
    }

    #[tokio::test]
    async fn test_failed_root_report_unwinds() {
        let h = harness();
        let port = build_tree(&h);
        h.fabric.fail_reports(addr(0x100));

        let err = h.host.discover_domain(PortId(0)).await.unwrap_err();
        assert_matches!(err, Error::Link { .. });
        h.host.flush().await;

        assert!(h.host.registry().is_empty());
        assert_eq!(port.root(), None);
        assert_eq!(h.driver.count(&Call::Withdraw(addr(0x100))), 1);
        assert_eq!(h.driver.count(&Call::DevGone(addr(0x100))), 1);
        assert_eq!(h.driver.live_objects(), 0);
    }
}

// =============================================================================
// Suspend and Resume
// =============================================================================

mod power_tests {
    use super::*;

    #[tokio::test]
    async fn test_suspend_resume_keeps_membership() {
        let h = harness();
        let address = addr(0x30);
        let port = attach_port(&h, 0, &sata(address, false), 2);
        let handle = h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;
        let before = port.lists();
        let device = h.host.registry().get(handle).unwrap();
        let ap = device.sata().and_then(|s| s.bridge()).unwrap();

        assert!(h.host.queue_suspend(PortId(0)).unwrap());
        h.host.flush().await;

        assert!(h.driver.bridge_suspended(ap));
        assert_eq!(h.driver.count(&Call::DevGone(address)), 1);
        assert_eq!(h.driver.count(&Call::PortDeformed(PortId(0), 0)), 1);
        assert_eq!(h.driver.count(&Call::PortDeformed(PortId(0), 1)), 1);
        assert!(port.is_suspended());
        assert!(port.phys().iter().all(|p| p.is_suspended()));
        assert!(!device.is_found());
        assert_eq!(device.refcount(), 1);
        assert_eq!(port.lists(), before);

        assert!(h.host.queue_resume(PortId(0)).unwrap());
        h.host.flush().await;

        assert!(!h.driver.bridge_suspended(ap));
        assert_eq!(port.lists(), before);
        assert_eq!(h.sink.count_by_type("PortResumed"), 1);

        h.host.unregister_domain_devices(PortId(0), true).await.unwrap();
        h.host.flush().await;
        assert_eq!(h.driver.count(&Call::DevGone(address)), 1);
        assert!(h.host.registry().is_empty());
    }
}

// =============================================================================
// Event Dispatch
// =============================================================================

mod dispatch_tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_discovery_across_ports() {
        let h = harness();
        attach_port(&h, 0, &sas(DeviceKind::EndDevice, addr(0x40)), 1);
        attach_port(&h, 1, &sata(addr(0x41), false), 1);

        assert!(h.host.queue_discovery(PortId(0)).unwrap());
        assert!(h.host.queue_discovery(PortId(1)).unwrap());
        h.host.flush().await;

        assert_eq!(h.host.registry().len(), 2);
        assert_eq!(h.driver.registered_count(), 2);

        let topology = h.host.topology();
        assert_eq!(topology.len(), 2);
        assert!(topology.iter().all(|p| p.devices.len() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relink_on_more_ports_than_event_slots() {
        let h = harness_with(DiscoveryConfig {
            max_concurrent_events: 2,
            ..Default::default()
        });
        let ports: Vec<Arc<Port>> = (0..3u32)
            .map(|id| {
                let attached = sas(DeviceKind::EndDevice, addr(0x50 + u64::from(id)));
                attach_port(&h, id, &attached, 1)
            })
            .collect();
        for port in &ports {
            h.host.queue_discovery(port.id()).unwrap();
        }
        h.host.flush().await;
        let before: Vec<DeviceHandle> = ports.iter().map(|p| p.root().unwrap()).collect();

        // Rediscovery is requested while the old occupants are still listed,
        // so every discovery starts by waiting for its port to drain.
        let started = tokio::time::Instant::now();
        for port in &ports {
            assert!(h.host.queue_discovery(port.id()).unwrap());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        for port in &ports {
            h.host.unregister_domain_devices(port.id(), true).await.unwrap();
        }
        h.host.flush().await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(h.sink.count_by_type("DiscoveryFailed"), 0);
        assert_eq!(h.host.registry().len(), 3);
        assert_eq!(h.driver.registered_count(), 3);
        for (port, old) in ports.iter().zip(before) {
            let new = port.root().unwrap();
            assert_ne!(new, old);
            assert_eq!(port.lists().devices, vec![new]);
        }
    }

    #[tokio::test]
    async fn test_unregister_refused_at_shutdown_stays_retryable() {
        let h = harness();
        attach_port(&h, 0, &sas(DeviceKind::EndDevice, addr(0x43)), 1);
        let handle = h.host.discover_domain(PortId(0)).await.unwrap();
        h.host.flush().await;
        let device = h.host.registry().get(handle).unwrap();
        let refs = device.refcount();

        h.host.shutdown().await;
        assert_matches!(h.host.unregister_device(handle), Err(Error::ShuttingDown));
        assert!(!device.is_destroy_requested());
        assert_eq!(device.refcount(), refs);

        // a second request is refused the same way instead of being coalesced
        assert_matches!(h.host.unregister_device(handle), Err(Error::ShuttingDown));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let h = harness();
        attach_port(&h, 0, &sas(DeviceKind::EndDevice, addr(0x42)), 1);
        let port = h.host.port(PortId(0)).unwrap();
        h.host.queue_discovery(PortId(0)).unwrap();
        h.host.flush().await;

        h.host.shutdown().await;
        assert_eq!(h.host.registry().len(), 1);
        assert_matches!(
            h.host.queue_revalidation(PortId(0)),
            Err(Error::ShuttingDown)
        );
        assert!(!port.pending().contains(PendingEvents::REVALIDATE));
    }
}
