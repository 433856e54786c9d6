//! Device objects
//!
//! A [`Device`] is one fabric-attached entity. Its kind never changes after
//! classification; its lifetime is governed by an explicit reference count
//! managed through the [`DeviceRegistry`](super::registry::DeviceRegistry).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use super::frame::Classification;
use super::port::Phy;
use crate::domain::ports::{
    DeviceHandle, DeviceInfo, DeviceKind, ExpanderPhy, HashedAddress, LinkRate, PortId, Protocol,
    ReportingId, SasAddress, SataPortId,
};

// =============================================================================
// Lifecycle Phase
// =============================================================================

/// Where a device stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Classified and allocated, waiting for its Add event
    Discovered,
    /// Visible to the consumer layer
    Registered,
    /// Rejected by the ATA probe or the consumer layer; never registered
    ProbeFailed,
    /// Removed from every list; only outstanding references keep it alive
    Unregistered,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Discovered => write!(f, "Discovered"),
            Phase::Registered => write!(f, "Registered"),
            Phase::ProbeFailed => write!(f, "ProbeFailed"),
            Phase::Unregistered => write!(f, "Unregistered"),
        }
    }
}

// =============================================================================
// Kind-Specific State
// =============================================================================

/// End-device state: linkage into the host's SSP recovery list.
#[derive(Debug, Default)]
pub struct EndDeviceState {
    in_recovery: AtomicBool,
}

/// Expander state: owned children and the SMP command mutex.
#[derive(Debug, Default)]
pub struct ExpanderState {
    children: Mutex<Vec<DeviceHandle>>,
    phys: Mutex<Vec<ExpanderPhy>>,
    /// Serializes SMP interrogation of this expander
    pub(crate) cmd: tokio::sync::Mutex<()>,
}

impl ExpanderState {
    pub fn children(&self) -> Vec<DeviceHandle> {
        self.children.lock().clone()
    }

    pub fn phy_count(&self) -> usize {
        self.phys.lock().len()
    }

    pub(crate) fn add_child(&self, child: DeviceHandle) {
        self.children.lock().push(child);
    }

    pub(crate) fn remove_child(&self, child: DeviceHandle) -> bool {
        let mut children = self.children.lock();
        match children.iter().position(|c| *c == child) {
            Some(pos) => {
                children.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn record_phys(&self, phys: &[ExpanderPhy]) {
        *self.phys.lock() = phys.to_vec();
    }

    fn clear(&self) -> usize {
        self.phys.lock().clear();
        let mut children = self.children.lock();
        let orphans = children.len();
        children.clear();
        orphans
    }
}

/// SATA state: the ATA port bridging the device.
#[derive(Debug, Default)]
pub struct SataState {
    bridge: Mutex<Option<SataPortId>>,
}

impl SataState {
    pub fn bridge(&self) -> Option<SataPortId> {
        *self.bridge.lock()
    }
}

#[derive(Debug)]
pub(crate) enum SubState {
    End(EndDeviceState),
    Expander(ExpanderState),
    Sata(SataState),
}

impl SubState {
    fn for_kind(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::EndDevice => SubState::End(EndDeviceState::default()),
            DeviceKind::EdgeExpander | DeviceKind::FanoutExpander => {
                SubState::Expander(ExpanderState::default())
            }
            DeviceKind::SataDevice | DeviceKind::SataPortMultiplier => {
                SubState::Sata(SataState::default())
            }
        }
    }
}

// =============================================================================
// Device
// =============================================================================

/// Parameters for allocating a device.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub port: PortId,
    pub sas_address: SasAddress,
    pub classification: Classification,
    pub linkrate: LinkRate,
    pub pathways: usize,
    pub phy_identifier: u8,
    pub parent: Option<DeviceHandle>,
    pub parent_address: Option<SasAddress>,
}

/// One fabric-attached entity.
#[derive(Debug)]
pub struct Device {
    handle: DeviceHandle,
    port: PortId,
    kind: DeviceKind,
    sas_address: SasAddress,
    hashed_address: HashedAddress,
    initiator_protocols: Protocol,
    target_protocols: Protocol,
    linkrate: LinkRate,
    min_linkrate: LinkRate,
    max_linkrate: LinkRate,
    pathways: usize,
    phy_identifier: u8,
    /// Counted back-reference; released by the destructor
    parent: Option<DeviceHandle>,
    parent_address: Option<SasAddress>,

    pub(crate) refcount: AtomicUsize,
    destroy_requested: AtomicBool,
    found: AtomicBool,
    gone: AtomicBool,
    phase: Mutex<Phase>,

    reporting: Mutex<Option<ReportingId>>,
    phy: Mutex<Option<Arc<Phy>>>,
    pub(crate) sub: SubState,
}

impl Device {
    pub(crate) fn new(handle: DeviceHandle, spec: DeviceSpec) -> Self {
        let kind = spec.classification.kind;
        Self {
            handle,
            port: spec.port,
            kind,
            sas_address: spec.sas_address,
            hashed_address: spec.sas_address.hashed(),
            initiator_protocols: spec.classification.initiator_protocols,
            target_protocols: spec.classification.target_protocols,
            linkrate: spec.linkrate,
            min_linkrate: spec.linkrate,
            max_linkrate: spec.linkrate,
            pathways: spec.pathways,
            phy_identifier: spec.phy_identifier,
            parent: spec.parent,
            parent_address: spec.parent_address,
            refcount: AtomicUsize::new(1),
            destroy_requested: AtomicBool::new(false),
            found: AtomicBool::new(false),
            gone: AtomicBool::new(false),
            phase: Mutex::new(Phase::Discovered),
            reporting: Mutex::new(None),
            phy: Mutex::new(None),
            sub: SubState::for_kind(kind),
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn sas_address(&self) -> SasAddress {
        self.sas_address
    }

    pub fn hashed_address(&self) -> HashedAddress {
        self.hashed_address
    }

    pub fn linkrate(&self) -> LinkRate {
        self.linkrate
    }

    pub fn linkrate_range(&self) -> (LinkRate, LinkRate) {
        (self.min_linkrate, self.max_linkrate)
    }

    pub fn parent(&self) -> Option<DeviceHandle> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    /// Clear a probe failure, returning whether one was recorded.
    pub(crate) fn take_probe_failed(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase == Phase::ProbeFailed {
            *phase = Phase::Unregistered;
            true
        } else {
            false
        }
    }

    /// Atomically request destruction; true only for the first request.
    pub(crate) fn request_destroy(&self) -> bool {
        !self.destroy_requested.swap(true, Ordering::AcqRel)
    }

    /// Withdraw a destroy request whose Delete could not be queued.
    pub(crate) fn cancel_destroy(&self) {
        self.destroy_requested.store(false, Ordering::Release);
    }

    pub fn is_destroy_requested(&self) -> bool {
        self.destroy_requested.load(Ordering::Acquire)
    }

    pub(crate) fn set_found(&self) {
        self.found.store(true, Ordering::Release);
    }

    pub(crate) fn take_found(&self) -> bool {
        self.found.swap(false, Ordering::AcqRel)
    }

    pub fn is_found(&self) -> bool {
        self.found.load(Ordering::Acquire)
    }

    pub(crate) fn mark_gone(&self) {
        self.gone.store(true, Ordering::Release);
    }

    /// The link to this device was lost, not merely rescanned.
    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    pub fn reporting(&self) -> Option<ReportingId> {
        *self.reporting.lock()
    }

    pub(crate) fn set_reporting(&self, id: ReportingId) {
        *self.reporting.lock() = Some(id);
    }

    pub(crate) fn take_reporting(&self) -> Option<ReportingId> {
        self.reporting.lock().take()
    }

    /// Pin the PHY this device was last seen through.
    pub(crate) fn pin_phy(&self, phy: Arc<Phy>) {
        *self.phy.lock() = Some(phy);
    }

    pub(crate) fn unpin_phy(&self) -> Option<Arc<Phy>> {
        self.phy.lock().take()
    }

    pub fn pinned_phy(&self) -> Option<Arc<Phy>> {
        self.phy.lock().clone()
    }

    pub fn expander(&self) -> Option<&ExpanderState> {
        match &self.sub {
            SubState::Expander(state) => Some(state),
            _ => None,
        }
    }

    pub fn sata(&self) -> Option<&SataState> {
        match &self.sub {
            SubState::Sata(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn set_sata_bridge(&self, ap: SataPortId) {
        if let SubState::Sata(state) = &self.sub {
            *state.bridge.lock() = Some(ap);
        }
    }

    pub(crate) fn take_sata_bridge(&self) -> Option<SataPortId> {
        match &self.sub {
            SubState::Sata(state) => state.bridge.lock().take(),
            _ => None,
        }
    }

    /// Link into the SSP recovery list; false if already linked or not an end device.
    pub(crate) fn enter_recovery(&self) -> bool {
        match &self.sub {
            SubState::End(state) => !state.in_recovery.swap(true, Ordering::AcqRel),
            _ => false,
        }
    }

    pub(crate) fn leave_recovery(&self) -> bool {
        match &self.sub {
            SubState::End(state) => state.in_recovery.swap(false, Ordering::AcqRel),
            _ => false,
        }
    }

    /// Free kind-specific state; returns the number of children still linked.
    pub(crate) fn clear_sub_state(&self) -> usize {
        match &self.sub {
            SubState::Expander(state) => state.clear(),
            _ => 0,
        }
    }

    /// Snapshot handed to collaborators.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            handle: self.handle,
            port: self.port,
            sas_address: self.sas_address,
            kind: self.kind,
            initiator_protocols: self.initiator_protocols,
            target_protocols: self.target_protocols,
            linkrate: self.linkrate,
            parent: self.parent_address,
            phy_identifier: self.phy_identifier,
            pathways: self.pathways,
        }
    }

    /// Serializable view of the device.
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            handle: self.handle.0,
            port: self.port.0,
            sas_address: self.sas_address.to_string(),
            hashed_address: self.hashed_address.to_string(),
            kind: self.kind,
            phase: self.phase(),
            linkrate: self.linkrate,
            refcount: self.refcount(),
            parent: self.parent_address.map(|p| p.to_string()),
            children: self
                .expander()
                .map(|e| e.children().len())
                .unwrap_or_default(),
            found: self.is_found(),
        }
    }
}

/// Serializable view of a device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub handle: u64,
    pub port: u32,
    pub sas_address: String,
    pub hashed_address: String,
    pub kind: DeviceKind,
    pub phase: Phase,
    pub linkrate: LinkRate,
    pub refcount: usize,
    pub parent: Option<String>,
    pub children: usize,
    pub found: bool,
}

// =============================================================================
// Tests
// =============================================================================
