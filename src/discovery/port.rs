//! Ports and PHYs
//!
//! A [`Port`] groups the PHYs that formed a wide link to the same remote
//! device and tracks the devices discovered through it. The three device
//! lists and the root slot may only be mutated while holding the host's
//! domain lock; the `&DomainGuard` parameter on every mutator enforces it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::Mutex;

use super::frame::ReceivedFrame;
use super::host::DomainGuard;
use crate::domain::ports::{DeviceHandle, LinkRate, OobMode, PortId, SasAddress};

// =============================================================================
// PHY
// =============================================================================

/// One physical link endpoint of the host adapter.
#[derive(Debug)]
pub struct Phy {
    id: u8,
    frame: Mutex<Bytes>,
    suspended: AtomicBool,
    target: Mutex<Option<DeviceHandle>>,
}

impl Phy {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            frame: Mutex::new(Bytes::new()),
            suspended: AtomicBool::new(false),
            target: Mutex::new(None),
        }
    }

    /// A PHY whose link came up delivering `frame`.
    pub fn with_frame(id: u8, frame: Bytes) -> Self {
        let phy = Self::new(id);
        phy.set_received_frame(frame);
        phy
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Store the identification payload received when the link came up.
    pub fn set_received_frame(&self, frame: Bytes) {
        *self.frame.lock() = frame;
        self.suspended.store(false, Ordering::Release);
    }

    pub fn received_frame(&self) -> Bytes {
        self.frame.lock().clone()
    }

    pub fn target(&self) -> Option<DeviceHandle> {
        *self.target.lock()
    }

    pub(crate) fn set_target(&self, target: Option<DeviceHandle>) {
        *self.target.lock() = target;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }
}

// =============================================================================
// Port State
// =============================================================================

bitflags! {
    /// Domain events queued for a port and not yet started.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PendingEvents: u8 {
        const REVALIDATE = 0x01;
        const SUSPEND = 0x02;
        const RESUME = 0x04;
    }
}

/// Negotiated state of the port's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub attached_sas_address: SasAddress,
    pub oob_mode: OobMode,
    pub linkrate: LinkRate,
}

/// Scratch state of the expander walk, reset whenever a root is installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkState {
    pub fanout_sas_address: Option<SasAddress>,
    pub eeds_a: Option<SasAddress>,
    pub eeds_b: Option<SasAddress>,
    pub max_level: usize,
}

#[derive(Debug, Default)]
struct PortLists {
    disco: Vec<DeviceHandle>,
    devices: Vec<DeviceHandle>,
    expanders: Vec<DeviceHandle>,
    root: Option<DeviceHandle>,
}

/// Membership of a port's device lists at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSnapshot {
    pub disco: Vec<DeviceHandle>,
    pub devices: Vec<DeviceHandle>,
    pub expanders: Vec<DeviceHandle>,
}

impl ListSnapshot {
    pub fn is_empty(&self) -> bool {
        self.disco.is_empty() && self.devices.is_empty() && self.expanders.is_empty()
    }
}

fn remove_handle(list: &mut Vec<DeviceHandle>, handle: DeviceHandle) -> bool {
    match list.iter().position(|h| *h == handle) {
        Some(pos) => {
            list.remove(pos);
            true
        }
        None => false,
    }
}

// =============================================================================
// Port
// =============================================================================

/// A group of PHYs attached to the same remote device.
#[derive(Debug)]
pub struct Port {
    id: PortId,
    link: Mutex<LinkState>,
    phys: Mutex<Vec<Arc<Phy>>>,
    lists: Mutex<PortLists>,
    walk: Mutex<WalkState>,
    pending: Mutex<PendingEvents>,
    suspended: AtomicBool,
}

impl Port {
    pub fn new(id: PortId, link: LinkState) -> Self {
        Self {
            id,
            link: Mutex::new(link),
            phys: Mutex::new(Vec::new()),
            lists: Mutex::new(PortLists::default()),
            walk: Mutex::new(WalkState::default()),
            pending: Mutex::new(PendingEvents::empty()),
            suspended: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn link(&self) -> LinkState {
        *self.link.lock()
    }

    /// Re-form the port after its link came back up.
    pub fn set_link(&self, link: LinkState) {
        *self.link.lock() = link;
        self.suspended.store(false, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // PHY membership
    // -------------------------------------------------------------------------

    pub fn add_phy(&self, phy: Arc<Phy>) {
        self.phys.lock().push(phy);
    }

    pub fn remove_phy(&self, id: u8) -> Option<Arc<Phy>> {
        let mut phys = self.phys.lock();
        let pos = phys.iter().position(|p| p.id() == id)?;
        Some(phys.remove(pos))
    }

    pub fn phys(&self) -> Vec<Arc<Phy>> {
        self.phys.lock().clone()
    }

    pub fn num_phys(&self) -> usize {
        self.phys.lock().len()
    }

    /// Copy the first member PHY's received frame.
    pub(crate) fn capture_frame(&self, limit: usize) -> Option<(ReceivedFrame, Arc<Phy>)> {
        let phy = self.phys.lock().first().cloned()?;
        let frame = ReceivedFrame::capture(&phy.received_frame(), limit);
        Some((frame, phy))
    }

    /// Point every member PHY at the port's device.
    pub(crate) fn set_phy_targets(&self, target: Option<DeviceHandle>) {
        for phy in self.phys.lock().iter() {
            phy.set_target(target);
        }
    }

    /// Clear member PHY targets that still point at `handle`.
    pub(crate) fn clear_phy_targets(&self, handle: DeviceHandle) {
        for phy in self.phys.lock().iter() {
            if phy.target() == Some(handle) {
                phy.set_target(None);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Device lists
    // -------------------------------------------------------------------------

    /// The device at the root of the domain.
    pub fn root(&self) -> Option<DeviceHandle> {
        self.lists.lock().root
    }

    pub(crate) fn set_root(&self, _guard: &DomainGuard<'_>, root: Option<DeviceHandle>) {
        self.lists.lock().root = root;
    }

    /// Clear the root slot if it still holds `handle`.
    pub(crate) fn clear_root(&self, _guard: &DomainGuard<'_>, handle: DeviceHandle) -> bool {
        let mut lists = self.lists.lock();
        if lists.root == Some(handle) {
            lists.root = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn push_pending(&self, _guard: &DomainGuard<'_>, handle: DeviceHandle) {
        self.lists.lock().disco.push(handle);
    }

    pub(crate) fn push_expander(&self, _guard: &DomainGuard<'_>, handle: DeviceHandle) {
        self.lists.lock().expanders.push(handle);
    }

    pub(crate) fn is_pending(&self, _guard: &DomainGuard<'_>, handle: DeviceHandle) -> bool {
        self.lists.lock().disco.contains(&handle)
    }

    pub(crate) fn remove_pending(&self, _guard: &DomainGuard<'_>, handle: DeviceHandle) -> bool {
        remove_handle(&mut self.lists.lock().disco, handle)
    }

    /// Move a device from the pending list to the active list.
    pub(crate) fn activate(&self, _guard: &DomainGuard<'_>, handle: DeviceHandle) -> bool {
        let mut lists = self.lists.lock();
        if remove_handle(&mut lists.disco, handle) {
            lists.devices.push(handle);
            true
        } else {
            false
        }
    }

    /// Unlink a device from whichever list holds it.
    pub(crate) fn unlink(&self, _guard: &DomainGuard<'_>, handle: DeviceHandle) -> bool {
        let mut lists = self.lists.lock();
        let disco = remove_handle(&mut lists.disco, handle);
        let devices = remove_handle(&mut lists.devices, handle);
        let expanders = remove_handle(&mut lists.expanders, handle);
        disco || devices || expanders
    }

    pub fn lists(&self) -> ListSnapshot {
        let lists = self.lists.lock();
        ListSnapshot {
            disco: lists.disco.clone(),
            devices: lists.devices.clone(),
            expanders: lists.expanders.clone(),
        }
    }

    pub fn is_clear(&self) -> bool {
        self.lists().is_empty()
    }

    // -------------------------------------------------------------------------
    // Walk state, pending events, suspension
    // -------------------------------------------------------------------------

    pub fn walk_state(&self) -> WalkState {
        *self.walk.lock()
    }

    pub(crate) fn reset_walk(&self) {
        *self.walk.lock() = WalkState::default();
    }

    pub(crate) fn update_walk(&self, f: impl FnOnce(&mut WalkState)) {
        f(&mut self.walk.lock());
    }

    /// Mark an event pending; false if it already was.
    pub(crate) fn set_pending(&self, event: PendingEvents) -> bool {
        let mut pending = self.pending.lock();
        if pending.contains(event) {
            false
        } else {
            pending.insert(event);
            true
        }
    }

    pub(crate) fn clear_pending(&self, event: PendingEvents) {
        self.pending.lock().remove(event);
    }

    pub fn pending(&self) -> PendingEvents {
        *self.pending.lock()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }
}
