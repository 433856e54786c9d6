//! Recording Collaborator Adapter
//!
//! A single object standing in for the HBA driver, the transport-class
//! reporting layer and the ATA layer. Every hook call is logged, reporting
//! object and ATA port state is tracked, and failures can be injected per
//! SAS address. Used by the simulator binary and the test suites.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::trace;

use crate::domain::ports::{
    DeviceInfo, HookError, HookResult, LowLevelDriver, PortId, ReportingId, ReportingLayer,
    SasAddress, SataHost, SataPortId,
};

/// One logged collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    DevFound(SasAddress),
    BeforeDevGone(SasAddress),
    DevGone(SasAddress),
    PortDeformed(PortId, u8),
    Allocate(SasAddress),
    Register(SasAddress),
    Withdraw(SasAddress),
    Discard(SasAddress),
    RemoveChildren(SasAddress),
    DetachExpanderPort(SasAddress),
    DeleteParentPort(SasAddress),
    SataInit(SasAddress),
    SataProbe(SasAddress),
    SataEndRecovery(SataPortId),
    SataSuspend(SataPortId),
    SataResume(SataPortId),
    SataDestroy(SataPortId),
}

/// Hook to fail for a given address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    DevFound,
    Allocate,
    Register,
    SataInit,
    SataProbe,
}

#[derive(Debug)]
struct ReportingObject {
    address: SasAddress,
    refs: usize,
    registered: bool,
}

#[derive(Debug, Default)]
struct Bridge {
    suspended: bool,
    destroyed: bool,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    objects: HashMap<ReportingId, ReportingObject>,
    next_object: u64,
    bridges: HashMap<SataPortId, Bridge>,
    next_bridge: u64,
    failures: HashSet<(FailPoint, SasAddress)>,
    parent_port_phys: usize,
}

/// Logging, failure-injecting stand-in for the external collaborators.
#[derive(Debug)]
pub struct RecordingDriver {
    state: Mutex<State>,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                parent_port_phys: 1,
                ..Default::default()
            }),
        }
    }

    /// Make a hook fail for one address.
    pub fn fail(&self, point: FailPoint, address: SasAddress) {
        self.state.lock().failures.insert((point, address));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// PHY count reported for every object's parent transport port.
    pub fn set_parent_port_phys(&self, phys: usize) {
        self.state.lock().parent_port_phys = phys;
    }

    fn should_fail(&self, point: FailPoint, address: SasAddress) -> bool {
        self.state.lock().failures.contains(&(point, address))
    }

    fn record(&self, call: Call) {
        trace!(?call, "collaborator call");
        self.state.lock().calls.push(call);
    }

    fn object_address(&self, id: ReportingId) -> SasAddress {
        self.state
            .lock()
            .objects
            .get(&id)
            .map(|o| o.address)
            .unwrap_or_default()
    }

    fn drop_object_ref(&self, id: ReportingId) {
        if let Some(object) = self.state.lock().objects.get_mut(&id) {
            object.refs = object.refs.saturating_sub(1);
        }
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Position of the first matching call in the log.
    pub fn position(&self, call: &Call) -> Option<usize> {
        self.state.lock().calls.iter().position(|c| c == call)
    }

    pub fn object_refs(&self, id: ReportingId) -> usize {
        self.state.lock().objects.get(&id).map(|o| o.refs).unwrap_or(0)
    }

    /// Reporting objects still holding references.
    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.values().filter(|o| o.refs > 0).count()
    }

    pub fn is_registered(&self, address: SasAddress) -> bool {
        self.state
            .lock()
            .objects
            .values()
            .any(|o| o.address == address && o.registered)
    }

    pub fn registered_count(&self) -> usize {
        self.state.lock().objects.values().filter(|o| o.registered).count()
    }

    pub fn bridge_suspended(&self, ap: SataPortId) -> bool {
        self.state.lock().bridges.get(&ap).is_some_and(|b| b.suspended)
    }

    pub fn bridge_destroyed(&self, ap: SataPortId) -> bool {
        self.state.lock().bridges.get(&ap).is_some_and(|b| b.destroyed)
    }

    /// Allocate a reporting object outside of discovery.
    pub fn allocate_object(&self, dev: &DeviceInfo) -> ReportingId {
        let mut state = self.state.lock();
        state.next_object += 1;
        let id = ReportingId(state.next_object);
        state.objects.insert(
            id,
            ReportingObject {
                address: dev.sas_address,
                refs: 1,
                registered: false,
            },
        );
        id
    }

    pub fn retain_object(&self, id: ReportingId) {
        if let Some(object) = self.state.lock().objects.get_mut(&id) {
            object.refs += 1;
        }
    }
}

impl LowLevelDriver for RecordingDriver {
    fn dev_found(&self, dev: &DeviceInfo) -> HookResult {
        self.record(Call::DevFound(dev.sas_address));
        if self.should_fail(FailPoint::DevFound, dev.sas_address) {
            return Err(HookError::NO_DEVICE);
        }
        Ok(())
    }

    fn before_dev_gone(&self, dev: &DeviceInfo) {
        self.record(Call::BeforeDevGone(dev.sas_address));
    }

    fn dev_gone(&self, dev: &DeviceInfo) {
        self.record(Call::DevGone(dev.sas_address));
    }

    fn port_deformed(&self, port: PortId, phy_id: u8) {
        self.record(Call::PortDeformed(port, phy_id));
    }
}

impl ReportingLayer for RecordingDriver {
    fn allocate(&self, dev: &DeviceInfo) -> Option<ReportingId> {
        self.record(Call::Allocate(dev.sas_address));
        if self.should_fail(FailPoint::Allocate, dev.sas_address) {
            return None;
        }
        Some(self.allocate_object(dev))
    }

    fn retain(&self, id: ReportingId) {
        self.retain_object(id);
    }

    fn release(&self, id: ReportingId) {
        self.drop_object_ref(id);
    }

    fn discard(&self, id: ReportingId) {
        self.record(Call::Discard(self.object_address(id)));
        self.drop_object_ref(id);
    }

    fn register(&self, id: ReportingId) -> HookResult {
        let address = self.object_address(id);
        self.record(Call::Register(address));
        if self.should_fail(FailPoint::Register, address) {
            return Err(HookError::IO);
        }
        if let Some(object) = self.state.lock().objects.get_mut(&id) {
            object.registered = true;
        }
        Ok(())
    }

    fn withdraw(&self, id: ReportingId) {
        self.record(Call::Withdraw(self.object_address(id)));
        if let Some(object) = self.state.lock().objects.get_mut(&id) {
            object.registered = false;
            object.refs = object.refs.saturating_sub(1);
        }
    }

    fn remove_children(&self, id: ReportingId) {
        self.record(Call::RemoveChildren(self.object_address(id)));
    }

    fn detach_expander_port(&self, id: ReportingId) {
        self.record(Call::DetachExpanderPort(self.object_address(id)));
    }

    fn parent_port_phys(&self, _id: ReportingId) -> usize {
        self.state.lock().parent_port_phys
    }

    fn delete_parent_port(&self, id: ReportingId) {
        self.record(Call::DeleteParentPort(self.object_address(id)));
    }
}

impl SataHost for RecordingDriver {
    fn init(&self, dev: &DeviceInfo) -> Result<SataPortId, HookError> {
        self.record(Call::SataInit(dev.sas_address));
        if self.should_fail(FailPoint::SataInit, dev.sas_address) {
            return Err(HookError::NO_MEMORY);
        }
        let mut state = self.state.lock();
        state.next_bridge += 1;
        let ap = SataPortId(state.next_bridge);
        state.bridges.insert(ap, Bridge::default());
        Ok(ap)
    }

    fn probe(&self, dev: &DeviceInfo, _ap: SataPortId) -> HookResult {
        self.record(Call::SataProbe(dev.sas_address));
        if self.should_fail(FailPoint::SataProbe, dev.sas_address) {
            return Err(HookError::NO_DEVICE);
        }
        Ok(())
    }

    fn end_recovery(&self, ap: SataPortId) {
        self.record(Call::SataEndRecovery(ap));
    }

    fn suspend(&self, ap: SataPortId) {
        self.record(Call::SataSuspend(ap));
        self.state.lock().bridges.entry(ap).or_default().suspended = true;
    }

    fn resume(&self, ap: SataPortId) {
        self.record(Call::SataResume(ap));
        self.state.lock().bridges.entry(ap).or_default().suspended = false;
    }

    fn destroy(&self, ap: SataPortId) {
        self.record(Call::SataDestroy(ap));
        self.state.lock().bridges.entry(ap).or_default().destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{DeviceHandle, DeviceKind, LinkRate, Protocol};

    fn info(addr: u64) -> DeviceInfo {
        DeviceInfo {
            handle: DeviceHandle(1),
            port: PortId(0),
            sas_address: SasAddress::from_u64(addr),
            kind: DeviceKind::EndDevice,
            initiator_protocols: Protocol::empty(),
            target_protocols: Protocol::SSP,
            linkrate: LinkRate::G6,
            parent: None,
            phy_identifier: 0,
            pathways: 1,
        }
    }

    #[test]
    fn test_failure_injection() {
        let driver = RecordingDriver::new();
        driver.fail(FailPoint::DevFound, SasAddress::from_u64(2));

        assert!(driver.dev_found(&info(1)).is_ok());
        assert_eq!(driver.dev_found(&info(2)), Err(HookError::NO_DEVICE));
        assert_eq!(driver.count(&Call::DevFound(SasAddress::from_u64(2))), 1);

        driver.clear_failures();
        assert!(driver.dev_found(&info(2)).is_ok());
    }

    #[test]
    fn test_reporting_object_refs() {
        let driver = RecordingDriver::new();
        let id = ReportingLayer::allocate(&driver, &info(1)).unwrap();
        driver.retain(id);
        assert_eq!(driver.object_refs(id), 2);

        driver.register(id).unwrap();
        assert!(driver.is_registered(SasAddress::from_u64(1)));

        driver.withdraw(id);
        assert!(!driver.is_registered(SasAddress::from_u64(1)));
        driver.release(id);
        assert_eq!(driver.live_objects(), 0);
    }

    #[test]
    fn test_bridge_state() {
        let driver = RecordingDriver::new();
        let ap = driver.init(&info(1)).unwrap();
        driver.suspend(ap);
        assert!(driver.bridge_suspended(ap));
        driver.resume(ap);
        assert!(!driver.bridge_suspended(ap));
        SataHost::destroy(&driver, ap);
        assert!(driver.bridge_destroyed(ap));
    }
}
