//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the value objects shared by the discovery engine and
//! the narrow interfaces (ports) through which it reaches its external
//! collaborators. Adapters implement these traits; the engine never talks
//! to PHY management, the transport class, libata or the SMP protocol
//! directly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Discovery Engine                          │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │ LowLevelDriver │ ReportingLayer │ SataHost │ SMP    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │   HBA driver │ transport class │ ATA layer │ expanders      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::events::TopologyEvent;

// =============================================================================
// Value Objects
// =============================================================================

/// 64-bit SAS address (value object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SasAddress(pub [u8; 8]);

/// Polynomial used to fold a SAS address into its 24-bit hashed form.
const SAS_HASH_POLY: u32 = 0x00DB_2777;

impl SasAddress {
    /// The all-zero address (nothing attached).
    pub const ZERO: SasAddress = SasAddress([0; 8]);

    pub fn from_u64(addr: u64) -> Self {
        Self(addr.to_be_bytes())
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 8]
    }

    /// Compute the 24-bit hashed address.
    ///
    /// Bits are shifted in MSB first; the polynomial is applied whenever the
    /// incoming bit differs from bit 24 of the remainder.
    pub fn hashed(&self) -> HashedAddress {
        let mut r: u32 = 0;

        for byte in self.0 {
            for b in (0..8).rev() {
                r <<= 1;
                let bit_set = byte & (1 << b) != 0;
                let carry = r & 0x0100_0000 != 0;
                if bit_set != carry {
                    r ^= SAS_HASH_POLY;
                }
            }
        }

        HashedAddress([(r >> 16) as u8, (r >> 8) as u8, r as u8])
    }
}

impl std::fmt::Display for SasAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.as_u64())
    }
}

impl From<u64> for SasAddress {
    fn from(addr: u64) -> Self {
        Self::from_u64(addr)
    }
}

/// 24-bit hashed SAS address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HashedAddress(pub [u8; 3]);

impl std::fmt::Display for HashedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

/// Port identifier (value object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(pub u32);

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable handle of a device in the registry arena.
///
/// Handles are never reused, so a handle outliving its device resolves to
/// nothing instead of to some other device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub(crate) u64);

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Handle of the transport-class reporting object owned by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReportingId(pub u64);

/// Handle of the ATA port bridging a SATA device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SataPortId(pub u64);

/// Negotiated link rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum LinkRate {
    #[default]
    Unknown,
    #[serde(rename = "1.5G")]
    G1_5,
    #[serde(rename = "3G")]
    G3,
    #[serde(rename = "6G")]
    G6,
    #[serde(rename = "12G")]
    G12,
}

impl std::fmt::Display for LinkRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkRate::Unknown => write!(f, "unknown"),
            LinkRate::G1_5 => write!(f, "1.5 Gbit"),
            LinkRate::G3 => write!(f, "3.0 Gbit"),
            LinkRate::G6 => write!(f, "6.0 Gbit"),
            LinkRate::G12 => write!(f, "12.0 Gbit"),
        }
    }
}

/// Out-of-band signalling mode negotiated on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OobMode {
    #[default]
    Sas,
    Sata,
}

bitflags! {
    /// Protocol roles advertised in an identify frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Protocol: u8 {
        const SATA = 0x01;
        const SMP = 0x02;
        const STP = 0x04;
        const SSP = 0x08;
    }
}

/// Kind of a fabric-attached device. Immutable once classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    EndDevice,
    EdgeExpander,
    FanoutExpander,
    SataDevice,
    SataPortMultiplier,
}

impl DeviceKind {
    /// Map an identify-frame device type code to a kind.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DeviceKind::EndDevice),
            2 => Some(DeviceKind::EdgeExpander),
            3 => Some(DeviceKind::FanoutExpander),
            5 => Some(DeviceKind::SataDevice),
            7 => Some(DeviceKind::SataPortMultiplier),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            DeviceKind::EndDevice => 1,
            DeviceKind::EdgeExpander => 2,
            DeviceKind::FanoutExpander => 3,
            DeviceKind::SataDevice => 5,
            DeviceKind::SataPortMultiplier => 7,
        }
    }

    pub fn is_expander(&self) -> bool {
        matches!(self, DeviceKind::EdgeExpander | DeviceKind::FanoutExpander)
    }

    pub fn is_sata(&self) -> bool {
        matches!(self, DeviceKind::SataDevice | DeviceKind::SataPortMultiplier)
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::EndDevice => write!(f, "end device"),
            DeviceKind::EdgeExpander => write!(f, "edge expander"),
            DeviceKind::FanoutExpander => write!(f, "fanout expander"),
            DeviceKind::SataDevice => write!(f, "SATA device"),
            DeviceKind::SataPortMultiplier => write!(f, "SATA port multiplier"),
        }
    }
}

/// Immutable snapshot of a device handed to collaborators.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub handle: DeviceHandle,
    pub port: PortId,
    pub sas_address: SasAddress,
    pub kind: DeviceKind,
    pub initiator_protocols: Protocol,
    pub target_protocols: Protocol,
    pub linkrate: LinkRate,
    /// Address of the parent expander, `None` for a port's root device
    pub parent: Option<SasAddress>,
    pub phy_identifier: u8,
    pub pathways: usize,
}

/// Errno-style failure code returned by a collaborator hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("hook returned error code {0}")]
pub struct HookError(pub i32);

impl HookError {
    pub const IO: HookError = HookError(-5);
    pub const NO_MEMORY: HookError = HookError(-12);
    pub const NO_DEVICE: HookError = HookError(-19);
}

/// Result type for collaborator hooks.
pub type HookResult = std::result::Result<(), HookError>;

// =============================================================================
// Low-Level Driver Port
// =============================================================================

/// Notification hooks of the host bus adapter driver.
///
/// Every hook is optional; the defaults accept the device and do nothing.
/// `dev_gone` is called at most once per successful `dev_found`.
pub trait LowLevelDriver: Send + Sync {
    /// Offered a fully classified device.
    fn dev_found(&self, _dev: &DeviceInfo) -> HookResult {
        Ok(())
    }

    /// Called before a registered device is withdrawn.
    fn before_dev_gone(&self, _dev: &DeviceInfo) {}

    /// The driver must forget the device.
    fn dev_gone(&self, _dev: &DeviceInfo) {}

    /// A member PHY of a suspended port is being taken out of the port.
    fn port_deformed(&self, _port: PortId, _phy_id: u8) {}
}

// =============================================================================
// Reporting Layer Port
// =============================================================================

/// The transport-class layer that makes devices externally visible.
///
/// A reporting object is allocated with one reference which `discard`
/// drops for objects never registered. Devices take their own reference
/// with `retain` and drop it in their destructor.
pub trait ReportingLayer: Send + Sync {
    /// Allocate a reporting object for a freshly classified device.
    fn allocate(&self, dev: &DeviceInfo) -> Option<ReportingId>;

    fn retain(&self, id: ReportingId);

    fn release(&self, id: ReportingId);

    /// Free an object that never saw a successful `register`.
    fn discard(&self, id: ReportingId);

    /// Exclusive registration with the consumer layer.
    fn register(&self, id: ReportingId) -> HookResult;

    /// Withdraw a registered object from the consumer layer.
    fn withdraw(&self, id: ReportingId);

    /// Remove every object parented under this one.
    fn remove_children(&self, id: ReportingId);

    /// Tear down the port an expander's object opened for its children.
    fn detach_expander_port(&self, id: ReportingId);

    /// Number of PHYs still in the transport port this object hangs off.
    fn parent_port_phys(&self, id: ReportingId) -> usize;

    /// Delete the (empty) transport port this object hangs off.
    fn delete_parent_port(&self, id: ReportingId);
}

// =============================================================================
// SATA Host Port
// =============================================================================

/// The ATA layer bridging SATA devices.
pub trait SataHost: Send + Sync {
    /// Create the ATA port bridging the device.
    fn init(&self, dev: &DeviceInfo) -> std::result::Result<SataPortId, HookError>;

    /// Probe the device behind the bridge.
    fn probe(&self, dev: &DeviceInfo, ap: SataPortId) -> HookResult;

    /// End any error handling still running against the port.
    fn end_recovery(&self, _ap: SataPortId) {}

    fn suspend(&self, ap: SataPortId);

    fn resume(&self, ap: SataPortId);

    fn destroy(&self, ap: SataPortId);
}

// =============================================================================
// Expander Protocol Port
// =============================================================================

/// Device attached to an expander PHY, as reported by the SMP protocol.
#[derive(Debug, Clone)]
pub struct AttachedDevice {
    pub sas_address: SasAddress,
    pub oob_mode: OobMode,
    /// Identify frame, or the initial D2H FIS for SATA links
    pub frame: bytes::Bytes,
    pub linkrate: LinkRate,
}

/// One entry of an expander's PHY table.
#[derive(Debug, Clone)]
pub struct ExpanderPhy {
    pub phy_id: u8,
    pub attached: Option<AttachedDevice>,
}

/// SMP-level interrogation of expanders.
#[async_trait]
pub trait ExpanderProtocol: Send + Sync {
    /// Report the PHY table of an expander.
    async fn report_phys(&self, expander: &DeviceInfo) -> std::result::Result<Vec<ExpanderPhy>, HookError>;
}

// =============================================================================
// Event Sink Port
// =============================================================================

/// Port for publishing topology events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: TopologyEvent);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sas_address_roundtrip() {
        let addr = SasAddress::from_u64(0x5000_c500_1234_5678);
        assert_eq!(addr.as_u64(), 0x5000_c500_1234_5678);
        assert_eq!(addr.to_string(), "5000c50012345678");
        assert!(!addr.is_zero());
        assert!(SasAddress::ZERO.is_zero());
    }

    #[test]
    fn test_hashed_address() {
        assert_eq!(SasAddress::ZERO.hashed(), HashedAddress([0, 0, 0]));

        let a = SasAddress::from_u64(0x5000_c500_1234_5678);
        let b = SasAddress::from_u64(0x5000_c500_1234_5679);
        assert_eq!(a.hashed(), a.hashed());
        assert_ne!(a.hashed(), b.hashed());
    }

    #[test]
    fn test_hash_single_low_bit() {
        // A lone trailing one bit leaves exactly the polynomial in the remainder.
        let addr = SasAddress::from_u64(1);
        assert_eq!(addr.hashed(), HashedAddress([0xDB, 0x27, 0x77]));
    }

    #[test]
    fn test_device_kind_codes() {
        for kind in [
            DeviceKind::EndDevice,
            DeviceKind::EdgeExpander,
            DeviceKind::FanoutExpander,
            DeviceKind::SataDevice,
            DeviceKind::SataPortMultiplier,
        ] {
            assert_eq!(DeviceKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(DeviceKind::from_code(0), None);
        assert_eq!(DeviceKind::from_code(4), None);
        assert!(DeviceKind::FanoutExpander.is_expander());
        assert!(DeviceKind::SataPortMultiplier.is_sata());
        assert!(!DeviceKind::EndDevice.is_expander());
    }

    #[test]
    fn test_link_rate_display() {
        assert_eq!(LinkRate::G6.to_string(), "6.0 Gbit");
        assert!(LinkRate::G12 > LinkRate::G3);
    }
}
