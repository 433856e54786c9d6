//! Property-Based Tests for Discovery
//!
//! # Test Properties
//!
//! 1. **Classification**: every frame either classifies or is rejected as an
//!    unknown type; SATA FIS frames never classify as SAS kinds
//! 2. **Hashing**: the hashed address is a pure function of the address
//! 3. **Reference counting**: any balanced retain/release sequence frees the
//!    device exactly once

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;

use super::device::DeviceSpec;
use super::frame::{classify, d2h_signature_fis, identify_frame, Classification, ReceivedFrame, D2H_FIS_TYPE};
use super::registry::DeviceRegistry;
use crate::adapters::{InMemoryEventSink, RecordingDriver};
use crate::config::MAX_FRAME_SIZE;
use crate::domain::ports::{DeviceKind, LinkRate, OobMode, PortId, Protocol, SasAddress};
use crate::error::Error;
use crate::metrics::DiscoveryMetrics;

// =============================================================================
// Property Strategies
// =============================================================================

fn frame_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=48)
}

fn kind_strategy() -> impl Strategy<Value = DeviceKind> {
    prop_oneof![
        Just(DeviceKind::EndDevice),
        Just(DeviceKind::EdgeExpander),
        Just(DeviceKind::FanoutExpander),
        Just(DeviceKind::SataDevice),
        Just(DeviceKind::SataPortMultiplier),
    ]
}

// =============================================================================
// Classification Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_classify_is_total(raw in frame_strategy(), sata in any::<bool>()) {
        let mode = if sata { OobMode::Sata } else { OobMode::Sas };
        let frame = ReceivedFrame::capture(&raw, MAX_FRAME_SIZE);
        match classify(&frame, mode) {
            Ok(_) => {}
            Err(Error::UnknownDeviceType(code)) => prop_assert!(matches!(code, 0 | 4 | 6)),
            Err(e) => prop_assert!(false, "unexpected error {}", e),
        }
    }

    #[test]
    fn prop_sata_fis_is_sata_kind(raw in frame_strategy()) {
        let mut raw = raw;
        if raw.is_empty() {
            raw.push(0);
        }
        raw[0] = D2H_FIS_TYPE;
        let frame = ReceivedFrame::capture(&raw, MAX_FRAME_SIZE);
        let c = classify(&frame, OobMode::Sata).unwrap();
        prop_assert!(c.kind.is_sata());
    }

    #[test]
    fn prop_identify_frame_classifies_back(
        kind in kind_strategy(),
        addr in any::<u64>(),
        target in 0u8..16,
        phy in any::<u8>(),
    ) {
        let target = Protocol::from_bits_truncate(target);
        let raw = identify_frame(kind, Protocol::empty(), target, SasAddress::from_u64(addr), phy);
        let frame = ReceivedFrame::capture(&raw, MAX_FRAME_SIZE);
        let c = classify(&frame, OobMode::Sas).unwrap();
        prop_assert_eq!(c.kind, kind);
        prop_assert_eq!(c.target_protocols, target);
    }

    #[test]
    fn prop_pm_signature_only_on_sata_links(pm in any::<bool>()) {
        let raw = d2h_signature_fis(pm);
        let frame = ReceivedFrame::capture(&raw, MAX_FRAME_SIZE);
        let c = classify(&frame, OobMode::Sata).unwrap();
        prop_assert_eq!(c.kind == DeviceKind::SataPortMultiplier, pm);
    }

    #[test]
    fn prop_hash_is_deterministic(addr in any::<u64>()) {
        let a = SasAddress::from_u64(addr);
        prop_assert_eq!(a.hashed(), SasAddress::from_u64(addr).hashed());
    }
}

// =============================================================================
// Reference Counting Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_balanced_refs_free_once(extra in 0usize..32) {
        let driver = Arc::new(RecordingDriver::new());
        let sink = Arc::new(InMemoryEventSink::new());
        let registry = DeviceRegistry::new(
            driver.clone(),
            driver,
            sink.clone(),
            DiscoveryMetrics::new().unwrap(),
        );

        let device = registry
            .allocate(DeviceSpec {
                port: PortId(0),
                sas_address: SasAddress::from_u64(0x42),
                classification: Classification {
                    kind: DeviceKind::EndDevice,
                    initiator_protocols: Protocol::empty(),
                    target_protocols: Protocol::SSP,
                },
                linkrate: LinkRate::G3,
                pathways: 1,
                phy_identifier: 0,
                parent: None,
                parent_address: None,
            })
            .unwrap();

        for _ in 0..extra {
            registry.retain(&device);
        }
        for _ in 0..extra {
            registry.release(&device);
        }
        prop_assert!(registry.get(device.handle()).is_some());

        registry.release(&device);
        prop_assert!(registry.is_empty());
        prop_assert_eq!(sink.count_by_type("DeviceReleased"), 1);
    }
}
