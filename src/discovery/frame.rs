//! Classifier
//!
//! Interprets the identification payload captured when a link comes up.
//! A SAS link delivers an IDENTIFY address frame; a SATA link delivers the
//! device's initial register device-to-host FIS, whose signature fields
//! tell a plain drive from a port multiplier.
//!
//! # Layouts
//!
//! ```text
//! IDENTIFY                          D2H register FIS
//! byte 0   [6:4] device type        byte 0   FIS type (0x34)
//! byte 2   initiator protocols      byte 4   LBA low
//! byte 3   target protocols         byte 5   LBA mid  / byte count low
//! 12..=19  SAS address              byte 6   LBA high / byte count high
//! byte 20  PHY identifier           byte 7   device
//!                                   byte 12  sector count / interrupt reason
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::MAX_FRAME_SIZE;
use crate::domain::ports::{DeviceKind, OobMode, Protocol, SasAddress};
use crate::error::{Error, Result};

/// FIS type of a register device-to-host FIS
pub const D2H_FIS_TYPE: u8 = 0x34;

const ID_DEV_TYPE: usize = 0;
const ID_INITIATOR: usize = 2;
const ID_TARGET: usize = 3;
const ID_SAS_ADDR: usize = 12;
const ID_PHY_ID: usize = 20;

const FIS_LBAL: usize = 4;
const FIS_BYTE_COUNT_LOW: usize = 5;
const FIS_BYTE_COUNT_HIGH: usize = 6;
const FIS_DEVICE: usize = 7;
const FIS_INTERRUPT_REASON: usize = 12;

/// Zero-padded copy of a received frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ReceivedFrame([u8; MAX_FRAME_SIZE]);

impl ReceivedFrame {
    /// Copy at most `limit` bytes (and never more than the frame holds).
    pub fn capture(raw: &[u8], limit: usize) -> Self {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = raw.len().min(limit).min(MAX_FRAME_SIZE);
        buf[..len].copy_from_slice(&raw[..len]);
        Self(buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ReceivedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReceivedFrame({:02x?})", &self.0[..])
    }
}

/// Outcome of classifying a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: DeviceKind,
    pub initiator_protocols: Protocol,
    pub target_protocols: Protocol,
}

/// Classify a captured frame according to the link's OOB mode.
pub fn classify(frame: &ReceivedFrame, oob_mode: OobMode) -> Result<Classification> {
    let f = frame.as_bytes();

    if f[0] == D2H_FIS_TYPE && oob_mode == OobMode::Sata {
        let kind = if is_port_multiplier_signature(f) {
            DeviceKind::SataPortMultiplier
        } else {
            DeviceKind::SataDevice
        };
        return Ok(Classification {
            kind,
            initiator_protocols: Protocol::empty(),
            target_protocols: Protocol::SATA,
        });
    }

    let code = (f[ID_DEV_TYPE] >> 4) & 0x07;
    let kind = DeviceKind::from_code(code).ok_or(Error::UnknownDeviceType(code))?;

    Ok(Classification {
        kind,
        initiator_protocols: Protocol::from_bits_truncate(f[ID_INITIATOR]),
        target_protocols: Protocol::from_bits_truncate(f[ID_TARGET]),
    })
}

fn is_port_multiplier_signature(f: &[u8]) -> bool {
    f[FIS_INTERRUPT_REASON] == 1
        && f[FIS_LBAL] == 1
        && f[FIS_BYTE_COUNT_LOW] == 0x69
        && f[FIS_BYTE_COUNT_HIGH] == 0x96
        && (f[FIS_DEVICE] & !0x10) == 0
}

// =============================================================================
// Frame Builders
// =============================================================================

/// Build an IDENTIFY address frame.
pub fn identify_frame(
    kind: DeviceKind,
    initiator: Protocol,
    target: Protocol,
    sas_address: SasAddress,
    phy_id: u8,
) -> Bytes {
    let mut buf = BytesMut::zeroed(28);
    // Frame type 0 (IDENTIFY) in the low nibble.
    buf[ID_DEV_TYPE] = (kind.code() & 0x07) << 4;
    buf[ID_INITIATOR] = initiator.bits();
    buf[ID_TARGET] = target.bits();
    buf[ID_SAS_ADDR..ID_SAS_ADDR + 8].copy_from_slice(&sas_address.0);
    buf[ID_PHY_ID] = phy_id;
    buf.freeze()
}

/// Build the initial register D2H FIS a SATA device sends after reset.
pub fn d2h_signature_fis(port_multiplier: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u8(D2H_FIS_TYPE);
    buf.put_u8(0); // flags
    buf.put_u8(0x50); // status: DRDY | DSC
    buf.put_u8(0x01); // error
    buf.put_u8(1); // LBA low
    if port_multiplier {
        buf.put_u8(0x69);
        buf.put_u8(0x96);
    } else {
        buf.put_u8(0x00);
        buf.put_u8(0x00);
    }
    buf.put_u8(0); // device
    buf.put_bytes(0, 4);
    buf.put_u8(1); // sector count
    buf.put_bytes(0, 7);
    buf.freeze()
}

// =============================================================================
// Tests
// =============================================================================
