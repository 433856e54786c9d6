//! Simulated SAS Fabric
//!
//! Implements the `ExpanderProtocol` port over an in-memory expander tree
//! and loads whole topologies from YAML for the simulator binary.
//!
//! # Topology File
//!
//! ```yaml
//! host: hba0
//! ports:
//!   - id: 0
//!     phys: [0, 1, 2, 3]
//!     attached:
//!       address: "5000c50000000100"
//!       kind: EdgeExpander
//!       phys:
//!         - phy: 0
//!           attached: { address: "5000c50000000101", kind: EndDevice }
//! script:
//!   - action: discover
//!     port: 0
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

use crate::config::DiscoveryConfig;
use crate::discovery::{d2h_signature_fis, identify_frame, LinkState, Phy, Port};
use crate::domain::ports::{
    AttachedDevice, DeviceInfo, DeviceKind, ExpanderPhy, ExpanderProtocol, HookError, LinkRate,
    OobMode, PortId, Protocol, SasAddress,
};
use crate::error::{Error, Result};

// =============================================================================
// Topology Description
// =============================================================================

/// A device in a topology file.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologyNode {
    /// Hex SAS address, with or without a `0x` prefix
    pub address: String,
    pub kind: DeviceKind,
    #[serde(default = "default_linkrate")]
    pub linkrate: LinkRate,
    /// Expander PHYs and what hangs off them
    #[serde(default)]
    pub phys: Vec<PhyAttachment>,
}

fn default_linkrate() -> LinkRate {
    LinkRate::G6
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhyAttachment {
    pub phy: u8,
    pub attached: TopologyNode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortTopology {
    pub id: u32,
    pub phys: Vec<u8>,
    pub attached: Option<TopologyNode>,
}

/// Simulator actions, executed in order.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Discover { port: u32 },
    Revalidate { port: u32 },
    Suspend { port: u32 },
    Resume { port: u32 },
    LinkDown { port: u32 },
    Attach { expander: String, phy: u8, device: TopologyNode },
    Detach { expander: String, phy: u8 },
    BeginAtaRecovery,
    FinishAtaRecovery,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub config: DiscoveryConfig,
    pub ports: Vec<PortTopology>,
    #[serde(default)]
    pub script: Vec<Step>,
}

fn default_host() -> String {
    "host0".to_string()
}

pub fn parse_address(raw: &str) -> Result<SasAddress> {
    let digits = raw.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16)
        .map(SasAddress::from_u64)
        .map_err(|e| Error::Config(format!("invalid SAS address {:?}: {}", raw, e)))
}

impl TopologyNode {
    pub fn sas_address(&self) -> Result<SasAddress> {
        parse_address(&self.address)
    }

    /// What an upstream PHY sees when this device is attached to it.
    pub fn attached_device(&self, phy_id: u8) -> Result<AttachedDevice> {
        let sas_address = self.sas_address()?;
        let (oob_mode, frame) = match self.kind {
            DeviceKind::SataDevice => (OobMode::Sata, d2h_signature_fis(false)),
            DeviceKind::SataPortMultiplier => (OobMode::Sata, d2h_signature_fis(true)),
            DeviceKind::EndDevice => (
                OobMode::Sas,
                identify_frame(self.kind, Protocol::empty(), Protocol::SSP, sas_address, phy_id),
            ),
            DeviceKind::EdgeExpander | DeviceKind::FanoutExpander => (
                OobMode::Sas,
                identify_frame(self.kind, Protocol::SMP, Protocol::SMP, sas_address, phy_id),
            ),
        };
        Ok(AttachedDevice {
            sas_address,
            oob_mode,
            frame,
            linkrate: self.linkrate,
        })
    }
}

impl Topology {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let topology: Topology = serde_yaml::from_str(text)?;
        topology.config.validate()?;
        Ok(topology)
    }

    /// Build the host ports, with each PHY holding the frame its link delivered.
    pub fn build_ports(&self) -> Result<Vec<Port>> {
        let mut ports = Vec::with_capacity(self.ports.len());
        for spec in &self.ports {
            let link = match &spec.attached {
                Some(node) => {
                    let attached = node.attached_device(spec.phys.first().copied().unwrap_or(0))?;
                    LinkState {
                        attached_sas_address: attached.sas_address,
                        oob_mode: attached.oob_mode,
                        linkrate: attached.linkrate,
                    }
                }
                None => LinkState {
                    attached_sas_address: SasAddress::ZERO,
                    oob_mode: OobMode::Sas,
                    linkrate: LinkRate::Unknown,
                },
            };

            let port = Port::new(PortId(spec.id), link);
            for phy_id in &spec.phys {
                let phy = match &spec.attached {
                    Some(node) => Phy::with_frame(*phy_id, node.attached_device(*phy_id)?.frame),
                    None => Phy::new(*phy_id),
                };
                port.add_phy(Arc::new(phy));
            }
            ports.push(port);
        }
        Ok(ports)
    }

    /// Populate a fabric with every expander of the topology.
    pub fn build_fabric(&self) -> Result<SimulatedFabric> {
        let fabric = SimulatedFabric::new();
        for spec in &self.ports {
            if let Some(node) = &spec.attached {
                fabric.load(node)?;
            }
        }
        Ok(fabric)
    }
}

// =============================================================================
// Simulated Fabric
// =============================================================================

/// In-memory expander tree answering PHY table reports.
#[derive(Debug, Default)]
pub struct SimulatedFabric {
    expanders: RwLock<HashMap<SasAddress, BTreeMap<u8, Option<AttachedDevice>>>>,
    failing: RwLock<HashSet<SasAddress>>,
}

impl SimulatedFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an expander with `num_phys` vacant PHYs (at most 256).
    pub fn add_expander(&self, address: SasAddress, num_phys: u16) {
        let table = (0..=u8::MAX)
            .take(usize::from(num_phys))
            .map(|id| (id, None))
            .collect();
        self.expanders.write().insert(address, table);
    }

    /// Attach a device to an expander PHY, creating the PHY if needed.
    pub fn attach(&self, expander: SasAddress, phy: u8, device: AttachedDevice) -> Result<()> {
        let mut expanders = self.expanders.write();
        let table = expanders
            .get_mut(&expander)
            .ok_or_else(|| Error::Config(format!("no expander {}", expander)))?;
        table.insert(phy, Some(device));
        Ok(())
    }

    /// Unplug whatever is attached to an expander PHY.
    pub fn detach(&self, expander: SasAddress, phy: u8) -> Option<AttachedDevice> {
        self.expanders
            .write()
            .get_mut(&expander)
            .and_then(|table| table.get_mut(&phy))
            .and_then(|slot| slot.take())
    }

    /// Make PHY table reports of an expander fail.
    pub fn fail_reports(&self, expander: SasAddress) {
        self.failing.write().insert(expander);
    }

    /// Load a node and, for expanders, everything below it.
    pub fn load(&self, node: &TopologyNode) -> Result<()> {
        if !node.kind.is_expander() {
            return Ok(());
        }
        let address = node.sas_address()?;
        let num_phys = node
            .phys
            .iter()
            .map(|p| u16::from(p.phy) + 1)
            .max()
            .unwrap_or(0);
        self.add_expander(address, num_phys);
        for link in &node.phys {
            self.attach(address, link.phy, link.attached.attached_device(link.phy)?)?;
            self.load(&link.attached)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExpanderProtocol for SimulatedFabric {
    async fn report_phys(
        &self,
        expander: &DeviceInfo,
    ) -> std::result::Result<Vec<ExpanderPhy>, HookError> {
        if self.failing.read().contains(&expander.sas_address) {
            return Err(HookError::IO);
        }
        let expanders = self.expanders.read();
        let table = expanders
            .get(&expander.sas_address)
            .ok_or(HookError::NO_DEVICE)?;

        debug!(expander = %expander.sas_address, phys = table.len(), "report phys");
        Ok(table
            .iter()
            .map(|(phy_id, attached)| ExpanderPhy {
                phy_id: *phy_id,
                attached: attached.clone(),
            })
            .collect())
    }
}
