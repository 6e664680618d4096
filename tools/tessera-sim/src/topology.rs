//! Topology files.
//!
//! A topology file lists the functions on a simulated bus (with their
//! resources and initial register state) and a script of enable/disable
//! steps. [`Topology::parse`] turns it into a ready-to-run [`PciEnabler`]
//! over a [`SimBus`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tessera_pci::device::{DeviceId, DeviceTable, PciDevice};
use tessera_pci::regs;
use tessera_pci::resource::{Resource, ResourceIndex};
use tessera_pci::sim::{SimBus, SimFunction, SimPower};
use tessera_pci::{EnableConfig, PciAddress, PciEnabler};

/// Offset the simulator places the MSI capability at.
const MSI_CAP_OFFSET: u8 = 0x50;
/// Offset the simulator places the MSI-X capability at.
const MSIX_CAP_OFFSET: u8 = 0x70;

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// The whole topology file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyFile {
    #[serde(default)]
    pub engine: EngineDef,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceDef>,
    #[serde(default, rename = "step")]
    pub steps: Vec<StepDef>,
}

/// Optional `[engine]` table.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineDef {
    pub max_bridge_depth: Option<usize>,
    pub capability_ttl: Option<u8>,
}

/// One `[[device]]` entry.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceDef {
    pub name: String,
    pub address: String,
    pub parent: Option<String>,
    #[serde(default)]
    pub bridge: bool,
    #[serde(default = "default_vendor")]
    pub vendor: u16,
    #[serde(default)]
    pub device_id: u16,
    #[serde(default)]
    pub command: u16,
    #[serde(default)]
    pub interrupt_pin: u8,
    /// Whether firmware left an enabled MSI capability behind.
    #[serde(default)]
    pub msi: bool,
    /// Whether firmware left an enabled MSI-X capability behind.
    #[serde(default)]
    pub msix: bool,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceDef>,
}

fn default_vendor() -> u16 {
    0x8086
}

/// One `[[device.resource]]` entry.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDef {
    pub index: IndexDef,
    pub kind: KindDef,
    #[serde(default)]
    pub base: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub unset: bool,
    #[serde(default)]
    pub claimed: bool,
    #[serde(default)]
    pub rom_enabled: bool,
}

/// A BAR number or `"rom"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IndexDef {
    Bar(u8),
    Named(String),
}

impl IndexDef {
    fn resolve(&self) -> Result<ResourceIndex> {
        match self {
            Self::Bar(n) => {
                ResourceIndex::bar(*n).ok_or_else(|| anyhow!("BAR index {n} out of range (0..=5)"))
            }
            Self::Named(name) if name.eq_ignore_ascii_case("rom") => Ok(ResourceIndex::ROM),
            Self::Named(name) => bail!("unknown resource index {name:?}"),
        }
    }
}

/// Resource address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindDef {
    Mem,
    Io,
}

/// One `[[step]]` entry.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
    pub op: Op,
    pub device: String,
}

/// Operation performed by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Op {
    Enable,
    EnableMem,
    EnableIo,
    Disable,
    Reenable,
    SetMaster,
    ClearMaster,
    Disconnect,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Enable => "enable",
            Self::EnableMem => "enable-mem",
            Self::EnableIo => "enable-io",
            Self::Disable => "disable",
            Self::Reenable => "reenable",
            Self::SetMaster => "set-master",
            Self::ClearMaster => "clear-master",
            Self::Disconnect => "disconnect",
        })
    }
}

// ---------------------------------------------------------------------------
// Built topology
// ---------------------------------------------------------------------------

/// A resolved step.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub op: Op,
    pub device: DeviceId,
}

/// A topology ready to run.
#[derive(Debug)]
pub struct Topology {
    pub enabler: PciEnabler<SimBus, SimPower>,
    pub steps: Vec<Step>,
    names: Vec<String>,
}

impl Topology {
    /// Reads and builds a topology file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Builds a topology from TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        let file: TopologyFile = toml::from_str(text).context("parsing topology")?;
        Self::build(file)
    }

    fn build(file: TopologyFile) -> Result<Self> {
        let mut config = EnableConfig::new();
        if let Some(depth) = file.engine.max_bridge_depth {
            config = config.with_max_bridge_depth(depth);
        }
        if let Some(ttl) = file.engine.capability_ttl {
            config = config.with_capability_ttl(ttl);
        }

        let bus = SimBus::new();
        let mut table = DeviceTable::new();
        let mut ids: BTreeMap<String, DeviceId> = BTreeMap::new();
        let mut names = Vec::with_capacity(file.devices.len());

        for def in &file.devices {
            let address: PciAddress = def
                .address
                .parse()
                .with_context(|| format!("device {:?}: address {:?}", def.name, def.address))?;
            if table.find(address).is_some() {
                bail!("device {:?}: address {address} used twice", def.name);
            }

            bus.add_function(address, sim_function(def));
            let dev = pci_device(address, def)
                .with_context(|| format!("device {:?}", def.name))?;
            let id = table
                .insert(dev)
                .ok_or_else(|| anyhow!("device {:?}: device table full", def.name))?;
            if ids.insert(def.name.clone(), id).is_some() {
                bail!("device name {:?} used twice", def.name);
            }
            names.push(def.name.clone());
        }

        // Parents may be declared after their children.
        for def in &file.devices {
            if let Some(parent) = &def.parent {
                let parent_id = *ids
                    .get(parent)
                    .ok_or_else(|| anyhow!("device {:?}: unknown parent {parent:?}", def.name))?;
                table.set_parent(ids[&def.name], Some(parent_id));
            }
        }

        let steps = file
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let device = *ids
                    .get(&step.device)
                    .ok_or_else(|| anyhow!("step {}: unknown device {:?}", i + 1, step.device))?;
                Ok(Step {
                    op: step.op,
                    device,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            enabler: PciEnabler::new(table, bus, SimPower::new()).with_config(config),
            steps,
            names,
        })
    }

    /// Returns the name a device was declared with.
    pub fn name(&self, id: DeviceId) -> &str {
        self.names.get(id.index()).map_or("?", String::as_str)
    }
}

fn sim_function(def: &DeviceDef) -> SimFunction {
    let mut func = SimFunction::new(def.vendor, def.device_id)
        .with_command(def.command)
        .with_interrupt_pin(def.interrupt_pin);
    if def.bridge {
        func = func.with_header_type(0x01);
    }
    if def.msi {
        // Message Control: 64-bit capable, MSI Enable set.
        func = func.with_capability(regs::CAP_ID_MSI, MSI_CAP_OFFSET, &[0x81, 0x00]);
    }
    if def.msix {
        // Message Control: 8 vectors, MSI-X Enable set.
        func = func.with_capability(regs::CAP_ID_MSIX, MSIX_CAP_OFFSET, &[0x07, 0x80]);
    }
    func
}

fn pci_device(address: PciAddress, def: &DeviceDef) -> Result<PciDevice> {
    let mut dev = PciDevice::new(address);
    if def.bridge {
        dev = dev.bridge();
    }
    for res_def in &def.resources {
        let index = res_def.index.resolve()?;
        let mut res = match res_def.kind {
            KindDef::Mem => Resource::memory(res_def.base, res_def.size),
            KindDef::Io => Resource::io(res_def.base, res_def.size),
        };
        if res_def.unset {
            res = res.unset();
        }
        if res_def.claimed {
            res = res.claimed(0);
        }
        if res_def.rom_enabled {
            if !index.is_rom() {
                bail!("{index}: rom_enabled only applies to the ROM slot");
            }
            res = res.with_rom_enabled(true);
        }
        dev = dev.with_resource(index, res);
    }
    Ok(dev)
}
