// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use rtconf_utils::read_file_hex;
use rtconf_utils::read_file_string;
use rtconf_utils::read_from_file;
use rtconf_utils::Cpumask;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

const PCI_CLASS_BRIDGE_PCI: u32 = 0x0604;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrqKind {
    None,
    Legacy,
    Msi,
}

/// One PCI function as sysfs shows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Bus address, e.g. "0000:3b:00.0".
    pub address: String,
    pub vendor: u32,
    pub device: u32,
    /// Class code without the programming interface byte.
    pub class: u32,
    pub name: String,
    pub driver: Option<String>,
    pub numa_node: Option<usize>,
    pub local_cpus: Cpumask,
    pub irq_kind: IrqKind,
    pub irqs: Vec<u32>,
    pub net_ifaces: Vec<String>,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.address, self.name)?;
        if let Some(driver) = &self.driver {
            write!(f, " ({driver})")?;
        }
        for iface in self.net_ifaces.iter() {
            write!(f, " {iface}")?;
        }
        Ok(())
    }
}

fn class_name(class: u32) -> &'static str {
    match class {
        0x0100 => "SCSI storage controller",
        0x0104 => "RAID bus controller",
        0x0106 => "SATA controller",
        0x0108 => "Non-Volatile memory controller",
        0x0200 => "Ethernet controller",
        0x0207 => "Infiniband controller",
        0x0280 => "Network controller",
        0x0300 => "VGA compatible controller",
        0x0302 => "3D controller",
        0x0403 => "Audio device",
        0x0600 => "Host bridge",
        0x0601 => "ISA bridge",
        0x0604 => "PCI bridge",
        0x0880 => "System peripheral",
        0x0c03 => "USB controller",
        0x0c05 => "SMBus",
        0x1180 => "Signal processing controller",
        _ => match class >> 8 {
            0x01 => "Mass storage controller",
            0x02 => "Network controller",
            0x03 => "Display controller",
            0x04 => "Multimedia controller",
            0x05 => "Memory controller",
            0x06 => "Bridge",
            0x08 => "System peripheral",
            0x0c => "Serial bus controller",
            0x11 => "Signal processing controller",
            0x12 => "Processing accelerator",
            _ => "Device",
        },
    }
}

fn list_dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => vec![],
    };
    names.sort();
    names
}

fn read_device(path: &Path, address: &str) -> Result<Option<Device>> {
    let class = read_file_hex(&path.join("class"))? >> 8;
    if class == PCI_CLASS_BRIDGE_PCI {
        return Ok(None);
    }
    let vendor = read_file_hex(&path.join("vendor"))?;
    let device = read_file_hex(&path.join("device"))?;

    let driver = fs::read_link(path.join("driver"))
        .ok()
        .and_then(|link| link.file_name().map(|n| n.to_string_lossy().into_owned()));

    // -1 without NUMA.
    let numa_node = read_from_file::<i64>(&path.join("numa_node"))
        .ok()
        .and_then(|n| usize::try_from(n).ok());

    let local_cpus = match read_file_string(&path.join("local_cpulist")) {
        Ok(list) => Cpumask::from_cpulist(&list)?,
        Err(_) => Cpumask::new(),
    };

    let msi_dir = path.join("msi_irqs");
    let (irq_kind, irqs) = if msi_dir.is_dir() {
        let mut irqs: Vec<u32> = list_dir_names(&msi_dir)
            .iter()
            .filter_map(|n| n.parse().ok())
            .collect();
        irqs.sort_unstable();
        (IrqKind::Msi, irqs)
    } else {
        match read_from_file::<u32>(&path.join("irq")).ok() {
            Some(irq) if irq != 0 => (IrqKind::Legacy, vec![irq]),
            _ => (IrqKind::None, vec![]),
        }
    };

    Ok(Some(Device {
        address: address.to_string(),
        vendor,
        device,
        class,
        name: format!("{} [{:04x}:{:04x}]", class_name(class), vendor, device),
        driver,
        numa_node,
        local_cpus,
        irq_kind,
        irqs,
        net_ifaces: list_dir_names(&path.join("net")),
    }))
}

/// Read every PCI function under `<sys>/bus/pci/devices`, keyed by address.
pub fn read_devices(sys: &Path) -> Result<BTreeMap<String, Device>> {
    let root = sys.join("bus/pci/devices");
    let entries = fs::read_dir(&root).with_context(|| format!("Failed to list {root:?}"))?;

    let mut devices = BTreeMap::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let address = entry.file_name().to_string_lossy().into_owned();
        match read_device(&entry.path(), &address) {
            Ok(Some(dev)) => {
                devices.insert(address, dev);
            }
            Ok(None) => debug!("{}: skipping bridge", address),
            Err(e) => debug!("{}: skipping unreadable device: {:#}", address, e),
        }
    }
    Ok(devices)
}

/// Map each IRQ to the device that owns it. A legacy line shared by
/// several functions goes to the highest bus address.
pub fn irq_owners(devices: &BTreeMap<String, Device>) -> BTreeMap<u32, String> {
    let mut owners = BTreeMap::new();
    // Ascending address order, so later inserts win.
    for dev in devices.values() {
        for irq in dev.irqs.iter() {
            owners.insert(*irq, dev.address.clone());
        }
    }
    owners
}
