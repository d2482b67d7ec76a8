// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Topology Inventory
//!
//! A snapshot of what the host looks like right now: online CPUs, NUMA
//! nodes, isolated CPUs, PCI devices, IRQs and kernel threads. Built fresh
//! for every apply pass and never mutated; the rule engine re-reads live
//! state before it writes anything.
//!
//!```no_run
//!     use rtconf::HostRoots;
//!     use rtconf::Inventory;
//!     let inv = Inventory::build(&HostRoots::default()).unwrap();
//!     print!("{}", inv);
//!```

mod irq;
mod kthread;
mod pci;

pub use irq::parse_interrupt_labels;
pub use irq::Interrupt;
pub use kthread::KernelThread;
pub use kthread::KthreadKind;
pub use kthread::SchedPolicy;
pub use pci::Device;
pub use pci::IrqKind;

use std::collections::BTreeMap;
use std::fmt;

use rtconf_utils::read_file_string;
use rtconf_utils::Cpumask;
use rtconf_utils::Topology;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::Error;
use crate::HostRoots;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    /// Online CPUs.
    pub cpus: Cpumask,
    /// CPUs of each NUMA node.
    pub nodes: BTreeMap<usize, Cpumask>,
    /// CPUs named by isolcpus= on the kernel command line.
    pub isolated: Cpumask,
    pub devices: BTreeMap<String, Device>,
    pub irqs: BTreeMap<u32, Interrupt>,
    pub kthreads: BTreeMap<i32, KernelThread>,
}

/// Extract the CPU list of isolcpus= from a kernel command line. Flag
/// groups such as "nohz,domain" or "managed_irq" are dropped.
pub fn parse_isolcpus(cmdline: &str) -> Cpumask {
    let mut mask = Cpumask::new();
    for arg in cmdline.split_whitespace() {
        let value = match arg.strip_prefix("isolcpus=") {
            Some(value) => value,
            None => continue,
        };
        for group in value.split(',') {
            if !group.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }
            match Cpumask::from_cpulist(group) {
                Ok(cpus) => mask |= &cpus,
                Err(e) => debug!("ignoring isolcpus group {:?}: {:#}", group, e),
            }
        }
    }
    mask
}

impl Inventory {
    /// Snapshot the host under `roots`.
    pub fn build(roots: &HostRoots) -> Result<Inventory> {
        let topo = Topology::with_sysfs(&roots.sys).map_err(|e| Error::inventory("cpu topology", e))?;
        let nodes = topo
            .nodes()
            .iter()
            .map(|(id, node)| (*id, node.span().clone()))
            .collect();

        let isolated = match read_file_string(&roots.proc.join("cmdline")) {
            Ok(cmdline) => parse_isolcpus(&cmdline),
            Err(_) => Cpumask::new(),
        };

        let devices = pci::read_devices(&roots.sys).map_err(|e| Error::inventory("pci devices", e))?;
        let mut irqs =
            irq::read_interrupts(&roots.proc).map_err(|e| Error::inventory("interrupts", e))?;
        let mut kthreads =
            kthread::read_kthreads(&roots.proc).map_err(|e| Error::inventory("kernel threads", e))?;

        for (irq, address) in pci::irq_owners(&devices) {
            if let Some(entry) = irqs.get_mut(&irq) {
                entry.device = Some(address);
            }
        }
        for thread in kthreads.values_mut() {
            let linked = thread.irq.and_then(|irq| irqs.get_mut(&irq));
            match linked {
                Some(entry) => entry.thread = Some(thread.pid),
                None => thread.irq = None,
            }
        }

        let inv = Inventory {
            cpus: topo.span().clone(),
            nodes,
            isolated,
            devices,
            irqs,
            kthreads,
        };
        debug!(
            "inventory: {} cpus, {} devices, {} irqs, {} kthreads",
            inv.cpus.weight(),
            inv.devices.len(),
            inv.irqs.len(),
            inv.kthreads.len()
        );
        Ok(inv)
    }

    pub fn device_of_irq(&self, irq: u32) -> Option<&Device> {
        let address = self.irqs.get(&irq)?.device.as_ref()?;
        self.devices.get(address)
    }

    /// The device behind a thread, via the IRQ it serves.
    pub fn device_of_thread(&self, thread: &KernelThread) -> Option<&Device> {
        self.device_of_irq(thread.irq?)
    }

    /// IRQs of every device bound to `driver`, ordered by bus address and
    /// then IRQ number.
    pub fn irqs_of_driver(&self, driver: &str) -> Vec<u32> {
        self.devices
            .values()
            .filter(|dev| dev.driver.as_deref() == Some(driver))
            .flat_map(|dev| {
                dev.irqs
                    .iter()
                    .copied()
                    .filter(|irq| self.irqs.contains_key(irq))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn node_ids(&self) -> Vec<usize> {
        self.nodes.keys().copied().collect()
    }

    /// CPUs left for housekeeping: online minus isolated, or all online
    /// CPUs when nothing else is left.
    pub fn housekeeping_cpus(&self) -> Cpumask {
        let cpus = self.cpus.and_not(&self.isolated);
        if cpus.is_empty() {
            self.cpus.clone()
        } else {
            cpus
        }
    }

    /// Narrow `cpus` to the NUMA node of the device behind `irq`, unless
    /// that leaves nothing.
    pub fn numa_local(&self, irq: u32, cpus: &Cpumask) -> Cpumask {
        let node_cpus = self
            .device_of_irq(irq)
            .and_then(|dev| dev.numa_node)
            .and_then(|node| self.nodes.get(&node));
        match node_cpus {
            Some(node_cpus) => {
                let local = cpus.and(node_cpus);
                if local.is_empty() {
                    cpus.clone()
                } else {
                    local
                }
            }
            None => cpus.clone(),
        }
    }
}

impl fmt::Display for Inventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CPUs online: {}  isolated: {}", self.cpus, self.isolated)?;
        for (id, cpus) in self.nodes.iter() {
            writeln!(f, "NUMA node {id}: {cpus}")?;
        }

        writeln!(f, "PCI devices ({}):", self.devices.len())?;
        for dev in self.devices.values() {
            write!(f, "  {dev}")?;
            if !dev.irqs.is_empty() {
                let irqs: Vec<String> = dev.irqs.iter().map(|i| i.to_string()).collect();
                write!(f, "  irqs {:?} {}", dev.irq_kind, irqs.join(","))?;
            }
            writeln!(f)?;
        }

        writeln!(f, "IRQs ({}):", self.irqs.len())?;
        for irq in self.irqs.values() {
            write!(f, "  {:>5}  cpus {:<12} {}", irq.id, irq.affinity.to_string(), irq.label)?;
            if let Some(pid) = irq.thread {
                write!(f, "  [pid {pid}]")?;
            }
            writeln!(f)?;
        }

        writeln!(f, "Kernel threads ({}):", self.kthreads.len())?;
        for t in self.kthreads.values() {
            writeln!(
                f,
                "  {:>7}  {:<24} cpus {:<12} {:<10} cpuset /{}",
                t.pid,
                t.name,
                t.affinity.to_string(),
                t.policy.to_string(),
                t.cpuset.as_deref().unwrap_or("?")
            )?;
        }
        Ok(())
    }
}
