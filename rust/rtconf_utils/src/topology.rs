// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Topology
//!
//! A read-only model of the host's CPUs, grouped by SMT core and NUMA node:
//!
//! ```text
//!               Topology
//!                  |
//!        o---------o---------o
//!        |                   |
//!      Node 0      ...     Node 1          span 0x00ff / 0xff00
//!        |
//!   o----o----o
//!   |         |
//! Core 0 ... Core 3                        span = SMT siblings
//!   |
//!  Cpu 0, Cpu 4                            online / offline
//! ```
//!
//! Creating Topology
//! -----------------
//!
//!```no_run
//!     use rtconf_utils::Topology;
//!     let top = Topology::new().unwrap();
//!     println!("{} CPUs online", top.span().weight());
//!```
//!
//! Tests and tools working on a copy of sysfs use `Topology::with_sysfs()`.
//! If the host topology changes (hotplug, SMT disabled), build a new
//! Topology.

use crate::misc::read_file_string;
use crate::Cpumask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use sscanf::sscanf;
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Cpu {
    id: usize,
    online: bool,
    core_id: usize,
    node_id: usize,
}

impl Cpu {
    /// Get the ID of this Cpu
    pub fn id(&self) -> usize {
        self.id
    }

    /// Is this CPU online?
    pub fn online(&self) -> bool {
        self.online
    }

    /// ID of the SMT core, which is the lowest sibling's CPU id.
    pub fn core_id(&self) -> usize {
        self.core_id
    }

    pub fn node_id(&self) -> usize {
        self.node_id
    }
}

#[derive(Debug, Clone)]
pub struct Core {
    id: usize,
    span: Cpumask,
}

impl Core {
    /// Get the ID of this Core
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get a Cpumask of all SMT siblings in this Core
    pub fn span(&self) -> &Cpumask {
        &self.span
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    id: usize,
    span: Cpumask,
}

impl Node {
    /// Get the ID of this NUMA node
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get a Cpumask of all CPUs in this NUMA node
    pub fn span(&self) -> &Cpumask {
        &self.span
    }
}

#[derive(Debug)]
pub struct Topology {
    nodes: BTreeMap<usize, Node>,
    cores: BTreeMap<usize, Core>,
    cpus: BTreeMap<usize, Cpu>,
    span: Cpumask,
}

impl Topology {
    /// Build the host Topology from /sys.
    pub fn new() -> Result<Topology> {
        Self::with_sysfs(Path::new("/sys"))
    }

    /// Build a Topology from a sysfs tree mounted at `sysfs`.
    pub fn with_sysfs(sysfs: &Path) -> Result<Topology> {
        let cpu_root = sysfs.join("devices/system/cpu");
        let span = cpus_online(&cpu_root)?;
        let nodes = create_numa_nodes(sysfs, &span)?;

        let mut cpus = BTreeMap::new();
        let mut cores: BTreeMap<usize, Core> = BTreeMap::new();
        for cpu_path in glob_paths(&cpu_root.join("cpu[0-9]*"))? {
            let cpu_str = cpu_path.to_string_lossy();
            let cpu_id = match sscanf!(cpu_str.as_ref(), "{str}/cpu{usize}") {
                Ok((_, id)) => id,
                Err(_) => continue,
            };
            let online = span.test_cpu(cpu_id);

            // Offline CPUs lose their topology directory; they count as a
            // core of their own.
            let siblings = match read_file_string(&cpu_path.join("topology/thread_siblings_list")) {
                Ok(list) if online => Cpumask::from_cpulist(&list)?,
                _ => Cpumask::from_cpus([cpu_id])?,
            };
            let core_id = siblings.iter().next().unwrap_or(cpu_id);

            let node_id = nodes
                .values()
                .find(|n| n.span.test_cpu(cpu_id))
                .map(|n| n.id)
                .unwrap_or(0);

            let core = cores.entry(core_id).or_insert_with(|| Core {
                id: core_id,
                span: Cpumask::new(),
            });
            core.span.set_cpu(cpu_id)?;

            if cpus
                .insert(
                    cpu_id,
                    Cpu {
                        id: cpu_id,
                        online,
                        core_id,
                        node_id,
                    },
                )
                .is_some()
            {
                bail!("Found duplicate CPU ID {}", cpu_id);
            }
        }

        Ok(Topology {
            nodes,
            cores,
            cpus,
            span,
        })
    }

    /// Get the NUMA nodes on the host.
    pub fn nodes(&self) -> &BTreeMap<usize, Node> {
        &self.nodes
    }

    /// Get all SMT cores on the host, keyed by lowest sibling.
    pub fn cores(&self) -> &BTreeMap<usize, Core> {
        &self.cores
    }

    /// Get a map of <CPU ID, Cpu> for all Cpus on the host.
    pub fn cpus(&self) -> &BTreeMap<usize, Cpu> {
        &self.cpus
    }

    /// Get a cpumask of all the online CPUs on the host
    pub fn span(&self) -> &Cpumask {
        &self.span
    }

    /// Online CPUs which are not the first thread of their core. Taking
    /// these offline leaves one hardware thread per core.
    pub fn smt_secondaries(&self) -> Cpumask {
        let mut mask = Cpumask::new();
        for cpu in self.cpus.values() {
            if cpu.online && cpu.core_id != cpu.id {
                // set_cpu() only fails past MAX_CPU_ID, which sysfs never lists.
                let _ = mask.set_cpu(cpu.id);
            }
        }
        mask
    }
}

/**********************************************
 * Helper functions for creating the Topology *
 **********************************************/

fn glob_paths(pattern: &Path) -> Result<Vec<PathBuf>> {
    let pattern = pattern.to_string_lossy();
    let mut paths: Vec<PathBuf> = glob(&pattern)
        .with_context(|| format!("Bad glob pattern {pattern}"))?
        .filter_map(Result::ok)
        .collect();
    paths.sort();
    Ok(paths)
}

fn cpus_online(cpu_root: &Path) -> Result<Cpumask> {
    let path = cpu_root.join("online");
    let online = read_file_string(&path)?;
    Cpumask::from_cpulist(&online).with_context(|| format!("Failed to parse {path:?}"))
}

fn create_numa_nodes(sysfs: &Path, online_mask: &Cpumask) -> Result<BTreeMap<usize, Node>> {
    let mut nodes = BTreeMap::new();

    for numa_path in glob_paths(&sysfs.join("devices/system/node/node[0-9]*"))? {
        let numa_str = numa_path.to_string_lossy();
        let node_id = match sscanf!(numa_str.as_ref(), "{str}/node{usize}") {
            Ok((_, val)) => val,
            Err(_) => {
                bail!("Failed to parse NUMA node ID {}", numa_str);
            }
        };
        let cpulist = read_file_string(&numa_path.join("cpulist")).unwrap_or_default();
        let span = Cpumask::from_cpulist(&cpulist)?;
        nodes.insert(node_id, Node { id: node_id, span });
    }

    // Kernels built without CONFIG_NUMA have no node directory.
    if nodes.is_empty() {
        nodes.insert(
            0,
            Node {
                id: 0,
                span: online_mask.clone(),
            },
        );
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fake_smt_host() -> TempDir {
        // 4 CPUs, 2 cores with 2 threads each, 2 NUMA nodes.
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "devices/system/cpu/online", "0-3\n");
        for (cpu, siblings) in [(0, "0,2"), (1, "1,3"), (2, "0,2"), (3, "1,3")] {
            write(
                root,
                &format!("devices/system/cpu/cpu{cpu}/topology/thread_siblings_list"),
                siblings,
            );
        }
        write(root, "devices/system/node/node0/cpulist", "0,2\n");
        write(root, "devices/system/node/node1/cpulist", "1,3\n");
        tmp
    }

    #[test]
    fn test_smt_host() {
        let tmp = fake_smt_host();
        let top = Topology::with_sysfs(tmp.path()).unwrap();

        assert_eq!(top.span().to_cpulist(), "0-3");
        assert_eq!(top.cores().len(), 2);
        assert_eq!(top.cores()[&1].span().to_cpulist(), "1,3");
        assert_eq!(top.nodes().len(), 2);
        assert_eq!(top.cpus()[&3].node_id(), 1);
        assert_eq!(top.smt_secondaries().to_cpulist(), "2-3");
    }

    #[test]
    fn test_offline_sibling_is_not_secondary() {
        let tmp = fake_smt_host();
        write(tmp.path(), "devices/system/cpu/online", "0-1\n");
        let top = Topology::with_sysfs(tmp.path()).unwrap();

        assert!(!top.cpus()[&2].online());
        assert!(top.smt_secondaries().is_empty());
    }

    #[test]
    fn test_no_numa_directory() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "devices/system/cpu/online", "0-1\n");
        std::fs::create_dir_all(tmp.path().join("devices/system/cpu/cpu0")).unwrap();
        std::fs::create_dir_all(tmp.path().join("devices/system/cpu/cpu1")).unwrap();

        let top = Topology::with_sysfs(tmp.path()).unwrap();
        assert_eq!(top.nodes().len(), 1);
        assert_eq!(top.nodes()[&0].span().to_cpulist(), "0-1");
    }

    #[test]
    fn test_missing_online_file() {
        let tmp = TempDir::new().unwrap();
        assert!(Topology::with_sysfs(tmp.path()).is_err());
    }
}
