// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use rtconf_utils::read_file_string;
use rtconf_utils::Cpumask;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: u32,
    pub affinity: Cpumask,
    /// Where the interrupt controller actually routes it, when reported.
    pub effective_affinity: Option<Cpumask>,
    /// Trailing columns of /proc/interrupts: chip, hwirq and actions.
    pub label: String,
    /// PCI address of the owning device.
    pub device: Option<String>,
    /// Pid of the irq/<n>-<name> thread for threaded handlers.
    pub thread: Option<i32>,
}

/// Parse the label columns of /proc/interrupts for numbered IRQs.
pub fn parse_interrupt_labels(content: &str) -> BTreeMap<u32, String> {
    let mut lines = content.lines();
    let ncpus = match lines.next() {
        Some(header) => header.split_whitespace().count(),
        None => return BTreeMap::new(),
    };

    let mut labels = BTreeMap::new();
    for line in lines {
        let mut tokens = line.split_whitespace();
        let id = match tokens
            .next()
            .and_then(|t| t.strip_suffix(':'))
            .and_then(|t| t.parse::<u32>().ok())
        {
            Some(id) => id,
            None => continue,
        };
        let rest: Vec<&str> = tokens.collect();
        let counts = rest
            .iter()
            .take(ncpus)
            .take_while(|t| t.parse::<u64>().is_ok())
            .count();
        labels.insert(id, rest[counts..].join(" "));
    }
    labels
}

fn read_interrupt(dir: &Path, id: u32) -> Result<Interrupt> {
    // Old kernels only have the hex mask.
    let affinity = match read_file_string(&dir.join("smp_affinity_list")) {
        Ok(list) => Cpumask::from_cpulist(&list)?,
        Err(_) => Cpumask::from_str(&read_file_string(&dir.join("smp_affinity"))?)?,
    };
    let effective_affinity = match read_file_string(&dir.join("effective_affinity_list")) {
        Ok(list) => Some(Cpumask::from_cpulist(&list)?),
        Err(_) => None,
    };
    Ok(Interrupt {
        id,
        affinity,
        effective_affinity,
        label: String::new(),
        device: None,
        thread: None,
    })
}

/// Read every numbered directory under `<proc>/irq`.
pub fn read_interrupts(proc: &Path) -> Result<BTreeMap<u32, Interrupt>> {
    let root = proc.join("irq");
    let entries = fs::read_dir(&root).with_context(|| format!("Failed to list {root:?}"))?;

    let mut labels = match fs::read_to_string(proc.join("interrupts")) {
        Ok(content) => parse_interrupt_labels(&content),
        Err(e) => {
            debug!("no /proc/interrupts labels: {}", e);
            BTreeMap::new()
        }
    };

    let mut irqs = BTreeMap::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let id = match entry.file_name().to_string_lossy().parse::<u32>() {
            Ok(id) => id,
            Err(_) => continue,
        };
        match read_interrupt(&entry.path(), id) {
            Ok(mut irq) => {
                irq.label = labels.remove(&id).unwrap_or_default();
                irqs.insert(id, irq);
            }
            Err(e) => debug!("irq {}: skipping: {:#}", id, e),
        }
    }
    Ok(irqs)
}
