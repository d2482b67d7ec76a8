// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Machine identity to `ConfigurationModel`. Models come from builder
//! functions compiled in here and from an operator-authored TOML file:
//!
//!```toml
//! [machines.LAB1]
//! flags = { irq_parking = true, max_cpu_performance = true }
//!
//! [[machines.LAB1.cpusets]]
//! name = "rt0"
//! cpus = "2-3"
//!
//! [[machines.LAB1.rule]]
//! matches = [{ name_prefix = "ksoftirqd" }]
//! action = { pin_to_cpuset = { cpuset = "rt0" } }
//!```
//!
//! A file entry replaces a built-in machine of the same id.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rtconf_utils::Cpumask;
use serde::Deserialize;
use tracing::info;

use crate::inventory::KthreadKind;
use crate::inventory::SchedPolicy;
use crate::model::ConfigurationModel;
use crate::model::CpusetSpec;
use crate::model::Flags;
use crate::rule::Action;
use crate::rule::EntryType;
use crate::rule::Matcher;
use crate::rule::Rule;
use crate::Error;
use crate::Result;

pub const DEFAULT_MACHINES_FILE: &str = "/etc/rtconf/machines.toml";

/// Resolves a machine identity token to the model to apply.
pub trait MachineSelector {
    fn select(&self, id: &str) -> Result<ConfigurationModel>;
}

pub type ModelBuilderFn = fn() -> Result<ConfigurationModel>;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MachinesFile {
    #[serde(default)]
    machines: BTreeMap<String, ConfigurationModel>,
}

#[derive(Debug, Default)]
pub struct MachineTable {
    builtins: BTreeMap<String, ModelBuilderFn>,
    loaded: BTreeMap<String, ConfigurationModel>,
}

impl MachineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding the machines compiled into this crate.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register("UNICORN", unicorn);
        table.register("5", sc5);
        table.register("6", sc6);
        table.register("AORTS", aorts);
        table
    }

    pub fn register(&mut self, id: &str, builder: ModelBuilderFn) {
        self.builtins.insert(id.to_string(), builder);
    }

    /// Add every machine of a TOML document. Returns how many were loaded.
    pub fn load_str(&mut self, text: &str) -> Result<usize> {
        let file: MachinesFile =
            toml::from_str(text).map_err(|e| Error::InvalidSpec(e.to_string()))?;
        let count = file.machines.len();
        for (id, model) in file.machines {
            if self.builtins.contains_key(&id) {
                info!("machine {} from file overrides the built-in", id);
            }
            self.loaded.insert(id, model);
        }
        Ok(count)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::InvalidSpec(format!("{}: {e}", path.display())))?;
        self.load_str(&text)
            .map_err(|e| Error::InvalidSpec(format!("{}: {e}", path.display())))
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .builtins
            .keys()
            .chain(self.loaded.keys())
            .map(|s| s.as_str())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

impl MachineSelector for MachineTable {
    fn select(&self, id: &str) -> Result<ConfigurationModel> {
        if let Some(model) = self.loaded.get(id) {
            return Ok(model.clone());
        }
        match self.builtins.get(id) {
            Some(builder) => builder(),
            None => Err(Error::NoConfigForMachine(id.to_string())),
        }
    }
}

fn cset(name: &str, cpus: &[usize], mems: &[usize]) -> Result<CpusetSpec> {
    let mask = |ids: &[usize]| {
        Cpumask::from_cpus(ids.iter().copied())
            .map_err(|e| Error::InvalidSpec(format!("cpuset {name}: {e:#}")))
    };
    Ok(CpusetSpec::new(name, mask(cpus)?).mems(mask(mems)?).no_irqbalance())
}

fn nth_of_driver(driver: &str, index: usize) -> Vec<Matcher> {
    vec![Matcher::DriverIndex {
        driver: driver.to_string(),
        index,
    }]
}

fn rcu_rules(rule: Rule, offload_cpuset: &str) -> Rule {
    let fifo30 = SchedPolicy::Fifo(30);
    rule.when(vec![Matcher::Kind(KthreadKind::Rcuc)], Action::SetPriority(fifo30))
        .when(
            vec![Matcher::Kind(KthreadKind::Rcub)],
            Action::pin_with_priority(offload_cpuset, fifo30),
        )
        .when(
            vec![Matcher::Kind(KthreadKind::Rcuog)],
            Action::pin_with_priority(offload_cpuset, fifo30),
        )
        .when(
            vec![Matcher::Kind(KthreadKind::Rcuop)],
            Action::pin_with_priority(offload_cpuset, fifo30),
        )
}

fn rtc_flags() -> Flags {
    Flags {
        hyperthreading_softdisable: true,
        rt_networking: true,
        irq_parking: true,
        max_cpu_performance: false,
    }
}

/// Generic realtime host: SMT off, network tuning, IRQs parked.
pub fn unicorn() -> Result<ConfigurationModel> {
    ConfigurationModel::builder().flags(rtc_flags()).build()
}

pub fn sc6() -> Result<ConfigurationModel> {
    ConfigurationModel::builder()
        .flags(Flags {
            max_cpu_performance: true,
            ..rtc_flags()
        })
        .build()
}

/// Five framegrabbers, two ASL boards and a Mellanox NIC on a two-socket
/// host. CPUs 0-5 stay with the system.
pub fn sc5() -> Result<ConfigurationModel> {
    let fifo49 = SchedPolicy::Fifo(49);
    let fifo60 = SchedPolicy::Fifo(60);

    let mut rule = Rule::new();
    for (index, cpuset) in ["o_work", "a_edt", "k_work", "p_edt", "g_work"]
        .iter()
        .enumerate()
    {
        rule = rule.when(
            nth_of_driver("edt", index),
            Action::pin_with_priority(cpuset, fifo49),
        );
    }
    rule = rule
        .when(nth_of_driver("aslenum", 0), Action::pin("v2_asl"))
        .when(nth_of_driver("aslenum", 1), Action::pin("v1_asl"))
        .when(
            vec![
                Matcher::Type(EntryType::Irq),
                Matcher::Driver("mlx5_core".into()),
            ],
            Action::pin("irq_mlx_safe"),
        )
        .when(
            vec![
                Matcher::Type(EntryType::Thread),
                Matcher::NameContains("mlx5".into()),
            ],
            Action::pin_with_priority("kt_mlx_safe", fifo60),
        );
    rule = rcu_rules(rule, "kt_rcu_safe");

    let cpusets = [
        cset("o_work", &[6], &[0])?,
        cset("irq_mlx_safe", &[7], &[0, 1])?,
        cset("kt_mlx_safe", &[8], &[0, 1])?,
        cset("kt_rcu_safe", &[10, 29], &[0, 1])?,
        cset("a_edt", &[11], &[0])?,
        cset("a_utr", &[12], &[0])?,
        cset("a_tcp", &[13], &[0])?,
        cset("v2_asl", &[14], &[1])?,
        cset("v2_tcp", &[15], &[1])?,
        cset("p_edt", &[22], &[1])?,
        cset("p_utr", &[23], &[1])?,
        cset("p_tcp", &[24], &[1])?,
        cset("k_work", &[25], &[1])?,
        cset("g_work", &[26], &[1])?,
        cset("v1_asl", &[27], &[1])?,
        cset("v1_tcp", &[28], &[1])?,
        cset("q_asl", &[30], &[1])?,
        cset("q_tcp", &[31], &[1])?,
        cset("RTmon", &[35], &[1])?,
    ];

    cpusets
        .into_iter()
        .fold(ConfigurationModel::builder(), |b, spec| b.cpuset(spec))
        .flags(Flags {
            max_cpu_performance: true,
            ..rtc_flags()
        })
        .rule(rule)
        .build()
}

/// Adaptive optics host. CPUs are interleaved across the two nodes: even
/// on node 0, odd on node 1. 0-11 stay with the system.
pub fn aorts() -> Result<ConfigurationModel> {
    let fifo49 = SchedPolicy::Fifo(49);
    let fifo60 = SchedPolicy::Fifo(60);

    let mut rule = Rule::new()
        .when(nth_of_driver("edt", 0), Action::pin_with_priority("i_edt", fifo49))
        .when(
            nth_of_driver("dcfi_nsl_module", 0),
            Action::pin_with_priority("fpdp_recv", fifo49),
        )
        .when(nth_of_driver("aslenum", 0), Action::pin("fpdp_recv2"));
    for iface in ["enp2", "enp5"] {
        rule = rule
            .when(
                vec![
                    Matcher::Type(EntryType::Irq),
                    Matcher::IfacePrefix(iface.into()),
                ],
                Action::pin(&format!("irq_{iface}")),
            )
            .when(
                vec![
                    Matcher::Type(EntryType::Thread),
                    Matcher::NameContains(iface.into()),
                ],
                Action::pin_with_priority(&format!("kt_{iface}"), fifo60),
            );
    }
    rule = rcu_rules(rule, "kt_rcu");

    let cpusets = [
        cset("aolrt", &[12, 14, 16, 18, 20], &[0])?,
        cset("dm188_comb", &[22], &[0])?,
        cset("dm188_drv", &[24], &[0])?,
        cset("fpdp_recv", &[26], &[0])?,
        cset("fpdp_recv2", &[28], &[0])?,
        cset("irq_enp2", &[30], &[0])?,
        cset("kt_enp2", &[32], &[0])?,
        cset("irq_enp5", &[34], &[0])?,
        cset("kt_enp5", &[36], &[0])?,
        cset("kt_rcu", &[37, 38], &[0, 1])?,
        cset("i_mvm2", &[15], &[1])?,
        cset("i_mvm", &[17], &[1])?,
        cset("i_mfilt", &[19], &[1])?,
        cset("i_acq_wfs", &[21], &[1])?,
        cset("other_tcp", &[23], &[1])?,
        cset("aollog", &[25, 27, 29, 31], &[0, 1])?,
        cset("i_edt", &[33], &[1])?,
        cset("i_tcp", &[35], &[1])?,
        cset("RTmon", &[39], &[1])?,
    ];

    cpusets
        .into_iter()
        .fold(ConfigurationModel::builder(), |b, spec| b.cpuset(spec))
        .flags(Flags {
            max_cpu_performance: true,
            ..rtc_flags()
        })
        .rule(rule)
        .build()
}
