// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Configuration Model
//!
//! The declarative description of one machine: named cpusets, tuning flags,
//! explicit cpuset removals and the IRQ/kthread `Rule`. Built once per run
//! and never mutated afterwards.
//!
//!```
//!     use rtconf::model::{ConfigurationModel, CpusetSpec, Flags};
//!     use rtconf::rule::{Action, Matcher, Rule};
//!     use rtconf_utils::Cpumask;
//!
//!     let model = ConfigurationModel::builder()
//!         .flags(Flags { irq_parking: true, ..Default::default() })
//!         .cpuset(CpusetSpec::new("rt0", Cpumask::from_cpulist("2-3").unwrap()))
//!         .rule(Rule::new().when(
//!             vec![Matcher::NamePrefix("ksoftirqd".into())],
//!             Action::pin("rt0"),
//!         ))
//!         .build()
//!         .unwrap();
//!     assert!(model.check_references().is_ok());
//!```

use std::collections::BTreeMap;

use rtconf_utils::Cpumask;
use serde::Deserialize;
use serde::Serialize;

use crate::inventory::Inventory;
use crate::rule::Rule;
use crate::Error;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpusetSpec {
    /// Path below the cpuset root, e.g. "rt0" or "rt/rt0".
    pub name: String,
    pub cpus: Cpumask,
    /// Memory nodes in list notation. None means every node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mems: Option<Cpumask>,
    #[serde(default)]
    pub exclusive: bool,
    /// Keep parked IRQs off these CPUs.
    #[serde(default)]
    pub no_irqbalance: bool,
}

impl CpusetSpec {
    pub fn new(name: &str, cpus: Cpumask) -> CpusetSpec {
        CpusetSpec {
            name: name.to_string(),
            cpus,
            mems: None,
            exclusive: false,
            no_irqbalance: false,
        }
    }

    pub fn mems(mut self, nodes: Cpumask) -> CpusetSpec {
        self.mems = Some(nodes);
        self
    }

    pub fn exclusive(mut self) -> CpusetSpec {
        self.exclusive = true;
        self
    }

    pub fn no_irqbalance(mut self) -> CpusetSpec {
        self.no_irqbalance = true;
        self
    }

    /// Parent path for nested cpusets.
    pub fn parent(&self) -> Option<&str> {
        self.name.rsplit_once('/').map(|(parent, _)| parent)
    }
}

/// Validate a cpuset path: non-empty '/'-separated segments, none of them
/// "." or "..", no leading or trailing '/'.
pub fn check_cpuset_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == ".." || seg.contains('\0'));
    if bad {
        return Err(Error::InvalidSpec(format!("invalid cpuset name {name:?}")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Flags {
    /// Performance governor, no deep C-states, quieter kernel housekeeping.
    pub max_cpu_performance: bool,
    /// Low latency network sysctls.
    pub rt_networking: bool,
    /// Move every IRQ the rule does not handle onto the system CPUs.
    pub irq_parking: bool,
    /// Take the secondary SMT thread of every core offline.
    pub hyperthreading_softdisable: bool,
}

/// Serialized shape of a model, validated into `ConfigurationModel`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelData {
    #[serde(default)]
    flags: Flags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    system_cpus: Option<Cpumask>,
    #[serde(default)]
    cpusets: Vec<CpusetSpec>,
    #[serde(default)]
    remove_cpusets: Vec<String>,
    #[serde(default)]
    rule: Rule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ModelData", into = "ModelData")]
pub struct ConfigurationModel {
    cpusets: BTreeMap<String, CpusetSpec>,
    flags: Flags,
    system_cpus: Option<Cpumask>,
    remove_cpusets: Vec<String>,
    rule: Rule,
}

impl TryFrom<ModelData> for ConfigurationModel {
    type Error = Error;

    fn try_from(data: ModelData) -> Result<Self> {
        let mut builder = ConfigurationModel::builder()
            .flags(data.flags)
            .rule(data.rule);
        if let Some(cpus) = data.system_cpus {
            builder = builder.system_cpus(cpus);
        }
        for spec in data.cpusets {
            builder = builder.cpuset(spec);
        }
        for name in data.remove_cpusets {
            builder = builder.remove_cpuset(&name);
        }
        builder.build()
    }
}

impl From<ConfigurationModel> for ModelData {
    fn from(model: ConfigurationModel) -> Self {
        ModelData {
            flags: model.flags,
            system_cpus: model.system_cpus,
            cpusets: model.cpusets.into_values().collect(),
            remove_cpusets: model.remove_cpusets,
            rule: model.rule,
        }
    }
}

#[derive(Debug, Default)]
pub struct ModelBuilder {
    flags: Flags,
    system_cpus: Option<Cpumask>,
    cpusets: Vec<CpusetSpec>,
    remove_cpusets: Vec<String>,
    rule: Rule,
}

impl ModelBuilder {
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Override the CPUs parked IRQs go to.
    pub fn system_cpus(mut self, cpus: Cpumask) -> Self {
        self.system_cpus = Some(cpus);
        self
    }

    pub fn cpuset(mut self, spec: CpusetSpec) -> Self {
        self.cpusets.push(spec);
        self
    }

    /// Delete this cpuset from the host if it exists.
    pub fn remove_cpuset(mut self, name: &str) -> Self {
        self.remove_cpusets.push(name.to_string());
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rule = rule;
        self
    }

    pub fn build(self) -> Result<ConfigurationModel> {
        let mut cpusets = BTreeMap::new();
        for spec in self.cpusets {
            check_cpuset_name(&spec.name)?;
            if spec.cpus.is_empty() {
                return Err(Error::InvalidSpec(format!(
                    "cpuset {} has no CPUs",
                    spec.name
                )));
            }
            if matches!(&spec.mems, Some(mems) if mems.is_empty()) {
                return Err(Error::InvalidSpec(format!(
                    "cpuset {} has an empty memory node list",
                    spec.name
                )));
            }
            if let Some(dup) = cpusets.insert(spec.name.clone(), spec) {
                return Err(Error::InvalidSpec(format!(
                    "cpuset {} declared twice",
                    dup.name
                )));
            }
        }

        for spec in cpusets.values() {
            if let Some(parent) = spec.parent() {
                match cpusets.get(parent) {
                    Some(p) if spec.cpus.is_subset(&p.cpus) => {}
                    Some(_) => {
                        return Err(Error::InvalidSpec(format!(
                            "cpuset {} has CPUs outside its parent {}",
                            spec.name, parent
                        )));
                    }
                    None => {
                        return Err(Error::InvalidSpec(format!(
                            "cpuset {} has undeclared parent {}",
                            spec.name, parent
                        )));
                    }
                }
            }
        }

        for name in self.remove_cpusets.iter() {
            check_cpuset_name(name)?;
            let prefix = format!("{name}/");
            if cpusets.contains_key(name) || cpusets.keys().any(|n| n.starts_with(&prefix)) {
                return Err(Error::InvalidSpec(format!(
                    "cpuset {name} is both declared and removed"
                )));
            }
        }

        if matches!(&self.system_cpus, Some(cpus) if cpus.is_empty()) {
            return Err(Error::InvalidSpec("system_cpus is empty".to_string()));
        }

        self.rule.validate()?;

        Ok(ConfigurationModel {
            cpusets,
            flags: self.flags,
            system_cpus: self.system_cpus,
            remove_cpusets: self.remove_cpusets,
            rule: self.rule,
        })
    }
}

impl ConfigurationModel {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    /// Declared cpusets, ordered by name so parents precede children.
    pub fn cpusets(&self) -> impl Iterator<Item = &CpusetSpec> {
        self.cpusets.values()
    }

    pub fn cpuset(&self, name: &str) -> Option<&CpusetSpec> {
        self.cpusets.get(name)
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn removals(&self) -> &[String] {
        &self.remove_cpusets
    }

    /// Every cpuset named by a rule action must be declared here.
    pub fn check_references(&self) -> Result<()> {
        for name in self.rule.referenced_cpusets() {
            if !self.cpusets.contains_key(name) {
                return Err(Error::InvalidSpec(format!(
                    "rule references undeclared cpuset {name}"
                )));
            }
        }
        Ok(())
    }

    /// Where parked IRQs go: the explicit system CPUs or the host's
    /// housekeeping CPUs, minus CPUs of no_irqbalance cpusets unless that
    /// leaves nothing.
    pub fn parking_cpus(&self, inv: &Inventory) -> Cpumask {
        let base = match &self.system_cpus {
            Some(cpus) => cpus.and(&inv.cpus),
            None => inv.housekeeping_cpus(),
        };
        let mut banned = Cpumask::new();
        for spec in self.cpusets.values().filter(|s| s.no_irqbalance) {
            banned |= &spec.cpus;
        }
        let cpus = base.and_not(&banned);
        if cpus.is_empty() {
            base
        } else {
            cpus
        }
    }
}
