// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Rule
//!
//! What to do with each IRQ and kernel thread, expressed as data. A rule is
//! an ordered list of clauses; the first clause whose matchers all hold
//! decides the action for an entry. Entries no clause matches are left
//! alone (or parked, see `Flags::irq_parking`).
//!
//! In a machines file:
//!
//!```toml
//! [[machine.rule]]
//! matches = [{ driver = "mlx5_core" }, { type = "irq" }]
//! action = { pin_to_cpuset = { cpuset = "irq_mlx_safe" } }
//!
//! [[machine.rule]]
//! matches = [{ kind = "rcuc" }]
//! action = { set_priority = { fifo = 30 } }
//!```

use rtconf_utils::Cpumask;
use serde::Deserialize;
use serde::Serialize;

use crate::inventory::Interrupt;
use crate::inventory::Inventory;
use crate::inventory::KernelThread;
use crate::inventory::KthreadKind;
use crate::inventory::SchedPolicy;
use crate::Error;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Irq,
    Thread,
}

/// One inventory entry as seen by the rule.
#[derive(Debug, Clone, Copy)]
pub enum Entry<'a> {
    Irq(&'a Interrupt),
    Thread(&'a KernelThread),
}

impl Entry<'_> {
    fn irq_id(&self) -> Option<u32> {
        match self {
            Entry::Irq(irq) => Some(irq.id),
            Entry::Thread(t) => t.irq,
        }
    }
}

/// A predicate on an entry. Thread matchers never hold for an IRQ. Device
/// matchers on a thread look through the IRQ it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    Type(EntryType),
    NamePrefix(String),
    NameContains(String),
    Kind(KthreadKind),
    Irq(u32),
    Driver(String),
    /// The index-th IRQ of all devices bound to `driver`, ordered by bus
    /// address. Picks one of several identical boards.
    DriverIndex { driver: String, index: usize },
    PciAddress(String),
    IfacePrefix(String),
    LabelContains(String),
}

impl Matcher {
    pub fn matches(&self, entry: Entry<'_>, inv: &Inventory) -> bool {
        let device = || entry.irq_id().and_then(|irq| inv.device_of_irq(irq));
        match self {
            Matcher::Type(ty) => matches!(
                (ty, entry),
                (EntryType::Irq, Entry::Irq(_)) | (EntryType::Thread, Entry::Thread(_))
            ),
            Matcher::NamePrefix(prefix) => match entry {
                Entry::Thread(t) => t.name.starts_with(prefix.as_str()),
                Entry::Irq(_) => false,
            },
            Matcher::NameContains(needle) => match entry {
                Entry::Thread(t) => t.name.contains(needle.as_str()),
                Entry::Irq(_) => false,
            },
            Matcher::Kind(kind) => match entry {
                Entry::Thread(t) => t.kind == *kind,
                Entry::Irq(_) => false,
            },
            Matcher::Irq(id) => entry.irq_id() == Some(*id),
            Matcher::Driver(driver) => device()
                .and_then(|dev| dev.driver.as_deref())
                .map_or(false, |d| d == driver),
            Matcher::DriverIndex { driver, index } => entry
                .irq_id()
                .map_or(false, |irq| inv.irqs_of_driver(driver).get(*index) == Some(&irq)),
            Matcher::PciAddress(address) => device().map_or(false, |dev| dev.address == *address),
            Matcher::IfacePrefix(prefix) => device().map_or(false, |dev| {
                dev.net_ifaces.iter().any(|i| i.starts_with(prefix.as_str()))
            }),
            Matcher::LabelContains(needle) => entry
                .irq_id()
                .and_then(|irq| inv.irqs.get(&irq))
                .map_or(false, |irq| irq.label.contains(needle.as_str())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// IRQ: route to the cpuset's CPUs, and set the priority of its
    /// handler thread. Thread: move into the cpuset and pin to its CPUs.
    PinToCpuset {
        cpuset: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<SchedPolicy>,
    },
    SetAffinity {
        cpus: Cpumask,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<SchedPolicy>,
    },
    SetPriority(SchedPolicy),
    NoOp,
}

impl Action {
    pub fn pin(cpuset: &str) -> Action {
        Action::PinToCpuset {
            cpuset: cpuset.to_string(),
            priority: None,
        }
    }

    pub fn pin_with_priority(cpuset: &str, priority: SchedPolicy) -> Action {
        Action::PinToCpuset {
            cpuset: cpuset.to_string(),
            priority: Some(priority),
        }
    }

    pub fn cpuset(&self) -> Option<&str> {
        match self {
            Action::PinToCpuset { cpuset, .. } => Some(cpuset),
            _ => None,
        }
    }

    pub fn priority(&self) -> Option<SchedPolicy> {
        match self {
            Action::PinToCpuset { priority, .. } | Action::SetAffinity { priority, .. } => *priority,
            Action::SetPriority(policy) => Some(*policy),
            Action::NoOp => None,
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(policy) = self.priority() {
            match policy {
                SchedPolicy::Fifo(p) | SchedPolicy::RoundRobin(p) if !(1..=99).contains(&p) => {
                    return Err(format!("realtime priority {p} outside 1..=99"));
                }
                SchedPolicy::Fifo(_) | SchedPolicy::RoundRobin(_) | SchedPolicy::Other => {}
                other => {
                    return Err(format!("scheduling policy {other} cannot be requested"));
                }
            }
        }
        match self {
            Action::SetAffinity { cpus, .. } if cpus.is_empty() => {
                Err("set_affinity with an empty CPU set".to_string())
            }
            Action::PinToCpuset { cpuset, .. } if cpuset.is_empty() => {
                Err("pin_to_cpuset without a cpuset name".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleClause {
    /// All must hold. An empty list matches every entry.
    #[serde(default)]
    pub matches: Vec<Matcher>,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rule {
    clauses: Vec<RuleClause>,
}

impl Rule {
    pub fn new() -> Rule {
        Rule::default()
    }

    /// Append a clause. Earlier clauses take precedence.
    pub fn when(mut self, matches: Vec<Matcher>, action: Action) -> Rule {
        self.clauses.push(RuleClause {
            matches,
            action,
            comment: None,
        });
        self
    }

    pub fn clauses(&self) -> &[RuleClause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The action of the first clause matching `entry`, if any. Pure: only
    /// the entry, the inventory snapshot and the clauses are consulted.
    pub fn evaluate(&self, entry: Entry<'_>, inv: &Inventory) -> Option<&Action> {
        self.clauses
            .iter()
            .find(|c| c.matches.iter().all(|m| m.matches(entry, inv)))
            .map(|c| &c.action)
    }

    pub fn referenced_cpusets(&self) -> impl Iterator<Item = &str> {
        self.clauses.iter().filter_map(|c| c.action.cpuset())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (i, clause) in self.clauses.iter().enumerate() {
            clause
                .action
                .validate()
                .map_err(|e| Error::InvalidSpec(format!("rule clause {i}: {e}")))?;
        }
        Ok(())
    }
}
