// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # IRQ/Kthread Rule Engine
//!
//! Evaluates the rule once per IRQ and kernel thread, folds the result
//! (and IRQ parking) into one desired state per entry, then converges each
//! entry: read live state, write only what differs, read back to confirm.
//! A failing entry yields one warning and the walk moves on.

use std::collections::BTreeMap;

use rtconf_utils::Cpumask;
use tracing::debug;
use tracing::info;

use crate::cpuset::CpusetManager;
use crate::inventory::Interrupt;
use crate::inventory::KernelThread;
use crate::inventory::SchedPolicy;
use crate::kernel::task_error;
use crate::kernel::KernelOps;
use crate::model::ConfigurationModel;
use crate::report::ApplyReport;
use crate::report::EntryId;
use crate::rule::Action;
use crate::rule::Entry;
use crate::Error;
use crate::Inventory;
use crate::Result;

/// Desired state of one kernel thread.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ThreadPlan {
    cpuset: Option<String>,
    affinity: Option<Cpumask>,
    policy: Option<SchedPolicy>,
}

pub struct RuleEngine<'a> {
    kernel: &'a dyn KernelOps,
    cpusets: &'a CpusetManager<'a>,
}

impl<'a> RuleEngine<'a> {
    pub fn new(kernel: &'a dyn KernelOps, cpusets: &'a CpusetManager<'a>) -> Self {
        Self { kernel, cpusets }
    }

    fn cpuset_cpus(&self, name: &str) -> Result<Cpumask> {
        self.cpusets
            .cpus_of(name)
            .cloned()
            .ok_or_else(|| Error::NoSuchCpuset(name.to_string()))
    }

    fn check_cpus(entry: &EntryId, cpus: &Cpumask, inv: &Inventory) -> Result<()> {
        let missing = cpus.and_not(&inv.cpus);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::UnknownCpu {
                cpuset: entry.to_string(),
                cpus: missing.to_cpulist(),
            })
        }
    }

    /// Work out the affinity an IRQ should have, and the policy its handler
    /// thread should run at. None leaves the IRQ alone.
    fn plan_irq(
        &self,
        irq: &Interrupt,
        model: &ConfigurationModel,
        parking: Option<&Cpumask>,
        inv: &Inventory,
    ) -> Result<Option<(Cpumask, Option<SchedPolicy>)>> {
        let entry = EntryId::Irq(irq.id);
        match model.rule().evaluate(Entry::Irq(irq), inv) {
            Some(Action::PinToCpuset { cpuset, priority }) => {
                Ok(Some((self.cpuset_cpus(cpuset)?, *priority)))
            }
            Some(Action::SetAffinity { cpus, priority }) => {
                Self::check_cpus(&entry, cpus, inv)?;
                Ok(Some((cpus.clone(), *priority)))
            }
            Some(Action::SetPriority(policy)) => {
                if irq.thread.is_none() {
                    return Err(Error::Kernel {
                        what: entry.to_string(),
                        reason: "priority requested for an IRQ without a handler thread"
                            .to_string(),
                    });
                }
                Ok(Some((irq.affinity.clone(), Some(*policy))))
            }
            Some(Action::NoOp) => Ok(None),
            None => Ok(parking.map(|cpus| (inv.numa_local(irq.id, cpus), None))),
        }
    }

    fn plan_thread(
        &self,
        thread: &KernelThread,
        model: &ConfigurationModel,
        inv: &Inventory,
    ) -> Result<ThreadPlan> {
        let entry = EntryId::Thread(thread.pid);
        Ok(match model.rule().evaluate(Entry::Thread(thread), inv) {
            Some(Action::PinToCpuset { cpuset, priority }) => ThreadPlan {
                affinity: Some(self.cpuset_cpus(cpuset)?),
                cpuset: Some(cpuset.clone()),
                policy: *priority,
            },
            Some(Action::SetAffinity { cpus, priority }) => {
                Self::check_cpus(&entry, cpus, inv)?;
                ThreadPlan {
                    affinity: Some(cpus.clone()),
                    policy: *priority,
                    ..Default::default()
                }
            }
            Some(Action::SetPriority(policy)) => ThreadPlan {
                policy: Some(*policy),
                ..Default::default()
            },
            Some(Action::NoOp) | None => ThreadPlan::default(),
        })
    }

    /// Converge one IRQ. Returns whether anything was written.
    fn converge_irq(&self, id: u32, desired: &Cpumask) -> Result<bool> {
        let what = format!("irq {id}: affinity");
        let live = self.kernel.irq_affinity(id).map_err(|e| Error::kernel(&what, &e))?;
        if live == *desired {
            return Ok(false);
        }
        debug!("irq {}: {} -> {}", id, live, desired);
        self.kernel
            .set_irq_affinity(id, desired)
            .map_err(|e| Error::kernel(&what, &e))?;
        let after = self.kernel.irq_affinity(id).map_err(|e| Error::kernel(&what, &e))?;
        if after != *desired {
            return Err(Error::Kernel {
                what,
                reason: format!("reads back as {after} after writing {desired}"),
            });
        }
        Ok(true)
    }

    /// Converge one thread, stopping at the first failure. Returns the
    /// number of writes issued.
    fn converge_thread(&self, pid: i32, plan: &ThreadPlan) -> Result<usize> {
        let mut writes = 0;

        if let Some(cpuset) = &plan.cpuset {
            if self.cpusets.can_attach_kthreads() {
                if self.cpusets.assign(pid, cpuset)? {
                    writes += 1;
                }
            } else {
                debug!("pid {}: not attaching to {}, pinning only", pid, cpuset);
            }
        }

        if let Some(desired) = &plan.affinity {
            let live = self
                .kernel
                .thread_affinity(pid)
                .map_err(|e| task_error(pid, "read affinity", &e))?;
            if live != *desired {
                self.kernel
                    .set_thread_affinity(pid, desired)
                    .map_err(|e| task_error(pid, "set affinity", &e))?;
                writes += 1;
                let after = self
                    .kernel
                    .thread_affinity(pid)
                    .map_err(|e| task_error(pid, "read affinity", &e))?;
                if after != *desired {
                    return Err(Error::Kernel {
                        what: format!("pid {pid}: affinity"),
                        reason: format!("reads back as {after} after writing {desired}"),
                    });
                }
            }
        }

        if let Some(desired) = plan.policy {
            let live = self
                .kernel
                .thread_policy(pid)
                .map_err(|e| task_error(pid, "read policy", &e))?;
            if live != desired {
                self.kernel
                    .set_thread_policy(pid, desired)
                    .map_err(|e| task_error(pid, "set policy", &e))?;
                writes += 1;
                let after = self
                    .kernel
                    .thread_policy(pid)
                    .map_err(|e| task_error(pid, "read policy", &e))?;
                if after != desired {
                    return Err(Error::Kernel {
                        what: format!("pid {pid}: policy"),
                        reason: format!("reads back as {after} after writing {desired}"),
                    });
                }
            }
        }

        Ok(writes)
    }

    fn tally(report: &mut ApplyReport, entry: EntryId, res: Result<usize>) {
        match res {
            Ok(0) => {
                report.applied += 1;
                report.unchanged += 1;
            }
            Ok(writes) => {
                report.applied += 1;
                report.changed += writes;
            }
            Err(e) => report.warn(entry, e),
        }
    }

    /// Walk every IRQ and kernel thread of `inv` and converge it to what
    /// the model's rule asks for.
    pub fn apply(&self, model: &ConfigurationModel, inv: &Inventory) -> ApplyReport {
        let mut report = ApplyReport::default();
        let parking = model
            .flags()
            .irq_parking
            .then(|| model.parking_cpus(inv));
        if let Some(cpus) = &parking {
            info!("parking unhandled IRQs on CPUs {}", cpus);
        }

        // Handler thread priorities requested through IRQ actions.
        let mut irq_policies: BTreeMap<i32, SchedPolicy> = BTreeMap::new();

        for irq in inv.irqs.values() {
            let entry = EntryId::Irq(irq.id);
            let res = self
                .plan_irq(irq, model, parking.as_ref(), inv)
                .and_then(|plan| match plan {
                    Some((cpus, policy)) => {
                        if let (Some(policy), Some(pid)) = (policy, irq.thread) {
                            irq_policies.insert(pid, policy);
                        }
                        self.converge_irq(irq.id, &cpus).map(usize::from)
                    }
                    None => Ok(0),
                });
            Self::tally(&mut report, entry, res);
        }

        for thread in inv.kthreads.values() {
            let entry = EntryId::Thread(thread.pid);
            let res = self.plan_thread(thread, model, inv).and_then(|mut plan| {
                if plan.policy.is_none() {
                    plan.policy = irq_policies.get(&thread.pid).copied();
                }
                self.converge_thread(thread.pid, &plan)
            });
            Self::tally(&mut report, entry, res);
        }

        info!(
            "rules: {} entries converged, {} writes, {} warnings",
            report.applied,
            report.changed,
            report.warnings.len()
        );
        report
    }
}
