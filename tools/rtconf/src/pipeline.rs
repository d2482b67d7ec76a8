// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! One apply pass: inventory, cpusets, rules, host knobs, strictly in that
//! order and on a single thread.

use tracing::info;

use crate::cpuset::CgroupCpusetFs;
use crate::cpuset::CpusetFs;
use crate::cpuset::CpusetManager;
use crate::engine::RuleEngine;
use crate::kernel::KernelOps;
use crate::kernel::SysKernel;
use crate::model::ConfigurationModel;
use crate::report::ApplyReport;
use crate::tuning::SysTuner;
use crate::tuning::Tuning;
use crate::HostRoots;
use crate::Inventory;
use crate::Result;

/// Everything an apply pass reads from or writes to.
pub trait System {
    fn inventory(&self) -> Result<Inventory>;
    fn cpuset_fs(&self) -> &dyn CpusetFs;
    fn kernel(&self) -> &dyn KernelOps;
    fn tuner(&self) -> &dyn Tuning;
}

/// The running host.
#[derive(Debug)]
pub struct LiveSystem {
    roots: HostRoots,
    cpusets: CgroupCpusetFs,
    kernel: SysKernel,
    tuner: SysTuner,
}

impl LiveSystem {
    pub fn new(roots: &HostRoots) -> Result<Self> {
        Ok(Self {
            roots: roots.clone(),
            cpusets: CgroupCpusetFs::detect(roots)?,
            kernel: SysKernel::new(roots),
            tuner: SysTuner::new(roots),
        })
    }
}

impl System for LiveSystem {
    fn inventory(&self) -> Result<Inventory> {
        Inventory::build(&self.roots)
    }

    fn cpuset_fs(&self) -> &dyn CpusetFs {
        &self.cpusets
    }

    fn kernel(&self) -> &dyn KernelOps {
        &self.kernel
    }

    fn tuner(&self) -> &dyn Tuning {
        &self.tuner
    }
}

/// Apply `model` to `system`. Fatal errors abort before any further
/// mutation; per-entry failures end up as warnings in the report.
pub fn apply(model: &ConfigurationModel, system: &dyn System) -> Result<ApplyReport> {
    model.check_references()?;
    let mut inv = system.inventory()?;
    info!(
        "inventory: {} CPUs, {} IRQs, {} kernel threads",
        inv.cpus.weight(),
        inv.irqs.len(),
        inv.kthreads.len()
    );

    let flags = model.flags();
    let mut report = ApplyReport::default();

    if flags.hyperthreading_softdisable {
        let smt = system.tuner().disable_smt_siblings();
        let rebuild = smt.changed > 0;
        report.merge(smt);
        if rebuild {
            inv = system.inventory()?;
            info!("CPUs online after SMT disable: {}", inv.cpus);
        }
    }

    if flags.rt_networking {
        report.merge(system.tuner().rt_networking());
    }

    let mut cpusets = CpusetManager::new(system.cpuset_fs());
    report.merge(cpusets.remove(model.removals()));
    report.merge(cpusets.reconcile(model.cpusets(), &inv));

    report.merge(RuleEngine::new(system.kernel(), &cpusets).apply(model, &inv));

    if flags.max_cpu_performance {
        report.merge(system.tuner().max_cpu_performance());
    }

    info!("{}", report.to_string().trim_end());
    Ok(report)
}

/// The privileged side of a fork check: prove the pass could run, touch
/// nothing.
pub fn forkcheck() -> ApplyReport {
    info!("fork check: privileged side reached, nothing applied");
    ApplyReport::default()
}
