// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! An in-memory host for driving whole apply passes.

#![allow(dead_code)]

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io;

use rtconf::cpuset::CpusetFs;
use rtconf::cpuset::LiveCpuset;
use rtconf::inventory::Interrupt;
use rtconf::inventory::KernelThread;
use rtconf::inventory::KthreadKind;
use rtconf::inventory::SchedPolicy;
use rtconf::kernel::KernelOps;
use rtconf::pipeline::System;
use rtconf::tuning::Tuning;
use rtconf::ApplyReport;
use rtconf::Inventory;
use rtconf::Result;
use rtconf_utils::Cpumask;

/// Initialize tracing from `RUST_LOG`. Safe to call from every test.
pub fn setup_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn mask(list: &str) -> Cpumask {
    Cpumask::from_cpulist(list).unwrap()
}

fn esrch() -> io::Error {
    io::Error::from_raw_os_error(libc::ESRCH)
}

/// A host whose kernel state lives in maps. Every mutating call counts as
/// one write.
pub struct FakeHost {
    pub inventory: Inventory,
    pub cpusets: RefCell<BTreeMap<String, LiveCpuset>>,
    /// pid -> cpuset, absent means the root.
    pub members: RefCell<BTreeMap<i32, String>>,
    pub irq_affinity: RefCell<BTreeMap<u32, Cpumask>>,
    pub thread_affinity: RefCell<BTreeMap<i32, Cpumask>>,
    pub policies: RefCell<BTreeMap<i32, SchedPolicy>>,
    /// Threads that exit between inventory and convergence.
    pub vanished: RefCell<BTreeSet<i32>>,
    pub writes: Cell<usize>,
    pub inventory_reads: Cell<usize>,
    pub unified: bool,
}

impl FakeHost {
    /// `cpus` online on a single NUMA node.
    pub fn new(cpus: &str) -> Self {
        let mut inventory = Inventory {
            cpus: mask(cpus),
            ..Default::default()
        };
        inventory.nodes.insert(0, mask(cpus));
        Self {
            inventory,
            cpusets: RefCell::new(BTreeMap::new()),
            members: RefCell::new(BTreeMap::new()),
            irq_affinity: RefCell::new(BTreeMap::new()),
            thread_affinity: RefCell::new(BTreeMap::new()),
            policies: RefCell::new(BTreeMap::new()),
            vanished: RefCell::new(BTreeSet::new()),
            writes: Cell::new(0),
            inventory_reads: Cell::new(0),
            unified: false,
        }
    }

    pub fn thread(mut self, pid: i32, name: &str, affinity: &str) -> Self {
        let thread = KernelThread {
            pid,
            name: name.to_string(),
            kind: KthreadKind::from_name(name),
            affinity: mask(affinity),
            policy: SchedPolicy::Other,
            cpuset: Some(String::new()),
            irq: KernelThread::irq_from_name(name),
        };
        self.thread_affinity.get_mut().insert(pid, mask(affinity));
        self.policies.get_mut().insert(pid, SchedPolicy::Other);
        self.inventory.kthreads.insert(pid, thread);
        self
    }

    pub fn irq(mut self, id: u32, label: &str, affinity: &str) -> Self {
        let thread = self
            .inventory
            .kthreads
            .values()
            .find(|t| t.irq == Some(id))
            .map(|t| t.pid);
        let irq = Interrupt {
            id,
            affinity: mask(affinity),
            effective_affinity: None,
            label: label.to_string(),
            device: None,
            thread,
        };
        self.irq_affinity.get_mut().insert(id, mask(affinity));
        self.inventory.irqs.insert(id, irq);
        self
    }

    pub fn existing_cpuset(self, name: &str, cpus: &str) -> Self {
        self.cpusets.borrow_mut().insert(
            name.to_string(),
            LiveCpuset {
                cpus: mask(cpus),
                mems: mask("0"),
                exclusive: false,
            },
        );
        self
    }

    pub fn vanish(&self, pid: i32) {
        self.vanished.borrow_mut().insert(pid);
    }

    pub fn cpuset_of_pid(&self, pid: i32) -> String {
        self.members.borrow().get(&pid).cloned().unwrap_or_default()
    }

    fn write(&self) {
        self.writes.set(self.writes.get() + 1);
    }

    fn alive(&self, pid: i32) -> io::Result<()> {
        if self.vanished.borrow().contains(&pid) {
            Err(esrch())
        } else {
            Ok(())
        }
    }

    fn with_cpuset<F>(&self, name: &str, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut LiveCpuset),
    {
        match self.cpusets.borrow_mut().get_mut(name) {
            Some(cs) => {
                f(cs);
                self.write();
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }
}

impl System for FakeHost {
    fn inventory(&self) -> Result<Inventory> {
        self.inventory_reads.set(self.inventory_reads.get() + 1);
        Ok(self.inventory.clone())
    }

    fn cpuset_fs(&self) -> &dyn CpusetFs {
        self
    }

    fn kernel(&self) -> &dyn KernelOps {
        self
    }

    fn tuner(&self) -> &dyn Tuning {
        self
    }
}

impl CpusetFs for FakeHost {
    fn list(&self) -> io::Result<Vec<String>> {
        Ok(self.cpusets.borrow().keys().cloned().collect())
    }

    fn read(&self, name: &str) -> io::Result<Option<LiveCpuset>> {
        Ok(self.cpusets.borrow().get(name).cloned())
    }

    fn create(&self, name: &str) -> io::Result<()> {
        self.cpusets
            .borrow_mut()
            .insert(name.to_string(), LiveCpuset::default());
        self.write();
        Ok(())
    }

    fn set_cpus(&self, name: &str, cpus: &Cpumask) -> io::Result<()> {
        self.with_cpuset(name, |cs| cs.cpus = cpus.clone())
    }

    fn set_mems(&self, name: &str, mems: &Cpumask) -> io::Result<()> {
        self.with_cpuset(name, |cs| cs.mems = mems.clone())
    }

    fn set_exclusive(&self, name: &str, exclusive: bool) -> io::Result<()> {
        self.with_cpuset(name, |cs| cs.exclusive = exclusive)
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        self.cpusets.borrow_mut().remove(name);
        let parent = name.rsplit_once('/').map(|(p, _)| p.to_string());
        for member in self.members.borrow_mut().values_mut() {
            if member == name {
                *member = parent.clone().unwrap_or_default();
            }
        }
        self.write();
        Ok(())
    }

    fn attach(&self, name: &str, pid: i32) -> io::Result<()> {
        self.alive(pid)?;
        self.members.borrow_mut().insert(pid, name.to_string());
        self.write();
        Ok(())
    }

    fn cpuset_of(&self, pid: i32) -> io::Result<String> {
        self.alive(pid)?;
        Ok(self.cpuset_of_pid(pid))
    }

    fn can_attach_kthreads(&self) -> bool {
        !self.unified
    }
}

impl KernelOps for FakeHost {
    fn irq_affinity(&self, irq: u32) -> io::Result<Cpumask> {
        self.irq_affinity
            .borrow()
            .get(&irq)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn set_irq_affinity(&self, irq: u32, cpus: &Cpumask) -> io::Result<()> {
        self.irq_affinity.borrow_mut().insert(irq, cpus.clone());
        self.write();
        Ok(())
    }

    fn thread_affinity(&self, pid: i32) -> io::Result<Cpumask> {
        self.alive(pid)?;
        self.thread_affinity
            .borrow()
            .get(&pid)
            .cloned()
            .ok_or_else(esrch)
    }

    fn set_thread_affinity(&self, pid: i32, cpus: &Cpumask) -> io::Result<()> {
        self.alive(pid)?;
        self.thread_affinity.borrow_mut().insert(pid, cpus.clone());
        self.write();
        Ok(())
    }

    fn thread_policy(&self, pid: i32) -> io::Result<SchedPolicy> {
        self.alive(pid)?;
        self.policies.borrow().get(&pid).copied().ok_or_else(esrch)
    }

    fn set_thread_policy(&self, pid: i32, policy: SchedPolicy) -> io::Result<()> {
        self.alive(pid)?;
        self.policies.borrow_mut().insert(pid, policy);
        self.write();
        Ok(())
    }
}

impl Tuning for FakeHost {
    fn disable_smt_siblings(&self) -> ApplyReport {
        ApplyReport::default()
    }

    fn rt_networking(&self) -> ApplyReport {
        ApplyReport::default()
    }

    fn max_cpu_performance(&self) -> ApplyReport {
        ApplyReport::default()
    }
}
