// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::io;

use nix::sched::sched_getaffinity;
use nix::sched::sched_setaffinity;
use nix::sched::CpuSet;
use nix::unistd::Pid;
use rtconf_utils::Cpumask;

use crate::inventory::SchedPolicy;
use crate::Error;
use crate::HostRoots;

const SCHED_RESET_ON_FORK: i32 = 0x4000_0000;

/// Live IRQ and thread state. Every call goes to the kernel; nothing is
/// cached.
pub trait KernelOps {
    fn irq_affinity(&self, irq: u32) -> io::Result<Cpumask>;
    fn set_irq_affinity(&self, irq: u32, cpus: &Cpumask) -> io::Result<()>;
    fn thread_affinity(&self, pid: i32) -> io::Result<Cpumask>;
    fn set_thread_affinity(&self, pid: i32, cpus: &Cpumask) -> io::Result<()>;
    fn thread_policy(&self, pid: i32) -> io::Result<SchedPolicy>;
    fn set_thread_policy(&self, pid: i32, policy: SchedPolicy) -> io::Result<()>;
}

/// Map a failed operation on `pid` to an item-level error. A vanished task
/// is `NoSuchProcess`, anything else a kernel failure.
pub(crate) fn task_error(pid: i32, what: &str, err: &io::Error) -> Error {
    if err.raw_os_error() == Some(libc::ESRCH) || err.kind() == io::ErrorKind::NotFound {
        Error::NoSuchProcess(pid)
    } else {
        Error::kernel(format!("pid {pid}: {what}"), err)
    }
}

fn invalid_data(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

/// `KernelOps` on the running host: IRQs through procfs, threads through
/// sched_{get,set}affinity and sched_{get,set}scheduler.
#[derive(Debug, Clone, Default)]
pub struct SysKernel {
    roots: HostRoots,
}

impl SysKernel {
    pub fn new(roots: &HostRoots) -> Self {
        Self {
            roots: roots.clone(),
        }
    }
}

impl KernelOps for SysKernel {
    fn irq_affinity(&self, irq: u32) -> io::Result<Cpumask> {
        let list = fs::read_to_string(self.roots.irq_dir(irq).join("smp_affinity_list"))?;
        Cpumask::from_cpulist(&list).map_err(invalid_data)
    }

    fn set_irq_affinity(&self, irq: u32, cpus: &Cpumask) -> io::Result<()> {
        fs::write(
            self.roots.irq_dir(irq).join("smp_affinity_list"),
            cpus.to_cpulist(),
        )
    }

    fn thread_affinity(&self, pid: i32) -> io::Result<Cpumask> {
        let set = sched_getaffinity(Pid::from_raw(pid))?;
        let mut mask = Cpumask::new();
        for cpu in 0..CpuSet::count() {
            if set.is_set(cpu).unwrap_or(false) {
                mask.set_cpu(cpu).map_err(invalid_data)?;
            }
        }
        Ok(mask)
    }

    fn set_thread_affinity(&self, pid: i32, cpus: &Cpumask) -> io::Result<()> {
        let mut set = CpuSet::new();
        for cpu in cpus.iter() {
            set.set(cpu)?;
        }
        sched_setaffinity(Pid::from_raw(pid), &set)?;
        Ok(())
    }

    fn thread_policy(&self, pid: i32) -> io::Result<SchedPolicy> {
        // SAFETY: takes a plain pid and touches no memory of ours.
        let policy = unsafe { libc::sched_getscheduler(pid) };
        if policy < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut param = libc::sched_param { sched_priority: 0 };
        // SAFETY: param is a live, initialized sched_param the call fills in.
        if unsafe { libc::sched_getparam(pid, &mut param) } < 0 {
            return Err(io::Error::last_os_error());
        }
        SchedPolicy::from_raw(
            (policy & !SCHED_RESET_ON_FORK) as u32,
            param.sched_priority as u32,
        )
        .map_err(invalid_data)
    }

    fn set_thread_policy(&self, pid: i32, policy: SchedPolicy) -> io::Result<()> {
        let (policy, prio) = policy.to_raw();
        let param = libc::sched_param {
            sched_priority: prio,
        };
        // SAFETY: param outlives the call and is only read by the kernel.
        if unsafe { libc::sched_setscheduler(pid, policy, &param) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
