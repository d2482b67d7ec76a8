// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use rtconf_utils::Cpumask;
use serde::Deserialize;
use serde::Serialize;
use sscanf::sscanf;
use tracing::debug;

const KTHREADD_PID: i32 = 2;

/// Scheduling class and static priority of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedPolicy {
    Other,
    Fifo(u8),
    RoundRobin(u8),
    Batch,
    Idle,
    Deadline,
}

impl SchedPolicy {
    /// Decode the `policy` and `rt_priority` fields of /proc/<pid>/stat.
    pub fn from_raw(policy: u32, rt_priority: u32) -> Result<SchedPolicy> {
        let prio = u8::try_from(rt_priority)?;
        Ok(match policy as i32 {
            libc::SCHED_OTHER => SchedPolicy::Other,
            libc::SCHED_FIFO => SchedPolicy::Fifo(prio),
            libc::SCHED_RR => SchedPolicy::RoundRobin(prio),
            libc::SCHED_BATCH => SchedPolicy::Batch,
            libc::SCHED_IDLE => SchedPolicy::Idle,
            6 => SchedPolicy::Deadline,
            p => bail!("Unknown scheduling policy {}", p),
        })
    }

    /// (policy, priority) as sched_setscheduler() takes them.
    pub fn to_raw(self) -> (i32, i32) {
        match self {
            SchedPolicy::Other => (libc::SCHED_OTHER, 0),
            SchedPolicy::Fifo(p) => (libc::SCHED_FIFO, p as i32),
            SchedPolicy::RoundRobin(p) => (libc::SCHED_RR, p as i32),
            SchedPolicy::Batch => (libc::SCHED_BATCH, 0),
            SchedPolicy::Idle => (libc::SCHED_IDLE, 0),
            SchedPolicy::Deadline => (6, 0),
        }
    }
}

impl fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedPolicy::Other => write!(f, "OTHER"),
            SchedPolicy::Fifo(p) => write!(f, "FIFO:{p}"),
            SchedPolicy::RoundRobin(p) => write!(f, "RR:{p}"),
            SchedPolicy::Batch => write!(f, "BATCH"),
            SchedPolicy::Idle => write!(f, "IDLE"),
            SchedPolicy::Deadline => write!(f, "DEADLINE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KthreadKind {
    Irq,
    Ksoftirqd,
    Kworker,
    Migration,
    Rcuc,
    Rcub,
    Rcuog,
    Rcuop,
    Cpuhp,
    IrqWork,
    IdleInject,
    Other,
}

impl KthreadKind {
    pub fn from_name(name: &str) -> KthreadKind {
        let prefix = match name.split_once('/') {
            Some((prefix, _)) => prefix,
            None => return KthreadKind::Other,
        };
        match prefix {
            "irq" => KthreadKind::Irq,
            "ksoftirqd" => KthreadKind::Ksoftirqd,
            "kworker" => KthreadKind::Kworker,
            "migration" => KthreadKind::Migration,
            "rcuc" => KthreadKind::Rcuc,
            "rcub" => KthreadKind::Rcub,
            "rcuog" => KthreadKind::Rcuog,
            "rcuop" => KthreadKind::Rcuop,
            "cpuhp" => KthreadKind::Cpuhp,
            "irq_work" => KthreadKind::IrqWork,
            "idle_inject" => KthreadKind::IdleInject,
            _ => KthreadKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelThread {
    pub pid: i32,
    pub name: String,
    pub kind: KthreadKind,
    pub affinity: Cpumask,
    pub policy: SchedPolicy,
    /// Cgroup path relative to the cpuset root, "" for the root itself.
    /// None when the kernel has no cpuset support.
    pub cpuset: Option<String>,
    /// IRQ served by an irq/<n>-<name> thread.
    pub irq: Option<u32>,
}

impl KernelThread {
    /// The IRQ number encoded in an irq/<n>-<name> thread name.
    pub fn irq_from_name(name: &str) -> Option<u32> {
        sscanf!(name, "irq/{u32}-{str}").ok().map(|(irq, _)| irq)
    }
}

struct Stat {
    name: String,
    ppid: i32,
    policy: SchedPolicy,
}

/// Parse /proc/<pid>/stat. The comm field may hold spaces and parens, so
/// fields are counted from the last ')'.
fn parse_stat(content: &str) -> Result<Stat> {
    let open = content.find('(').ok_or_else(|| anyhow!("No comm in stat"))?;
    let close = content.rfind(')').ok_or_else(|| anyhow!("No comm in stat"))?;
    if close < open {
        bail!("Malformed stat line");
    }
    let name = content[open + 1..close].to_string();
    // Field 3 (state) is index 0 here.
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
    let field = |n: usize| -> Result<u32> {
        let raw = fields.get(n - 3).ok_or_else(|| anyhow!("Short stat line"))?;
        raw.parse::<u32>().with_context(|| format!("Bad stat field {n}: {raw}"))
    };
    let ppid = field(4)? as i32;
    let policy = SchedPolicy::from_raw(field(41)?, field(40)?)?;
    Ok(Stat { name, ppid, policy })
}

fn parse_cpus_allowed(status: &str) -> Result<Cpumask> {
    for line in status.lines() {
        if let Some(list) = line.strip_prefix("Cpus_allowed_list:") {
            return Cpumask::from_cpulist(list.trim());
        }
    }
    bail!("No Cpus_allowed_list in status")
}

/// Parse /proc/<pid>/cpuset ("/rt0") into a path relative to the root.
fn parse_cpuset(content: &str) -> String {
    content.trim().trim_start_matches('/').to_string()
}

fn read_kthread(dir: &Path, pid: i32) -> Result<Option<KernelThread>> {
    let stat = parse_stat(&fs::read_to_string(dir.join("stat"))?)?;
    if pid != KTHREADD_PID && stat.ppid != KTHREADD_PID {
        return Ok(None);
    }
    let affinity = parse_cpus_allowed(&fs::read_to_string(dir.join("status"))?)?;
    let cpuset = fs::read_to_string(dir.join("cpuset"))
        .ok()
        .map(|c| parse_cpuset(&c));

    Ok(Some(KernelThread {
        pid,
        kind: KthreadKind::from_name(&stat.name),
        irq: KernelThread::irq_from_name(&stat.name),
        name: stat.name,
        affinity,
        policy: stat.policy,
        cpuset,
    }))
}

/// Read kthreadd and its children from `<proc>`. Processes that exit while
/// being read are skipped.
pub fn read_kthreads(proc: &Path) -> Result<BTreeMap<i32, KernelThread>> {
    let entries = fs::read_dir(proc).with_context(|| format!("Failed to list {proc:?}"))?;

    let mut threads = BTreeMap::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let pid = match entry.file_name().to_string_lossy().parse::<i32>() {
            Ok(pid) => pid,
            Err(_) => continue,
        };
        match read_kthread(&entry.path(), pid) {
            Ok(Some(thread)) => {
                threads.insert(pid, thread);
            }
            Ok(None) => {}
            Err(e) => debug!("pid {}: skipping: {:#}", pid, e),
        }
    }
    Ok(threads)
}
