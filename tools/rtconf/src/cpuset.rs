// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpuset Manager
//!
//! Materializes the model's cpusets on the host. `reconcile()` diffs every
//! declared cpuset against the live cgroup tree and writes only what
//! differs; `assign()` moves one task into a cpuset created or confirmed in
//! the same pass. Cpusets the model does not mention are never touched;
//! only names listed for removal are deleted.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use rtconf_utils::read_file_string;
use rtconf_utils::Cpumask;
use tracing::debug;
use tracing::info;

use crate::kernel::task_error;
use crate::model::CpusetSpec;
use crate::report::ApplyReport;
use crate::report::CpusetChange;
use crate::report::CpusetOutcome;
use crate::report::EntryId;
use crate::Error;
use crate::HostRoots;
use crate::Inventory;
use crate::Result;

/// The settings of one live cpuset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveCpuset {
    pub cpus: Cpumask,
    pub mems: Cpumask,
    pub exclusive: bool,
}

/// Access to the kernel's cpuset hierarchy. Names are paths relative to
/// the cpuset root.
pub trait CpusetFs {
    /// Every cpuset below the root, parents before children.
    fn list(&self) -> io::Result<Vec<String>>;
    /// None when the cpuset does not exist.
    fn read(&self, name: &str) -> io::Result<Option<LiveCpuset>>;
    fn create(&self, name: &str) -> io::Result<()>;
    fn set_cpus(&self, name: &str, cpus: &Cpumask) -> io::Result<()>;
    fn set_mems(&self, name: &str, mems: &Cpumask) -> io::Result<()>;
    fn set_exclusive(&self, name: &str, exclusive: bool) -> io::Result<()>;
    /// Move member tasks to the parent and delete the cpuset.
    fn remove(&self, name: &str) -> io::Result<()>;
    fn attach(&self, name: &str, pid: i32) -> io::Result<()>;
    /// The cpuset `pid` lives in, "" for the root.
    fn cpuset_of(&self, pid: i32) -> io::Result<String>;
    /// cgroup v2 refuses to move kernel threads.
    fn can_attach_kthreads(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

/// `CpusetFs` on a mounted cgroup hierarchy.
#[derive(Debug, Clone)]
pub struct CgroupCpusetFs {
    root: PathBuf,
    proc: PathBuf,
    version: CgroupVersion,
}

fn read_opt(path: &Path) -> io::Result<String> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s.trim().to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

fn parse_list(path: &Path) -> io::Result<Cpumask> {
    let list = read_opt(path)?;
    Cpumask::from_cpulist(&list)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{path:?}: {e:#}")))
}

impl CgroupCpusetFs {
    pub fn new(root: &Path, proc: &Path, version: CgroupVersion) -> Self {
        Self {
            root: root.to_path_buf(),
            proc: proc.to_path_buf(),
            version,
        }
    }

    /// Find the cpuset hierarchy: the v1 cpuset controller mount if there
    /// is one, else the unified hierarchy with the cpuset controller.
    pub fn detect(roots: &HostRoots) -> Result<Self> {
        let cgroup = roots.sys.join("fs/cgroup");
        let v1 = cgroup.join("cpuset");
        if v1.join("cpuset.cpus").exists() {
            debug!("using cgroup v1 cpusets at {:?}", v1);
            return Ok(Self::new(&v1, &roots.proc, CgroupVersion::V1));
        }
        let controllers = read_file_string(&cgroup.join("cgroup.controllers")).unwrap_or_default();
        if controllers.split_whitespace().any(|c| c == "cpuset") {
            debug!("using cgroup v2 cpusets at {:?}", cgroup);
            return Ok(Self::new(&cgroup, &roots.proc, CgroupVersion::V2));
        }
        Err(Error::InventoryUnavailable(format!(
            "no cpuset controller under {cgroup:?}"
        )))
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    fn dir(&self, name: &str) -> PathBuf {
        if name.is_empty() {
            self.root.clone()
        } else {
            self.root.join(name)
        }
    }

    fn tasks_file(&self) -> &'static str {
        match self.version {
            CgroupVersion::V1 => "tasks",
            CgroupVersion::V2 => "cgroup.procs",
        }
    }

    fn parent_of(name: &str) -> &str {
        name.rsplit_once('/').map_or("", |(parent, _)| parent)
    }

    fn enable_controller(&self, parent: &str) -> io::Result<()> {
        let control = self.dir(parent).join("cgroup.subtree_control");
        let enabled = read_opt(&control)?;
        if !enabled.split_whitespace().any(|c| c == "cpuset") {
            fs::write(&control, "+cpuset")?;
        }
        Ok(())
    }

    fn collect(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
        let mut names: Vec<String> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        for name in names {
            let full = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            out.push(full.clone());
            self.collect(&dir.join(&name), &full, out)?;
        }
        Ok(())
    }
}

impl CpusetFs for CgroupCpusetFs {
    fn list(&self) -> io::Result<Vec<String>> {
        let mut out = vec![];
        self.collect(&self.root, "", &mut out)?;
        Ok(out)
    }

    fn read(&self, name: &str) -> io::Result<Option<LiveCpuset>> {
        let dir = self.dir(name);
        if !dir.is_dir() {
            return Ok(None);
        }
        let exclusive = match self.version {
            CgroupVersion::V1 => read_opt(&dir.join("cpuset.cpu_exclusive"))? == "1",
            CgroupVersion::V2 => read_opt(&dir.join("cpuset.cpus.partition"))?.starts_with("root"),
        };
        Ok(Some(LiveCpuset {
            cpus: parse_list(&dir.join("cpuset.cpus"))?,
            mems: parse_list(&dir.join("cpuset.mems"))?,
            exclusive,
        }))
    }

    fn create(&self, name: &str) -> io::Result<()> {
        if self.version == CgroupVersion::V2 {
            self.enable_controller(Self::parent_of(name))?;
        }
        fs::create_dir(self.dir(name))
    }

    fn set_cpus(&self, name: &str, cpus: &Cpumask) -> io::Result<()> {
        fs::write(self.dir(name).join("cpuset.cpus"), cpus.to_cpulist())
    }

    fn set_mems(&self, name: &str, mems: &Cpumask) -> io::Result<()> {
        fs::write(self.dir(name).join("cpuset.mems"), mems.to_cpulist())
    }

    fn set_exclusive(&self, name: &str, exclusive: bool) -> io::Result<()> {
        let dir = self.dir(name);
        match self.version {
            CgroupVersion::V1 => {
                fs::write(dir.join("cpuset.cpu_exclusive"), if exclusive { "1" } else { "0" })
            }
            CgroupVersion::V2 => fs::write(
                dir.join("cpuset.cpus.partition"),
                if exclusive { "root" } else { "member" },
            ),
        }
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        let dir = self.dir(name);
        let parent_tasks = self.dir(Self::parent_of(name)).join(self.tasks_file());
        for pid in read_opt(&dir.join(self.tasks_file()))?.split_whitespace() {
            // Tasks may exit while being moved.
            if let Err(e) = fs::write(&parent_tasks, pid) {
                debug!("cpuset {}: moving {} out failed: {}", name, pid, e);
            }
        }
        fs::remove_dir(dir)
    }

    fn attach(&self, name: &str, pid: i32) -> io::Result<()> {
        fs::write(self.dir(name).join(self.tasks_file()), pid.to_string())
    }

    fn cpuset_of(&self, pid: i32) -> io::Result<String> {
        let content = fs::read_to_string(self.proc.join(pid.to_string()).join("cpuset"))?;
        Ok(content.trim().trim_start_matches('/').to_string())
    }

    fn can_attach_kthreads(&self) -> bool {
        self.version == CgroupVersion::V1
    }
}

/// Reconciles declared cpusets and assigns tasks to them.
pub struct CpusetManager<'a> {
    fs: &'a dyn CpusetFs,
    /// CPUs of every cpuset materialized in this pass.
    materialized: BTreeMap<String, Cpumask>,
}

impl<'a> CpusetManager<'a> {
    pub fn new(fs: &'a dyn CpusetFs) -> Self {
        Self {
            fs,
            materialized: BTreeMap::new(),
        }
    }

    pub fn can_attach_kthreads(&self) -> bool {
        self.fs.can_attach_kthreads()
    }

    /// CPUs of a cpuset materialized in this pass.
    pub fn cpus_of(&self, name: &str) -> Option<&Cpumask> {
        self.materialized.get(name)
    }

    fn node_mask(inv: &Inventory) -> Cpumask {
        // Node ids come from sysfs and are always in range.
        Cpumask::from_cpus(inv.node_ids()).unwrap_or_default()
    }

    fn reconcile_one(&self, spec: &CpusetSpec, inv: &Inventory) -> Result<CpusetChange> {
        let missing = spec.cpus.and_not(&inv.cpus);
        if !missing.is_empty() {
            return Err(Error::UnknownCpu {
                cpuset: spec.name.clone(),
                cpus: missing.to_cpulist(),
            });
        }
        let nodes = Self::node_mask(inv);
        let mems = spec.mems.clone().unwrap_or_else(|| nodes.clone());
        let missing = mems.and_not(&nodes);
        if !missing.is_empty() {
            return Err(Error::UnknownMemNode {
                cpuset: spec.name.clone(),
                nodes: missing.to_cpulist(),
            });
        }
        if let Some(parent) = spec.parent() {
            if !self.materialized.contains_key(parent) {
                return Err(Error::NoSuchCpuset(parent.to_string()));
            }
        }

        let desired = LiveCpuset {
            cpus: spec.cpus.clone(),
            mems,
            exclusive: spec.exclusive,
        };
        let what = format!("cpuset {}", spec.name);
        let live = self.fs.read(&spec.name).map_err(|e| Error::kernel(&what, &e))?;

        let (current, change) = match live {
            Some(live) if live == desired => return Ok(CpusetChange::Unchanged),
            Some(live) => (live, CpusetChange::Updated),
            None => {
                self.fs.create(&spec.name).map_err(|e| Error::kernel(&what, &e))?;
                (LiveCpuset::default(), CpusetChange::Created)
            }
        };

        // cpus and mems must be populated before exclusivity or tasks.
        if current.cpus != desired.cpus {
            self.fs
                .set_cpus(&spec.name, &desired.cpus)
                .map_err(|e| Error::kernel(format!("{what}: cpus"), &e))?;
        }
        if current.mems != desired.mems {
            self.fs
                .set_mems(&spec.name, &desired.mems)
                .map_err(|e| Error::kernel(format!("{what}: mems"), &e))?;
        }
        if current.exclusive != desired.exclusive {
            self.fs
                .set_exclusive(&spec.name, desired.exclusive)
                .map_err(|e| Error::kernel(format!("{what}: exclusive"), &e))?;
        }

        match self.fs.read(&spec.name) {
            Ok(Some(after)) if after == desired => Ok(change),
            Ok(after) => Err(Error::Kernel {
                what,
                reason: format!("reads back as {after:?} after writing {desired:?}"),
            }),
            Err(e) => Err(Error::kernel(what, &e)),
        }
    }

    /// Create or update every declared cpuset, parents first. Per-cpuset
    /// failures become warnings; the pass continues with the next one.
    pub fn reconcile<'s>(
        &mut self,
        specs: impl IntoIterator<Item = &'s CpusetSpec>,
        inv: &Inventory,
    ) -> ApplyReport {
        let mut specs: Vec<&CpusetSpec> = specs.into_iter().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));

        let mut report = ApplyReport::default();
        for spec in specs {
            match self.reconcile_one(spec, inv) {
                Ok(change) => {
                    info!("cpuset {} ({}): {:?}", spec.name, spec.cpus, change);
                    report.applied += 1;
                    if change == CpusetChange::Unchanged {
                        report.unchanged += 1;
                    } else {
                        report.changed += 1;
                    }
                    report.cpusets.push(CpusetOutcome {
                        name: spec.name.clone(),
                        change,
                    });
                    self.materialized.insert(spec.name.clone(), spec.cpus.clone());
                }
                Err(e) => report.warn(EntryId::Cpuset(spec.name.clone()), e),
            }
        }
        report
    }

    /// Delete the named cpusets, children before parents. Absent ones are
    /// skipped.
    pub fn remove(&mut self, names: &[String]) -> ApplyReport {
        let mut names: Vec<&String> = names.iter().collect();
        names.sort();
        names.reverse();

        let mut report = ApplyReport::default();
        for name in names {
            let what = format!("cpuset {name}");
            let res = match self.fs.read(name) {
                Ok(None) => {
                    debug!("{}: already absent", what);
                    continue;
                }
                Ok(Some(_)) => self.fs.remove(name),
                Err(e) => Err(e),
            };
            match res {
                Ok(()) => {
                    info!("{}: removed", what);
                    report.applied += 1;
                    report.changed += 1;
                    report.cpusets.push(CpusetOutcome {
                        name: name.clone(),
                        change: CpusetChange::Removed,
                    });
                }
                Err(e) => report.warn(EntryId::Cpuset(name.clone()), Error::kernel(what, &e)),
            }
        }
        report
    }

    /// Move `pid` into cpuset `name`. Returns whether anything was written.
    pub fn assign(&self, pid: i32, name: &str) -> Result<bool> {
        if !self.materialized.contains_key(name) {
            return Err(Error::NoSuchCpuset(name.to_string()));
        }
        let current = self
            .fs
            .cpuset_of(pid)
            .map_err(|e| task_error(pid, "read cpuset", &e))?;
        if current == name {
            return Ok(false);
        }
        self.fs
            .attach(name, pid)
            .map_err(|e| task_error(pid, &format!("attach to cpuset {name}"), &e))?;
        let after = self
            .fs
            .cpuset_of(pid)
            .map_err(|e| task_error(pid, "read cpuset", &e))?;
        if after != name {
            return Err(Error::Kernel {
                what: format!("pid {pid}: attach to cpuset {name}"),
                reason: format!("still in cpuset /{after}"),
            });
        }
        Ok(true)
    }
}
