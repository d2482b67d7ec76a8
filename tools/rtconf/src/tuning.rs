// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host-wide knobs behind the model's `Flags`: SMT soft-disable, network
//! sysctls and the CPU performance profile. Every knob is read first and
//! written only when it differs.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use glob::glob;
use rtconf_utils::Topology;
use tracing::debug;
use tracing::info;

use crate::report::ApplyReport;
use crate::report::EntryId;
use crate::Error;
use crate::HostRoots;

pub const RT_NETWORK_SYSCTLS: &[(&str, &str)] = &[
    ("net.core.netdev_max_backlog", "250000"),
    ("net.core.rmem_max", "16777216"),
    ("net.core.wmem_max", "16777216"),
    ("net.core.rmem_default", "16777216"),
    ("net.core.wmem_default", "16777216"),
    ("net.core.optmem_max", "16777216"),
    ("net.ipv4.tcp_low_latency", "1"),
    ("net.ipv4.tcp_sack", "0"),
    ("net.ipv4.tcp_timestamps", "0"),
    ("net.ipv4.tcp_fastopen", "1"),
    ("net.ipv4.tcp_mem", "16777216 16777216 16777216"),
    ("net.ipv4.tcp_rmem", "4096 87380 16777216"),
    ("net.ipv4.tcp_wmem", "4096 65536 16777216"),
];

pub const PERFORMANCE_SYSCTLS: &[(&str, &str)] = &[
    ("vm.stat_interval", "1000"),
    ("vm.dirty_writeback_centisecs", "5000"),
    ("kernel.watchdog", "0"),
    ("kernel.nmi_watchdog", "0"),
    ("kernel.sched_rt_runtime_us", "995000"),
];

/// Host-wide tuning. Each call is one self-contained step of the pass.
pub trait Tuning {
    /// Offline SMT siblings. `report.changed > 0` means the CPU set moved
    /// and the inventory must be rebuilt.
    fn disable_smt_siblings(&self) -> ApplyReport;
    fn rt_networking(&self) -> ApplyReport;
    fn max_cpu_performance(&self) -> ApplyReport;
}

#[derive(Debug, Clone, Default)]
pub struct SysTuner {
    roots: HostRoots,
}

fn normalize(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl SysTuner {
    pub fn new(roots: &HostRoots) -> Self {
        Self {
            roots: roots.clone(),
        }
    }

    fn glob_knobs(&self, pattern: &str) -> Vec<PathBuf> {
        let pattern = self.roots.sys.join(pattern);
        match glob(&pattern.to_string_lossy()) {
            Ok(paths) => {
                let mut paths: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
                paths.sort();
                paths
            }
            Err(e) => {
                debug!("bad knob pattern {:?}: {}", pattern, e);
                vec![]
            }
        }
    }

    /// Converge one knob. Missing knobs and failed writes become warnings.
    fn set_knob(&self, report: &mut ApplyReport, name: &str, path: &Path, value: &str) {
        let entry = EntryId::Knob(name.to_string());
        let res = (|| -> io::Result<bool> {
            let live = fs::read_to_string(path)?;
            if normalize(&live) == normalize(value) {
                return Ok(false);
            }
            fs::write(path, value)?;
            let after = fs::read_to_string(path)?;
            if normalize(&after) != normalize(value) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("reads back as {:?}", after.trim()),
                ));
            }
            Ok(true)
        })();
        match res {
            Ok(changed) => {
                report.applied += 1;
                if changed {
                    debug!("{} = {}", name, value);
                    report.changed += 1;
                } else {
                    report.unchanged += 1;
                }
            }
            Err(e) => report.warn(entry, Error::kernel(name, &e)),
        }
    }

    fn set_sysctls(&self, report: &mut ApplyReport, sysctls: &[(&str, &str)]) {
        for (key, value) in sysctls {
            self.set_knob(report, key, &self.roots.sysctl(key), value);
        }
    }

    fn knob_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.roots.sys)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

impl Tuning for SysTuner {
    fn disable_smt_siblings(&self) -> ApplyReport {
        let mut report = ApplyReport::default();
        let topo = match Topology::with_sysfs(&self.roots.sys) {
            Ok(topo) => topo,
            Err(e) => {
                report.warn(
                    EntryId::Knob("smt".to_string()),
                    Error::Kernel {
                        what: "cpu topology".to_string(),
                        reason: format!("{e:#}"),
                    },
                );
                return report;
            }
        };
        let secondaries = topo.smt_secondaries();
        if !secondaries.is_empty() {
            info!("taking SMT siblings {} offline", secondaries);
        }
        for cpu in secondaries.iter() {
            let path = self
                .roots
                .sys
                .join(format!("devices/system/cpu/cpu{cpu}/online"));
            self.set_knob(&mut report, &format!("cpu{cpu}/online"), &path, "0");
        }
        report
    }

    fn rt_networking(&self) -> ApplyReport {
        let mut report = ApplyReport::default();
        self.set_sysctls(&mut report, RT_NETWORK_SYSCTLS);
        report
    }

    fn max_cpu_performance(&self) -> ApplyReport {
        let mut report = ApplyReport::default();
        self.set_sysctls(&mut report, PERFORMANCE_SYSCTLS);

        for path in self.glob_knobs("devices/system/machinecheck/machinecheck*/check_interval") {
            self.set_knob(&mut report, &self.knob_name(&path), &path, "0");
        }
        for path in self.glob_knobs("devices/system/cpu/cpu[0-9]*/cpufreq/scaling_governor") {
            self.set_knob(&mut report, &self.knob_name(&path), &path, "performance");
        }
        // Everything but the polling/C1 state.
        for path in self.glob_knobs("devices/system/cpu/cpu[0-9]*/cpuidle/state[1-9]*/disable") {
            self.set_knob(&mut report, &self.knob_name(&path), &path, "1");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_sysctls_converge_once() {
        let tmp = TempDir::new().unwrap();
        let roots = HostRoots::under(tmp.path());
        for (key, _) in RT_NETWORK_SYSCTLS {
            write(&roots.sysctl(key), "0\n");
        }
        write(&roots.sysctl("net.ipv4.tcp_rmem"), "4096\t87380\t16777216\n");

        let tuner = SysTuner::new(&roots);
        let first = tuner.rt_networking();
        assert!(first.warnings.is_empty());
        // tcp_sack and tcp_timestamps already hold, tcp_rmem differs only
        // in whitespace.
        assert_eq!(first.changed, RT_NETWORK_SYSCTLS.len() - 3);
        let second = tuner.rt_networking();
        assert_eq!(second.changed, 0);
        assert_eq!(second.unchanged, RT_NETWORK_SYSCTLS.len());
    }

    #[test]
    fn test_missing_sysctl_is_warning() {
        let tmp = TempDir::new().unwrap();
        let tuner = SysTuner::new(&HostRoots::under(tmp.path()));
        let report = tuner.max_cpu_performance();
        assert_eq!(report.warnings.len(), PERFORMANCE_SYSCTLS.len());
        assert_eq!(
            report.warnings[0].entry,
            EntryId::Knob("vm.stat_interval".into())
        );
    }

    #[test]
    fn test_performance_knobs() {
        let tmp = TempDir::new().unwrap();
        let roots = HostRoots::under(tmp.path());
        for (key, _) in PERFORMANCE_SYSCTLS {
            write(&roots.sysctl(key), "1\n");
        }
        let cpu0 = roots.sys.join("devices/system/cpu/cpu0");
        write(&cpu0.join("cpufreq/scaling_governor"), "powersave\n");
        write(&cpu0.join("cpuidle/state0/disable"), "0\n");
        write(&cpu0.join("cpuidle/state1/disable"), "0\n");
        write(&cpu0.join("cpuidle/state2/disable"), "0\n");

        let report = SysTuner::new(&roots).max_cpu_performance();
        assert!(report.warnings.is_empty(), "{report}");
        assert_eq!(
            fs::read_to_string(cpu0.join("cpufreq/scaling_governor")).unwrap(),
            "performance"
        );
        assert_eq!(fs::read_to_string(cpu0.join("cpuidle/state0/disable")).unwrap(), "0\n");
        assert_eq!(fs::read_to_string(cpu0.join("cpuidle/state2/disable")).unwrap(), "1");
    }

    #[test]
    fn test_smt_siblings_offlined() {
        let tmp = TempDir::new().unwrap();
        let roots = HostRoots::under(tmp.path());
        let cpu = roots.sys.join("devices/system/cpu");
        write(&cpu.join("online"), "0-3\n");
        for (id, siblings) in [(0, "0,2"), (1, "1,3"), (2, "0,2"), (3, "1,3")] {
            write(&cpu.join(format!("cpu{id}/topology/thread_siblings_list")), siblings);
            write(&cpu.join(format!("cpu{id}/online")), "1\n");
        }

        let report = SysTuner::new(&roots).disable_smt_siblings();
        assert_eq!(report.changed, 2);
        assert_eq!(fs::read_to_string(cpu.join("cpu3/online")).unwrap(), "0");
        assert_eq!(fs::read_to_string(cpu.join("cpu1/online")).unwrap(), "1\n");
    }
}
