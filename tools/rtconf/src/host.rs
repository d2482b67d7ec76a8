// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Where procfs and sysfs are mounted. Everything that reads or writes
/// kernel state by path goes through these roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRoots {
    pub proc: PathBuf,
    pub sys: PathBuf,
}

impl Default for HostRoots {
    fn default() -> Self {
        Self {
            proc: PathBuf::from("/proc"),
            sys: PathBuf::from("/sys"),
        }
    }
}

impl HostRoots {
    /// Roots of a fake tree laid out as `<base>/proc` and `<base>/sys`.
    pub fn under(base: &Path) -> Self {
        Self {
            proc: base.join("proc"),
            sys: base.join("sys"),
        }
    }

    pub fn irq_dir(&self, irq: u32) -> PathBuf {
        self.proc.join("irq").join(irq.to_string())
    }

    /// Path of a sysctl key such as "net.core.rmem_max".
    pub fn sysctl(&self, key: &str) -> PathBuf {
        self.proc.join("sys").join(key.replace('.', "/"))
    }
}
