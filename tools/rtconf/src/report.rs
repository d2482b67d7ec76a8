// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FATAL: u8 = 1;
/// Success class: the pass completed but some entries carry warnings.
pub const EXIT_PARTIAL: u8 = 3;

/// What a warning or change is about.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryId {
    Irq(u32),
    Thread(i32),
    Cpuset(String),
    Knob(String),
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Irq(irq) => write!(f, "irq {irq}"),
            EntryId::Thread(pid) => write!(f, "pid {pid}"),
            EntryId::Cpuset(name) => write!(f, "cpuset {name}"),
            EntryId::Knob(knob) => write!(f, "knob {knob}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub entry: EntryId,
    pub reason: Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpusetChange {
    Created,
    Updated,
    Unchanged,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpusetOutcome {
    pub name: String,
    pub change: CpusetChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    PartialSuccess,
}

/// The single structured result of one apply pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Entries whose desired state holds after the pass.
    pub applied: usize,
    /// Mutating writes issued. Zero on a re-run against an unchanged host.
    pub changed: usize,
    /// Entries that already matched and were left alone.
    pub unchanged: usize,
    pub cpusets: Vec<CpusetOutcome>,
    pub warnings: Vec<Warning>,
}

impl ApplyReport {
    pub fn warn(&mut self, entry: EntryId, reason: Error) {
        tracing::warn!("{}: {}", entry, reason);
        self.warnings.push(Warning { entry, reason });
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.changed += other.changed;
        self.unchanged += other.unchanged;
        self.cpusets.extend(other.cpusets);
        self.warnings.extend(other.warnings);
    }

    pub fn outcome(&self) -> Outcome {
        if self.warnings.is_empty() {
            Outcome::Success
        } else {
            Outcome::PartialSuccess
        }
    }

    /// The per-entry failures of a pass that otherwise succeeded.
    pub fn partial_failure(&self) -> Option<&[Warning]> {
        if self.warnings.is_empty() {
            None
        } else {
            Some(&self.warnings)
        }
    }

    pub fn warnings_for(&self, entry: &EntryId) -> impl Iterator<Item = &Warning> {
        let entry = entry.clone();
        self.warnings.iter().filter(move |w| w.entry == entry)
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.outcome() {
            Outcome::Success => "success",
            Outcome::PartialSuccess => "partial success",
        };
        writeln!(
            f,
            "{}: {} applied, {} changed, {} unchanged, {} warnings",
            status,
            self.applied,
            self.changed,
            self.unchanged,
            self.warnings.len()
        )?;
        for cs in self.cpusets.iter() {
            writeln!(f, "  cpuset {:<20} {:?}", cs.name, cs.change)?;
        }
        for w in self.warnings.iter() {
            writeln!(f, "  warning {}: {}", w.entry, w.reason)?;
        }
        Ok(())
    }
}

/// Map the result of a pass to the process exit code.
pub fn exit_code(result: &Result<ApplyReport, Error>) -> u8 {
    match result {
        Ok(report) => match report.outcome() {
            Outcome::Success => EXIT_SUCCESS,
            Outcome::PartialSuccess => EXIT_PARTIAL,
        },
        Err(_) => EXIT_FATAL,
    }
}
