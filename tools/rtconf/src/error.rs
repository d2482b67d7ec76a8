// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Everything that can go wrong while tuning the host.
///
/// Pipeline-level variants (see `is_fatal()`) abort the pass before or
/// instead of any further mutation. Item-level variants are attached to a
/// single cpuset, IRQ or thread in the report and the pass carries on.
///
/// The enum crosses the privilege boundary inside the child's result, so
/// every payload is plain data.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum Error {
    #[error("inventory unavailable: {0}")]
    InventoryUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidSpec(String),

    #[error("cpuset {cpuset}: CPUs {cpus} are not present on this host")]
    UnknownCpu { cpuset: String, cpus: String },

    #[error("cpuset {cpuset}: memory nodes {nodes} are not present on this host")]
    UnknownMemNode { cpuset: String, nodes: String },

    #[error("cpuset {0} was not materialized in this pass")]
    NoSuchCpuset(String),

    #[error("process {0} no longer exists")]
    NoSuchProcess(i32),

    #[error("{what}: {reason}")]
    Kernel { what: String, reason: String },

    #[error("privilege escalation unavailable: {0}")]
    EscalationUnavailable(String),

    #[error("privileged apply failed: {0}")]
    EscalationFailed(String),

    #[error("no configuration for machine {0:?}")]
    NoConfigForMachine(String),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::InventoryUnavailable(_)
            | Error::InvalidSpec(_)
            | Error::EscalationUnavailable(_)
            | Error::EscalationFailed(_)
            | Error::NoConfigForMachine(_) => true,
            Error::UnknownCpu { .. }
            | Error::UnknownMemNode { .. }
            | Error::NoSuchCpuset(_)
            | Error::NoSuchProcess(_)
            | Error::Kernel { .. } => false,
        }
    }

    pub(crate) fn kernel(what: impl Into<String>, err: &std::io::Error) -> Error {
        Error::Kernel {
            what: what.into(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn inventory(what: impl std::fmt::Display, err: impl std::fmt::Display) -> Error {
        Error::InventoryUnavailable(format!("{what}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::InvalidSpec("x".into()).is_fatal());
        assert!(Error::EscalationFailed("x".into()).is_fatal());
        assert!(!Error::NoSuchProcess(42).is_fatal());
        assert!(!Error::NoSuchCpuset("rt0".into()).is_fatal());
    }

    #[test]
    fn test_serde_keeps_variant() {
        let err = Error::UnknownCpu {
            cpuset: "rt0".into(),
            cpus: "8-9".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(serde_json::from_str::<Error>(&json).unwrap(), err);
    }
}
