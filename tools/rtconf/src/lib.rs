// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # rtconf
//!
//! Realtime tuning of one Linux host. A `ConfigurationModel` describes the
//! cpusets, IRQ and kernel thread placement and host-wide flags a machine
//! should have; an apply pass snapshots the host (`Inventory`), reconciles
//! the cpusets, runs the rule over every IRQ and kernel thread and reports
//! the outcome in a single `ApplyReport`.
//!
//! The pass needs root. `broker::Broker` runs it in process when the caller
//! is privileged and otherwise re-executes it through an escalation program,
//! shipping the already selected model to the child.

pub mod broker;
pub mod cpuset;
pub mod engine;
mod error;
mod host;
pub mod inventory;
pub mod kernel;
pub mod machines;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod rule;
pub mod tuning;

pub use error::Error;
pub use error::Result;
pub use host::HostRoots;
pub use inventory::Inventory;
pub use model::ConfigurationModel;
pub use report::ApplyReport;
