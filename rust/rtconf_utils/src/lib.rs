// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Host primitives for rtconf
//!
//! rtconf tunes a single realtime Linux host: it partitions CPUs with
//! cpusets and moves interrupts and kernel threads onto them. This crate
//! holds the pieces that only describe the host and never change it:
//!
//! - `Cpumask`, a set of logical CPU ids which speaks the kernel's cpulist
//!   and hexadecimal mask notations.
//! - `Topology`, the CPU / SMT core / NUMA node layout read from sysfs.
//! - Small helpers to read procfs and sysfs attributes.
//!
//! Every reader takes the sysfs root as a parameter so tests can run
//! against a fake tree.

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;
pub use cpumask::CpumaskIterator;
pub use cpumask::MAX_CPU_ID;

pub mod misc;
pub use misc::read_file_hex;
pub use misc::read_file_string;
pub use misc::read_from_file;

mod topology;
pub use topology::Core;
pub use topology::Cpu;
pub use topology::Node;
pub use topology::Topology;
