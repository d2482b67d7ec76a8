// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A set of logical CPU ids, backed by a BitVec of u64's.
//!
//! Unlike a kernel cpumask the width is not fixed at build time: the mask
//! grows as CPUs are set, so a mask parsed from a configuration file can be
//! held before the host topology is known and validated against it later.
//! Two masks are equal when the same CPUs are set, whatever their width.
//!
//! Cpumasks are usually created from the kernel's cpulist notation, which is
//! what `/proc/irq/*/smp_affinity_list` and `cpuset.cpus` speak:
//!
//!```
//!     use rtconf_utils::Cpumask;
//!     let mask = Cpumask::from_cpulist("0-3,8").unwrap();
//!     assert_eq!(mask.weight(), 5);
//!     assert_eq!(mask.to_cpulist(), "0-3,8");
//!```
//!
//! or from the comma-grouped hexadecimal notation of `smp_affinity`:
//!
//!```
//!     use rtconf_utils::Cpumask;
//!     let mask = Cpumask::from_str("00000000,000000f0").unwrap();
//!     assert!(mask.test_cpu(4));
//!     assert!(!mask.test_cpu(3));
//!```
//!
//! Cpumasks serialize as cpulist strings, so configuration files can write
//! `cpus = "2-3"`.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use sscanf::sscanf;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;

/// Upper bound on CPU ids accepted from any textual source (CONFIG_NR_CPUS
/// is at most 8192 on mainline kernels).
pub const MAX_CPU_ID: usize = 8192;

#[derive(Clone, Default)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(cpu: usize) -> Result<()> {
        if cpu >= MAX_CPU_ID {
            bail!("Invalid CPU {} passed, max {}", cpu, MAX_CPU_ID - 1);
        }

        Ok(())
    }

    /// Build a new empty Cpumask object.
    pub fn new() -> Cpumask {
        Cpumask {
            mask: BitVec::new(),
        }
    }

    /// Build a Cpumask from a hexadecimal string, as found in
    /// `/proc/irq/*/smp_affinity`. Comma group separators, underscores and a
    /// leading "0x" are accepted. "none" gives an empty mask.
    pub fn from_str(cpumask: &str) -> Result<Cpumask> {
        let cpumask = cpumask.trim().trim_end_matches('\0');
        if cpumask == "none" {
            return Ok(Self::new());
        }
        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace(['_', ','], "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = Cpumask::new();
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                mask.set_cpu(index * 8 + lsb)
                    .with_context(|| format!("Cpumask {cpumask} out of range"))?;
            }
        }

        Ok(mask)
    }

    /// Build a Cpumask from kernel cpulist notation ("0-3,6,8-9"). An empty
    /// string gives an empty mask.
    pub fn from_cpulist(cpulist: &str) -> Result<Cpumask> {
        let mut mask = Cpumask::new();
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)?;
        }

        Ok(mask)
    }

    /// Build a Cpumask from an iterator of CPU ids.
    pub fn from_cpus(cpus: impl IntoIterator<Item = usize>) -> Result<Cpumask> {
        let mut mask = Cpumask::new();
        for cpu in cpus {
            mask.set_cpu(cpu)?;
        }
        Ok(mask)
    }

    /// Set a bit in the Cpumask, growing it if needed. Returns an error if
    /// the CPU id is beyond MAX_CPU_ID.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        Self::check_cpu(cpu)?;
        if cpu >= self.mask.len() {
            self.mask.resize(cpu + 1, false);
        }
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) {
        if cpu < self.mask.len() {
            self.mask.set(cpu, false);
        }
    }

    /// Test whether the specified CPU bit is set in the Cpumask.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// Return true if every CPU set here is also set in `other`.
    pub fn is_subset(&self, other: &Cpumask) -> bool {
        self.iter().all(|cpu| other.test_cpu(cpu))
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new &= other;
        new
    }

    /// Create a Cpumask that is the OR of the current Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new |= other;
        new
    }

    /// Create a Cpumask holding the CPUs of this mask which are not in
    /// `other`.
    pub fn and_not(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        for cpu in other.iter() {
            new.clear_cpu(cpu);
        }
        new
    }

    /// Iterate over the indices with bits set.
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }

    /// Format as kernel cpulist notation, collapsing runs into ranges.
    pub fn to_cpulist(&self) -> String {
        let mut groups: Vec<String> = Vec::new();
        let mut run: Option<(usize, usize)> = None;
        for cpu in self.iter() {
            run = match run {
                Some((first, last)) if cpu == last + 1 => Some((first, cpu)),
                Some(done) => {
                    groups.push(fmt_run(done));
                    Some((cpu, cpu))
                }
                None => Some((cpu, cpu)),
            };
        }
        if let Some(done) = run {
            groups.push(fmt_run(done));
        }
        groups.join(",")
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let nr_bits = self.iter().last().map(|cpu| cpu + 1).unwrap_or(1);
        let mut masks: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();
        masks.resize(nr_bits.div_ceil(32), 0);

        // Highest group first, comma separated like /proc/irq/*/smp_affinity.
        let mut first = true;
        for submask in masks.iter().rev() {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            match case {
                'x' => write!(f, "{submask:08x}")?,
                'X' => write!(f, "{submask:08X}")?,
                _ => unreachable!(),
            }
        }
        Ok(())
    }
}

fn fmt_run((first, last): (usize, usize)) -> String {
    if first == last {
        format!("{first}")
    } else {
        format!("{first}-{last}")
    }
}

/// Parse kernel cpulist notation into a list of CPU ids. Ranges may carry a
/// stride ("0-10:2"), as accepted by the kernel's bitmap_parselist().
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim().trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let group = group.trim();
        let (min, max, stride) = match sscanf!(group, "{usize}-{usize}:{usize}") {
            Ok((x, y, s)) => (x, y, s),
            Err(_) => match sscanf!(group, "{usize}-{usize}") {
                Ok((x, y)) => (x, y, 1),
                Err(_) => match sscanf!(group, "{usize}") {
                    Ok(x) => (x, x, 1),
                    Err(_) => {
                        bail!("Failed to parse cpulist {}", group);
                    }
                },
            },
        };
        if min > max || stride == 0 {
            bail!("Invalid cpulist range {}", group);
        }
        if max >= MAX_CPU_ID {
            bail!("CPU {} in cpulist {} is out of range", max, cpulist);
        }
        cpu_ids.extend((min..=max).step_by(stride));
    }

    Ok(cpu_ids)
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let bits = &self.mask.mask;
        while self.index < bits.len() {
            let index = self.index;
            self.index += 1;
            if bits[index] {
                return Some(index);
            }
        }

        None
    }
}

impl PartialEq for Cpumask {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for Cpumask {}

impl Hash for Cpumask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for cpu in self.iter() {
            cpu.hash(state);
        }
    }
}

impl fmt::Debug for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cpumask({})", self.to_cpulist())
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        write!(f, "{}", self.to_cpulist())
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        let len = self.mask.len();
        for cpu in 0..len {
            if self.mask[cpu] && !rhs.test_cpu(cpu) {
                self.mask.set(cpu, false);
            }
        }
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        if rhs.mask.len() > self.mask.len() {
            self.mask.resize(rhs.mask.len(), false);
        }
        for cpu in rhs.iter() {
            self.mask.set(cpu, true);
        }
    }
}

impl Serialize for Cpumask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_cpulist())
    }
}

impl<'de> Deserialize<'de> for Cpumask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cpumask::from_cpulist(&s).map_err(|e| de::Error::custom(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpulist_roundtrip_collapses_ranges() {
        let mask = Cpumask::from_cpulist("6,0-2,3,10-11").unwrap();
        assert_eq!(mask.to_cpulist(), "0-3,6,10-11");
        assert_eq!(mask.weight(), 7);
    }

    #[test]
    fn test_cpulist_stride() {
        let mask = Cpumask::from_cpulist("0-8:4").unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 4, 8]);
    }

    #[test]
    fn test_cpulist_rejects_garbage() {
        assert!(Cpumask::from_cpulist("1-a").is_err());
        assert!(Cpumask::from_cpulist("5-2").is_err());
        assert!(Cpumask::from_cpulist("99999").is_err());
    }

    #[test]
    fn test_empty_cpulist() {
        assert!(Cpumask::from_cpulist("").unwrap().is_empty());
        assert!(Cpumask::from_cpulist("\n").unwrap().is_empty());
    }

    #[test]
    fn test_hex_with_groups() {
        let mask = Cpumask::from_str("00000001,00000003").unwrap();
        assert_eq!(mask.to_cpulist(), "0-1,32");
        assert_eq!(format!("{mask:x}"), "00000001,00000003");
    }

    #[test]
    fn test_hex_width_follows_highest_cpu() {
        let mut mask = Cpumask::from_cpulist("1,40").unwrap();
        assert_eq!(format!("{mask:X}"), "00000100,00000002");
        mask.clear_cpu(40);
        assert_eq!(format!("{mask:x}"), "00000002");
        assert_eq!(format!("{:x}", Cpumask::new()), "00000000");
    }

    #[test]
    fn test_equality_ignores_width() {
        let mut wide = Cpumask::from_cpulist("1,40").unwrap();
        wide.clear_cpu(40);
        let narrow = Cpumask::from_cpulist("1").unwrap();
        assert_eq!(wide, narrow);
    }

    #[test]
    fn test_set_operations() {
        let a = Cpumask::from_cpulist("0-3").unwrap();
        let b = Cpumask::from_cpulist("2-5").unwrap();
        assert_eq!(a.and(&b).to_cpulist(), "2-3");
        assert_eq!(a.or(&b).to_cpulist(), "0-5");
        assert_eq!(a.and_not(&b).to_cpulist(), "0-1");
        assert!(Cpumask::from_cpulist("2").unwrap().is_subset(&a));
        assert!(!b.is_subset(&a));
    }

    #[test]
    fn test_serde_as_cpulist() {
        let mask = Cpumask::from_cpulist("2,3").unwrap();
        let json = serde_json::to_string(&mask).unwrap();
        assert_eq!(json, "\"2-3\"");
        let back: Cpumask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mask);
    }
}
