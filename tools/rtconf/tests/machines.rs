// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Machine selection from built-ins and machines files.

mod common;

use std::fs;

use common::setup_test;
use rtconf::machines::MachineSelector;
use rtconf::machines::MachineTable;
use rtconf::ConfigurationModel;
use rtconf::Error;
use tempfile::TempDir;

const MACHINES: &str = r#"
[machines.bench]
flags = { irq_parking = true, rt_networking = true }
system_cpus = "0-1"

[[machines.bench.cpusets]]
name = "rt0"
cpus = "2-3"
exclusive = true

[[machines.bench.rule]]
matches = [{ name_prefix = "ksoftirqd" }]
action = { pin_to_cpuset = { cpuset = "rt0", priority = { fifo = 10 } } }

[[machines.bench.rule]]
matches = [{ type = "irq" }, { label_contains = "timer" }]
action = "no_op"

[machines.UNICORN]
flags = { irq_parking = false }
"#;

fn write_machines(text: &str) -> (TempDir, std::path::PathBuf) {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("machines.toml");
    fs::write(&path, text).unwrap();
    (tmp, path)
}

#[test]
fn test_file_machines_load_and_override() {
    setup_test();
    let (_tmp, path) = write_machines(MACHINES);
    let mut table = MachineTable::with_builtins();
    assert_eq!(table.load_file(&path).unwrap(), 2);

    let bench = table.select("bench").unwrap();
    assert!(bench.flags().irq_parking);
    assert!(bench.cpuset("rt0").unwrap().exclusive);
    assert_eq!(bench.rule().clauses().len(), 2);
    bench.check_references().unwrap();

    // The file wins over the compiled-in UNICORN.
    let unicorn = table.select("UNICORN").unwrap();
    assert!(!unicorn.flags().irq_parking);
    assert!(!unicorn.flags().hyperthreading_softdisable);

    assert!(table.ids().contains(&"bench"));
    assert!(table.ids().contains(&"AORTS"));
}

#[test]
fn test_unknown_machine() {
    let table = MachineTable::with_builtins();
    assert_eq!(
        table.select("toaster").unwrap_err(),
        Error::NoConfigForMachine("toaster".into())
    );
}

#[test]
fn test_invalid_file_is_rejected() {
    setup_test();
    let (_tmp, path) = write_machines(
        r#"
[[machines.bad.cpusets]]
name = "rt/rt0"
cpus = "2-3"
"#,
    );
    let mut table = MachineTable::new();
    assert!(matches!(table.load_file(&path), Err(Error::InvalidSpec(_))));
    assert!(table.select("bad").is_err());

    let missing = path.with_file_name("nope.toml");
    assert!(matches!(table.load_file(&missing), Err(Error::InvalidSpec(_))));
}

#[test]
fn test_dumped_builtin_reloads_unchanged() {
    let table = MachineTable::with_builtins();
    for id in ["5", "AORTS"] {
        let model = table.select(id).unwrap();
        let text = toml::to_string(&model).unwrap();
        let reloaded: ConfigurationModel = toml::from_str(&text).unwrap();
        assert_eq!(reloaded, model, "machine {id}");
    }
}
