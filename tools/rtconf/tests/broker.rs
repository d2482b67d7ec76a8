// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Escalation round trips against scripted children.

mod common;

use std::cell::Cell;
use std::fs;
use std::path::Path;

use common::mask;
use common::setup_test;
use rtconf::broker::ApplyRunner;
use rtconf::broker::Broker;
use rtconf::broker::BrokerState;
use rtconf::broker::ChildProcess;
use rtconf::broker::EscalationRequest;
use rtconf::broker::EscalationResponse;
use rtconf::broker::Mode;
use rtconf::broker::PrivilegeProbe;
use rtconf::broker::CHILD_SUBCOMMAND;
use rtconf::model::CpusetSpec;
use rtconf::report::exit_code;
use rtconf::report::EntryId;
use rtconf::rule::Action;
use rtconf::rule::Matcher;
use rtconf::rule::Rule;
use rtconf::ApplyReport;
use rtconf::ConfigurationModel;
use rtconf::Error;
use rtconf::HostRoots;
use rtconf::Result;
use tempfile::TempDir;

struct Unprivileged;

impl PrivilegeProbe for Unprivileged {
    fn is_privileged(&self) -> bool {
        false
    }
}

/// Counts local runs; an unprivileged broker must never use it.
#[derive(Default)]
struct Local {
    calls: Cell<usize>,
}

impl ApplyRunner for Local {
    fn run(&self, _mode: Mode, _model: &ConfigurationModel) -> Result<ApplyReport> {
        self.calls.set(self.calls.get() + 1);
        Ok(ApplyReport::default())
    }
}

fn model() -> ConfigurationModel {
    ConfigurationModel::builder()
        .cpuset(CpusetSpec::new("rt0", mask("2-3")))
        .rule(Rule::new().when(vec![Matcher::NamePrefix("ksoftirqd".into())], Action::pin("rt0")))
        .build()
        .unwrap()
}

fn sh(script: &str) -> ChildProcess {
    ChildProcess::new(vec!["sh".into(), "-c".into(), script.into()])
}

const NONCE: &str = "@NONCE@";

/// A response line as the child would print it, with a placeholder nonce.
fn response(outcome: std::result::Result<ApplyReport, Error>) -> String {
    serde_json::to_string(&EscalationResponse {
        nonce: NONCE.to_string(),
        outcome,
    })
    .unwrap()
}

/// A child that answers with `outcome` under the request's nonce and exits
/// `code`.
fn reply(outcome: std::result::Result<ApplyReport, Error>, code: u8) -> ChildProcess {
    let line = response(outcome);
    sh(&format!(
        r#"read -r line
nonce=$(printf '%s' "$line" | sed 's/^{{"nonce":"\([^"]*\)".*/\1/')
printf '%s\n' '{line}' | sed "s/{NONCE}/$nonce/"
exit {code}"#
    ))
}

/// Like `reply`, with the exit code the outcome calls for.
fn echo_nonce(outcome: std::result::Result<ApplyReport, Error>) -> ChildProcess {
    let code = exit_code(&outcome);
    reply(outcome, code)
}

fn escalate(child: &ChildProcess) -> Result<ApplyReport> {
    escalate_mode(child, Mode::Apply, &model())
}

fn escalate_mode(
    child: &ChildProcess,
    mode: Mode,
    model: &ConfigurationModel,
) -> Result<ApplyReport> {
    setup_test();
    let local = Local::default();
    let mut broker = Broker::new(&Unprivileged, &local, child);
    let res = broker.run(mode, model);
    assert_eq!(broker.state(), BrokerState::Done);
    assert_eq!(local.calls.get(), 0);
    res
}

fn clean() -> ApplyReport {
    ApplyReport {
        applied: 2,
        changed: 1,
        unchanged: 1,
        ..Default::default()
    }
}

#[test]
fn test_child_report_is_returned() {
    let report = escalate(&echo_nonce(Ok(clean()))).unwrap();
    assert_eq!(report, clean());
    assert!(report.warnings.is_empty());
}

#[test]
fn test_partial_report_survives_the_trip() {
    let mut partial = ApplyReport {
        applied: 1,
        changed: 1,
        ..Default::default()
    };
    partial.warn(EntryId::Thread(7), Error::NoSuchProcess(7));
    assert!(response(Ok(partial.clone())).contains(r#"{"kind":"NoSuchProcess","detail":7}"#));

    let report = escalate(&echo_nonce(Ok(partial))).unwrap();
    let warnings: Vec<_> = report.warnings_for(&EntryId::Thread(7)).collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].reason, Error::NoSuchProcess(7));
}

#[test]
fn test_child_error_is_returned() {
    let res = escalate(&echo_nonce(Err(Error::InvalidSpec("bad rule".into()))));
    assert_eq!(res, Err(Error::InvalidSpec("bad rule".into())));
}

#[test]
fn test_item_error_as_outcome_is_rejected() {
    // A per-entry error belongs in the report's warnings, never as the
    // whole outcome.
    let res = escalate(&echo_nonce(Err(Error::NoSuchProcess(7))));
    assert!(matches!(res, Err(Error::EscalationFailed(_))));
}

#[test]
fn test_wrong_nonce_is_rejected() {
    let line = response(Ok(clean())).replace(NONCE, "forged");
    let child = sh(&format!("cat >/dev/null; printf '%s\\n' '{line}'"));
    assert!(matches!(escalate(&child), Err(Error::EscalationFailed(_))));
}

#[test]
fn test_exit_code_must_match_outcome() {
    assert!(matches!(
        escalate(&reply(Ok(clean()), 3)),
        Err(Error::EscalationFailed(_))
    ));
}

#[test]
fn test_silent_child_fails() {
    let child = sh("cat >/dev/null; exit 0");
    assert!(matches!(escalate(&child), Err(Error::EscalationFailed(_))));
}

#[test]
fn test_garbage_fails() {
    let child = sh("cat >/dev/null; echo 'password: sorry, try again'");
    assert!(matches!(escalate(&child), Err(Error::EscalationFailed(_))));
}

#[test]
fn test_killed_child_fails() {
    let child = sh("cat >/dev/null; kill -9 $$");
    assert!(matches!(escalate(&child), Err(Error::EscalationFailed(_))));
}

#[test]
fn test_missing_escalator_is_unavailable() {
    let child = ChildProcess::new(vec!["/nonexistent/rtconf-escalator".into()]);
    assert!(matches!(
        escalate(&child),
        Err(Error::EscalationUnavailable(_))
    ));
}

#[test]
fn test_dangling_reference_never_escalates() {
    setup_test();
    let model = ConfigurationModel::builder()
        .rule(Rule::new().when(vec![], Action::pin("nowhere")))
        .build()
        .unwrap();
    let local = Local::default();
    // Would fail loudly if it ran.
    let child = sh("exit 9");
    let mut broker = Broker::new(&Unprivileged, &local, &child);
    let res = broker.run(Mode::Apply, &model);
    assert!(matches!(res, Err(Error::InvalidSpec(_))));
    assert_eq!(broker.state(), BrokerState::Unprivileged);
}

#[test]
fn test_escalator_stays_in_callers_process_group() {
    // sudo and friends prompt on the terminal; moved out of the foreground
    // group they stop on SIGTTIN.
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("pgrp");
    let child = sh(&format!(
        "cat >/dev/null; read -r _ _ _ _ pgrp _ </proc/$$/stat; echo $pgrp >{}",
        out.display()
    ));
    assert!(matches!(escalate(&child), Err(Error::EscalationFailed(_))));

    let pgrp: i32 = fs::read_to_string(&out).unwrap().trim().parse().unwrap();
    assert_eq!(pgrp, nix::unistd::getpgrp().as_raw());
}

#[test]
fn test_child_receives_callers_roots() {
    let tmp = TempDir::new().unwrap();
    let seen = tmp.path().join("request");
    let roots = HostRoots::under(&tmp.path().join("host"));
    let child = sh(&format!("cat >{}", seen.display())).roots(&roots);
    assert!(matches!(
        escalate_mode(&child, Mode::Forkcheck, &model()),
        Err(Error::EscalationFailed(_))
    ));

    let request: EscalationRequest =
        serde_json::from_str(&fs::read_to_string(&seen).unwrap()).unwrap();
    assert_eq!(request.roots, roots);
    assert_eq!(request.mode, Mode::Forkcheck);
    assert_eq!(request.model, model());
    assert!(!request.nonce.is_empty());
}

/// A four CPU host with one writable IRQ and a v1 cpuset hierarchy.
fn fake_host(base: &Path) -> HostRoots {
    let roots = HostRoots::under(base);
    let cpu = roots.sys.join("devices/system/cpu");
    fs::create_dir_all(&cpu).unwrap();
    fs::write(cpu.join("online"), "0-3\n").unwrap();
    fs::create_dir_all(roots.sys.join("bus/pci/devices")).unwrap();
    let cpuset = roots.sys.join("fs/cgroup/cpuset");
    fs::create_dir_all(&cpuset).unwrap();
    fs::write(cpuset.join("cpuset.cpus"), "0-3\n").unwrap();
    fs::write(cpuset.join("cpuset.mems"), "0\n").unwrap();
    fs::create_dir_all(roots.irq_dir(24)).unwrap();
    fs::write(roots.irq_dir(24).join("smp_affinity_list"), "0-3\n").unwrap();
    roots
}

/// The real binary's child side, fed through the parent's pipes.
fn rtconf_child(roots: &HostRoots) -> ChildProcess {
    ChildProcess::new(vec![
        env!("CARGO_BIN_EXE_rtconf").into(),
        "--log-level".into(),
        "debug".into(),
        CHILD_SUBCOMMAND.into(),
    ])
    .roots(roots)
}

#[test]
fn test_forkcheck_through_rtconf_child() {
    let tmp = TempDir::new().unwrap();
    let roots = fake_host(tmp.path());
    let res = escalate_mode(&rtconf_child(&roots), Mode::Forkcheck, &model());
    assert_eq!(res, Ok(ApplyReport::default()));
    assert_eq!(
        fs::read_to_string(roots.irq_dir(24).join("smp_affinity_list")).unwrap(),
        "0-3\n"
    );
}

#[test]
fn test_apply_through_rtconf_child() {
    let tmp = TempDir::new().unwrap();
    let roots = fake_host(tmp.path());
    let model = ConfigurationModel::builder()
        .rule(Rule::new().when(
            vec![Matcher::Irq(24)],
            Action::SetAffinity {
                cpus: mask("1"),
                priority: None,
            },
        ))
        .build()
        .unwrap();

    let report = escalate_mode(&rtconf_child(&roots), Mode::Apply, &model).unwrap();
    assert_eq!(report.changed, 1);
    assert!(report.warnings.is_empty(), "{report}");
    let written = fs::read_to_string(roots.irq_dir(24).join("smp_affinity_list")).unwrap();
    assert_eq!(mask(&written), mask("1"));
}

#[test]
fn test_rtconf_child_refuses_without_privilege() {
    if nix::unistd::geteuid().is_root() {
        // root opens read-only files for writing anyway
        return;
    }
    let tmp = TempDir::new().unwrap();
    let roots = fake_host(tmp.path());
    let irq = roots.irq_dir(24).join("smp_affinity_list");
    let mut perms = fs::metadata(&irq).unwrap().permissions();
    perms.set_readonly(true);
    fs::set_permissions(&irq, perms).unwrap();

    let res = escalate_mode(&rtconf_child(&roots), Mode::Forkcheck, &model());
    assert!(matches!(res, Err(Error::EscalationUnavailable(_))));
}
