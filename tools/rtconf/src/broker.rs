// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Privilege Escalation Broker
//!
//! Decides whether this process can apply a model itself. If it cannot,
//! the same pass is re-run in a child started through an explicit
//! escalation program (`sudo` by default), with the model handed over on
//! stdin and the report read back from stdout:
//!
//!   parent                                 child (apply-child)
//!   ------                                 -------------------
//!   EscalationRequest {nonce, mode,
//!                      roots, model}       ->
//!                                          probe, chdir /, apply
//!                                      <-  EscalationResponse {nonce, outcome}
//!
//! Anything short of a well-formed response carrying the request's nonce
//! is `EscalationFailed`. There is no fallback to an unprivileged apply.
//!
//! The escalation program runs in the caller's process group so it can
//! prompt on the terminal.

use std::ffi::OsString;
use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::process::Stdio;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::model::ConfigurationModel;
use crate::pipeline;
use crate::pipeline::LiveSystem;
use crate::report::exit_code;
use crate::report::ApplyReport;
use crate::Error;
use crate::HostRoots;
use crate::Result;

/// Subcommand the child is started with.
pub const CHILD_SUBCOMMAND: &str = "apply-child";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Apply,
    /// Exercise the escalation path only.
    Forkcheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub nonce: String,
    pub mode: Mode,
    /// Where the child finds procfs and sysfs. Always the parent's.
    pub roots: HostRoots,
    pub model: ConfigurationModel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationResponse {
    pub nonce: String,
    pub outcome: std::result::Result<ApplyReport, Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Unprivileged,
    EscalatingChild,
    Done,
}

pub trait PrivilegeProbe {
    fn is_privileged(&self) -> bool;
}

/// Tries the operation the pass needs most: opening an IRQ affinity file
/// for writing. Nothing is written. Falls back to the effective uid on a
/// host without IRQs.
#[derive(Debug, Clone, Default)]
pub struct IrqWriteProbe {
    roots: HostRoots,
}

impl IrqWriteProbe {
    pub fn new(roots: &HostRoots) -> Self {
        Self {
            roots: roots.clone(),
        }
    }

    fn first_irq_file(&self) -> Option<std::path::PathBuf> {
        let mut ids: Vec<u32> = fs::read_dir(self.roots.proc.join("irq"))
            .ok()?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_string_lossy().parse().ok())
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| self.roots.irq_dir(id).join("smp_affinity_list"))
            .find(|p| p.exists())
    }
}

impl PrivilegeProbe for IrqWriteProbe {
    fn is_privileged(&self) -> bool {
        match self.first_irq_file() {
            Some(path) => match OpenOptions::new().write(true).open(&path) {
                Ok(_) => true,
                Err(e) => {
                    debug!("probe {:?}: {}", path, e);
                    false
                }
            },
            None => nix::unistd::geteuid().is_root(),
        }
    }
}

/// Runs an apply pass (or fork check) somewhere.
pub trait ApplyRunner {
    fn run(&self, mode: Mode, model: &ConfigurationModel) -> Result<ApplyReport>;
}

/// Runs the pass in this process against the host under `roots`. The
/// cgroup hierarchy is only looked up once an apply actually runs here.
#[derive(Debug, Clone, Default)]
pub struct InProcess {
    roots: HostRoots,
}

impl InProcess {
    pub fn new(roots: &HostRoots) -> Self {
        Self {
            roots: roots.clone(),
        }
    }
}

impl ApplyRunner for InProcess {
    fn run(&self, mode: Mode, model: &ConfigurationModel) -> Result<ApplyReport> {
        match mode {
            Mode::Apply => pipeline::apply(model, &LiveSystem::new(&self.roots)?),
            Mode::Forkcheck => Ok(pipeline::forkcheck()),
        }
    }
}

/// Runs the pass in an escalated child and validates what comes back.
#[derive(Debug, Clone)]
pub struct ChildProcess {
    argv: Vec<OsString>,
    roots: HostRoots,
}

static NONCE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hex nonce unique to this process and moment.
fn make_nonce() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = NONCE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}-{:x}", std::process::id(), nanos, seq)
}

impl ChildProcess {
    /// Run `argv` as the child. It must speak the apply-child protocol.
    pub fn new(argv: Vec<OsString>) -> Self {
        Self {
            argv,
            roots: HostRoots::default(),
        }
    }

    /// `<escalator> -- <this executable> --log-level <level> apply-child`.
    /// Escalators reset the environment, so the log level goes on the
    /// command line.
    pub fn escalate_with(escalator: &str, log_level: &str) -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            Error::EscalationUnavailable(format!("cannot locate own executable: {e}"))
        })?;
        Ok(Self::new(vec![
            escalator.into(),
            "--".into(),
            exe.into_os_string(),
            "--log-level".into(),
            log_level.into(),
            CHILD_SUBCOMMAND.into(),
        ]))
    }

    /// Have the child work on the host under `roots`.
    pub fn roots(mut self, roots: &HostRoots) -> Self {
        self.roots = roots.clone();
        self
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    fn exchange(&self, request: &EscalationRequest) -> Result<ApplyReport> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| Error::EscalationUnavailable("empty escalation command".into()))?;
        info!("escalating: {:?}", self.argv);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::EscalationUnavailable(format!("{:?}: {e}", program)))?;

        let payload = serde_json::to_vec(request)
            .map_err(|e| Error::EscalationFailed(format!("encoding request: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits early closes the pipe; its status tells why.
            if let Err(e) = stdin.write_all(&payload) {
                debug!("writing request: {}", e);
            }
        }

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            if let Err(e) = stdout.read_to_string(&mut output) {
                debug!("reading response: {}", e);
            }
        }
        let status = child
            .wait()
            .map_err(|e| Error::EscalationFailed(format!("waiting for child: {e}")))?;

        if let Some(sig) = status.signal() {
            return Err(Error::EscalationFailed(format!(
                "child killed by signal {sig}"
            )));
        }

        let line = output.lines().rev().find(|l| !l.trim().is_empty());
        let response: EscalationResponse = match line.map(serde_json::from_str) {
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                return Err(Error::EscalationFailed(format!(
                    "undecodable result ({status}): {e}"
                )))
            }
            None => {
                return Err(Error::EscalationFailed(format!(
                    "child exited without a result ({status})"
                )))
            }
        };
        if response.nonce != request.nonce {
            return Err(Error::EscalationFailed(
                "result does not belong to this request".into(),
            ));
        }
        let expected = exit_code(&response.outcome);
        if status.code() != Some(i32::from(expected)) {
            return Err(Error::EscalationFailed(format!(
                "child {status} disagrees with its result (expected exit {expected})"
            )));
        }
        // Item-level errors belong in the report's warnings.
        if let Err(e) = &response.outcome {
            if !e.is_fatal() {
                return Err(Error::EscalationFailed(format!(
                    "child failed the pass with a per-entry error: {e}"
                )));
            }
        }
        response.outcome
    }
}

impl ApplyRunner for ChildProcess {
    fn run(&self, mode: Mode, model: &ConfigurationModel) -> Result<ApplyReport> {
        let request = EscalationRequest {
            nonce: make_nonce(),
            mode,
            roots: self.roots.clone(),
            model: model.clone(),
        };
        self.exchange(&request)
    }
}

/// Picks where a pass runs and walks Unprivileged -> EscalatingChild ->
/// Done, or straight to Done when already privileged.
pub struct Broker<'a> {
    probe: &'a dyn PrivilegeProbe,
    local: &'a dyn ApplyRunner,
    escalated: &'a dyn ApplyRunner,
    state: BrokerState,
}

impl<'a> Broker<'a> {
    pub fn new(
        probe: &'a dyn PrivilegeProbe,
        local: &'a dyn ApplyRunner,
        escalated: &'a dyn ApplyRunner,
    ) -> Self {
        Self {
            probe,
            local,
            escalated,
            state: BrokerState::Unprivileged,
        }
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    pub fn run(&mut self, mode: Mode, model: &ConfigurationModel) -> Result<ApplyReport> {
        // Configuration errors never reach a privileged process.
        model.check_references()?;

        if self.probe.is_privileged() {
            info!("privileged, applying in process");
            self.state = BrokerState::Done;
            return self.local.run(mode, model);
        }

        self.state = BrokerState::EscalatingChild;
        let res = self.escalated.run(mode, model);
        self.state = BrokerState::Done;
        if let Err(e) = &res {
            warn!("escalated pass failed: {}", e);
        }
        res
    }
}

/// The child side: read one request from `input`, run it through `apply`
/// if `privileged` says so for the request's roots, write one response
/// line to `output`. Returns the exit code matching the outcome.
pub fn serve_child<P, F>(input: impl Read, mut output: impl Write, privileged: P, apply: F) -> u8
where
    P: FnOnce(&HostRoots) -> bool,
    F: FnOnce(Mode, &HostRoots, &ConfigurationModel) -> Result<ApplyReport>,
{
    let mut line = String::new();
    if let Err(e) = BufReader::new(input).read_line(&mut line) {
        warn!("reading escalation request: {}", e);
        return crate::report::EXIT_FATAL;
    }
    let request: EscalationRequest = match serde_json::from_str(&line) {
        Ok(request) => request,
        Err(e) => {
            // Without a nonce there is no one to answer.
            warn!("malformed escalation request: {}", e);
            return crate::report::EXIT_FATAL;
        }
    };

    let outcome = if let Err(e) = std::env::set_current_dir("/") {
        Err(Error::EscalationFailed(format!("chdir /: {e}")))
    } else if !privileged(&request.roots) {
        Err(Error::EscalationUnavailable(
            "escalated child lacks privilege".into(),
        ))
    } else {
        apply(request.mode, &request.roots, &request.model)
    };

    let code = exit_code(&outcome);
    let response = EscalationResponse {
        nonce: request.nonce,
        outcome,
    };
    let written = serde_json::to_string(&response)
        .map_err(io::Error::from)
        .and_then(|json| writeln!(output, "{json}"))
        .and_then(|_| output.flush());
    if let Err(e) = written {
        warn!("writing escalation response: {}", e);
        return crate::report::EXIT_FATAL;
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Fixed(bool);

    impl PrivilegeProbe for Fixed {
        fn is_privileged(&self) -> bool {
            self.0
        }
    }

    struct Counting {
        calls: Cell<usize>,
    }

    impl ApplyRunner for Counting {
        fn run(&self, _mode: Mode, _model: &ConfigurationModel) -> Result<ApplyReport> {
            self.calls.set(self.calls.get() + 1);
            Ok(ApplyReport::default())
        }
    }

    fn model() -> ConfigurationModel {
        ConfigurationModel::builder().build().unwrap()
    }

    #[test]
    fn test_privileged_short_circuits() {
        let local = Counting { calls: Cell::new(0) };
        let child = Counting { calls: Cell::new(0) };
        let mut broker = Broker::new(&Fixed(true), &local, &child);
        assert_eq!(broker.state(), BrokerState::Unprivileged);
        broker.run(Mode::Apply, &model()).unwrap();
        assert_eq!(broker.state(), BrokerState::Done);
        assert_eq!((local.calls.get(), child.calls.get()), (1, 0));
    }

    #[test]
    fn test_unprivileged_escalates() {
        let local = Counting { calls: Cell::new(0) };
        let child = Counting { calls: Cell::new(0) };
        let mut broker = Broker::new(&Fixed(false), &local, &child);
        broker.run(Mode::Forkcheck, &model()).unwrap();
        assert_eq!((local.calls.get(), child.calls.get()), (0, 1));
    }

    #[test]
    fn test_serve_child_answers_with_nonce() {
        let fake = HostRoots::under(std::path::Path::new("/srv/fake"));
        let request = EscalationRequest {
            nonce: "abc".into(),
            mode: Mode::Forkcheck,
            roots: fake.clone(),
            model: model(),
        };
        let input = serde_json::to_string(&request).unwrap() + "\n";
        let mut out = Vec::new();
        let code = serve_child(
            input.as_bytes(),
            &mut out,
            |roots| roots == &fake,
            |mode, roots, _| {
                assert_eq!(mode, Mode::Forkcheck);
                assert_eq!(roots.sys, fake.sys);
                Ok(pipeline::forkcheck())
            },
        );
        assert_eq!(code, 0);
        let response: EscalationResponse = serde_json::from_slice(&out).unwrap();
        assert_eq!(response.nonce, "abc");
        assert_eq!(response.outcome, Ok(ApplyReport::default()));
    }

    #[test]
    fn test_serve_child_refuses_without_privilege() {
        let request = EscalationRequest {
            nonce: "n".into(),
            mode: Mode::Apply,
            roots: HostRoots::default(),
            model: model(),
        };
        let input = serde_json::to_string(&request).unwrap();
        let mut out = Vec::new();
        let code = serve_child(
            input.as_bytes(),
            &mut out,
            |_| false,
            |_, _, _| panic!("must not apply without privilege"),
        );
        assert_eq!(code, crate::report::EXIT_FATAL);
        let response: EscalationResponse = serde_json::from_slice(&out).unwrap();
        assert!(matches!(response.outcome, Err(Error::EscalationUnavailable(_))));
    }

    #[test]
    fn test_in_process_forkcheck_needs_no_cgroup() {
        let tmp = tempfile::TempDir::new().unwrap();
        let local = InProcess::new(&HostRoots::under(tmp.path()));
        let child = Counting { calls: Cell::new(0) };
        let mut broker = Broker::new(&Fixed(true), &local, &child);

        assert_eq!(broker.run(Mode::Forkcheck, &model()), Ok(ApplyReport::default()));
        assert!(matches!(
            local.run(Mode::Apply, &model()),
            Err(Error::InventoryUnavailable(_))
        ));
    }

    #[test]
    fn test_escalation_argv_carries_log_level() {
        let child = ChildProcess::escalate_with("sudo", "warn,rtconf=debug").unwrap();
        let argv: Vec<_> = child.argv().iter().map(|a| a.to_string_lossy()).collect();
        assert_eq!(argv[0], "sudo");
        assert_eq!(argv[1], "--");
        assert_eq!(argv[3..], ["--log-level", "warn,rtconf=debug", CHILD_SUBCOMMAND]);
    }

    #[test]
    fn test_nonces_differ() {
        assert_ne!(make_nonce(), make_nonce());
    }
}
