// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use rtconf::broker::serve_child;
use rtconf::broker::ApplyRunner;
use rtconf::broker::Broker;
use rtconf::broker::ChildProcess;
use rtconf::broker::InProcess;
use rtconf::broker::IrqWriteProbe;
use rtconf::broker::Mode;
use rtconf::broker::PrivilegeProbe;
use rtconf::machines::MachineSelector;
use rtconf::machines::MachineTable;
use rtconf::machines::DEFAULT_MACHINES_FILE;
use rtconf::report::exit_code;
use rtconf::report::EXIT_FATAL;
use rtconf::report::EXIT_SUCCESS;
use rtconf::ConfigurationModel;
use rtconf::Error;
use rtconf::HostRoots;
use rtconf::Inventory;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::filter::EnvFilter;

/// rtconf: realtime tuning for one Linux host
///
/// Builds cpusets, pins IRQs and kernel threads and sets host-wide knobs
/// according to the configuration of the machine named by --machine or
/// $WHICHCOMP. Applying needs root; an unprivileged caller is escalated
/// through sudo (or --escalate-with).
#[derive(Debug, Parser)]
#[command(author, version)]
struct Opts {
    /// Specify the logging level. Accepts rust's envfilter syntax for modular
    /// logging: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#example-syntax. Examples: ["info", "warn,rtconf=debug"]
    #[clap(long, default_value = "info", global = true)]
    log_level: String,

    /// Machine identity selecting the configuration.
    #[clap(long, env = "WHICHCOMP", global = true)]
    machine: Option<String>,

    /// Machines file. Defaults to /etc/rtconf/machines.toml when present.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Where procfs is mounted.
    #[clap(long, default_value = "/proc", global = true)]
    proc_root: PathBuf,

    /// Where sysfs is mounted.
    #[clap(long, default_value = "/sys", global = true)]
    sys_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show devices, IRQs and kernel threads. Changes nothing.
    Inventory {
        /// Print JSON instead of a summary.
        #[clap(long, action = clap::ArgAction::SetTrue)]
        json: bool,
    },
    /// Apply the machine's configuration, escalating if needed.
    Apply {
        /// Program used to gain privilege.
        #[clap(long, default_value = "sudo")]
        escalate_with: String,

        /// Print the report as JSON.
        #[clap(long, action = clap::ArgAction::SetTrue)]
        json: bool,
    },
    /// Run the escalation round trip without applying anything.
    Forkcheck {
        /// Program used to gain privilege.
        #[clap(long, default_value = "sudo")]
        escalate_with: String,
    },
    /// Print the selected machine's configuration as TOML.
    DumpConfig,
    /// List known machine ids.
    ListMachines,
    /// Privileged half of apply. Reads a request on stdin.
    #[command(hide = true)]
    ApplyChild,
}

fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| match EnvFilter::try_new(log_level) {
            Ok(filter) => Ok(filter),
            Err(e) => {
                eprintln!(
                    "invalid log envvar: {}, using info, err is: {}",
                    log_level, e
                );
                EnvFilter::try_new("info")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries reports and the child's result.
    match tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(true)
        .try_init()
    {
        Ok(()) => {}
        Err(e) => eprintln!("failed to init logger: {}", e),
    }
}

/// Once mutation may start the pass runs to completion.
fn ignore_interrupts() -> Result<()> {
    ctrlc::set_handler(|| warn!("interrupt ignored, the pass runs to completion"))
        .context("Error setting Ctrl-C handler")
}

fn machine_table(config: Option<&Path>) -> Result<MachineTable> {
    let mut table = MachineTable::with_builtins();
    let path = match config {
        Some(path) => Some(path.to_path_buf()),
        None => Some(PathBuf::from(DEFAULT_MACHINES_FILE)).filter(|p| p.exists()),
    };
    if let Some(path) = path {
        let count = table.load_file(&path)?;
        info!("loaded {} machines from {}", count, path.display());
    }
    Ok(table)
}

fn select_model(opts: &Opts) -> Result<ConfigurationModel> {
    let id = opts
        .machine
        .as_deref()
        .ok_or_else(|| anyhow!("no machine id: pass --machine or set WHICHCOMP"))?;
    let table = machine_table(opts.config.as_deref())?;
    info!("machine {}", id);
    Ok(table.select(id)?)
}

fn run_broker(
    opts: &Opts,
    roots: &HostRoots,
    mode: Mode,
    model: &ConfigurationModel,
    escalate_with: &str,
) -> std::result::Result<rtconf::ApplyReport, Error> {
    let probe = IrqWriteProbe::new(roots);
    let local = InProcess::new(roots);
    let child = ChildProcess::escalate_with(escalate_with, &opts.log_level)?.roots(roots);
    Broker::new(&probe, &local, &child).run(mode, model)
}

fn run(opts: &Opts, roots: &HostRoots) -> Result<u8> {
    match &opts.command {
        Command::Inventory { json } => {
            let inv = Inventory::build(roots)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&inv)?);
            } else {
                print!("{}", inv);
            }
            Ok(EXIT_SUCCESS)
        }
        Command::Apply {
            escalate_with,
            json,
        } => {
            let model = select_model(opts)?;
            ignore_interrupts()?;
            let result = run_broker(opts, roots, Mode::Apply, &model, escalate_with);
            match &result {
                Ok(report) if *json => println!("{}", serde_json::to_string_pretty(report)?),
                Ok(report) => print!("{}", report),
                Err(e) => error!("apply failed: {}", e),
            }
            Ok(exit_code(&result))
        }
        Command::Forkcheck { escalate_with } => {
            ignore_interrupts()?;
            let model = ConfigurationModel::builder().build()?;
            let result = run_broker(opts, roots, Mode::Forkcheck, &model, escalate_with);
            match &result {
                Ok(_) => info!("fork check passed"),
                Err(e) => error!("fork check failed: {}", e),
            }
            Ok(exit_code(&result))
        }
        Command::DumpConfig => {
            let model = select_model(opts)?;
            print!("{}", toml::to_string_pretty(&model)?);
            Ok(EXIT_SUCCESS)
        }
        Command::ListMachines => {
            for id in machine_table(opts.config.as_deref())?.ids() {
                println!("{id}");
            }
            Ok(EXIT_SUCCESS)
        }
        Command::ApplyChild => {
            ignore_interrupts()?;
            // The parent's roots travel in the request.
            let code = serve_child(
                io::stdin().lock(),
                io::stdout().lock(),
                |roots| IrqWriteProbe::new(roots).is_privileged(),
                |mode, roots, model| InProcess::new(roots).run(mode, model),
            );
            Ok(code)
        }
    }
}

fn main() -> ExitCode {
    let opts = Opts::parse();
    init_logging(&opts.log_level);
    debug!("opts={:?}", &opts);

    let roots = HostRoots {
        proc: opts.proc_root.clone(),
        sys: opts.sys_root.clone(),
    };
    match run(&opts, &roots) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}
