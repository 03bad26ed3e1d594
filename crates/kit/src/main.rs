//! vmlab - disposable virtual network topologies on QEMU and Open vSwitch

use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Context as _};
use color_eyre::{Report, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use tracing::error;

mod assembler;
mod checks;
mod clean;
mod command_run;
mod common_opts;
mod config;
mod errors;
mod host;
mod overlay;
mod presets;
mod progress;
mod qemu;
mod router;
mod ssh;
mod switch;
mod tap;
mod topology;
mod utils;

/// Default root for per-run working directories.
pub const DEFAULT_WORK_ROOT: &str = "/tmp/vmlab";

/// Pause between guest readiness probes.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Assemble disposable virtual network topologies.
///
/// vmlab boots a QEMU guest per node, wires the nodes together over Open
/// vSwitch bridges with optional VLAN separation, configures addresses and
/// routes over each guest's control channel, runs the topology's declared
/// connectivity checks, and tears everything down again.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a topology, run its checks, and tear it down
    Run(RunOpts),

    /// List the built-in topologies
    Topologies,

    /// Remove everything a crashed or kept run left behind
    Clean(CleanOpts),
}

#[derive(Parser)]
struct RunOpts {
    /// Built-in topology name (see `vmlab topologies`)
    topology: Option<String>,

    /// JSON topology description to run instead of a built-in one
    #[clap(long, conflicts_with = "topology")]
    file: Option<Utf8PathBuf>,

    /// Read-only qcow2 base image every guest boots from
    #[clap(long, env = "VMLAB_BASE_IMAGE")]
    base_image: Utf8PathBuf,

    /// Root directory for per-run state (overlay images)
    #[clap(long, default_value = DEFAULT_WORK_ROOT)]
    work_dir: Utf8PathBuf,

    #[clap(flatten)]
    memory: common_opts::MemoryOpts,

    #[clap(flatten)]
    guest: common_opts::GuestOpts,

    #[clap(flatten)]
    timeouts: common_opts::TimeoutOpts,

    /// Skip the declared connectivity checks
    #[clap(long)]
    skip_checks: bool,

    /// Leave the topology running and print connection details
    #[clap(long)]
    keep: bool,
}

#[derive(Parser)]
struct CleanOpts {
    /// Run prefix to sweep, as printed by `vmlab run` (vk + four hex chars)
    #[clap(long)]
    prefix: String,

    /// Root directory for per-run state (overlay images)
    #[clap(long, default_value = DEFAULT_WORK_ROOT)]
    work_dir: Utf8PathBuf,
}

/// Install and configure the tracing/logging system.
///
/// Structured logging to stderr with environment-based filtering via
/// RUST_LOG, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(opts) => run(opts),
        Commands::Topologies => {
            list_topologies();
            Ok(())
        }
        Commands::Clean(opts) => clean_leftovers(opts),
    }
}

fn resolve_description(opts: &RunOpts) -> Result<topology::TopologyDescription> {
    match (&opts.topology, &opts.file) {
        (Some(name), None) => presets::find(name).ok_or_else(|| {
            eyre!("no built-in topology named {name}; `vmlab topologies` lists them")
        }),
        (None, Some(path)) => topology::TopologyDescription::load(path)
            .with_context(|| format!("loading topology from {path}")),
        _ => Err(eyre!("name a built-in topology or pass --file")),
    }
}

fn run(opts: RunOpts) -> Result<()> {
    let description = resolve_description(&opts)?;
    let memory_mb = utils::parse_memory_to_mb(&opts.memory.memory)?;
    let run_prefix = config::RunConfig::generate_prefix();
    let cfg = config::RunConfig {
        base_image: opts.base_image.clone(),
        work_dir: opts.work_dir.join(&run_prefix),
        run_prefix,
        credentials: config::GuestCredentials {
            user: opts.guest.guest_user.clone(),
            password: opts.guest.guest_password.clone(),
        },
        memory_mb,
        ready_timeout: Duration::from_secs(opts.timeouts.ssh_timeout),
        ready_poll: READY_POLL_INTERVAL,
        command_timeout: Duration::from_secs(opts.timeouts.command_timeout),
    };

    let mut topology = assembler::assemble(description, cfg)?;
    print_node_table(&topology);

    let results = if opts.skip_checks {
        Vec::new()
    } else {
        match topology.run_checks() {
            Ok(results) => results,
            Err(e) => {
                if !opts.keep {
                    if let Err(report) = topology.teardown() {
                        tracing::warn!("teardown after failed checks: {report}");
                    }
                }
                return Err(e.into());
            }
        }
    };
    if !results.is_empty() {
        print_check_table(&results);
    }
    let checks_ok = checks::all_passed(&results);
    if !checks_ok {
        error!("one or more connectivity checks failed");
    }

    if opts.keep {
        print_keep_details(&topology);
    } else {
        topology.teardown()?;
    }

    if checks_ok {
        Ok(())
    } else {
        Err(eyre!("connectivity checks failed"))
    }
}

fn print_node_table(topology: &assembler::Topology) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["NODE", "STATE", "SSH PORT"]);
    for node in topology.node_summaries() {
        let port = node
            .ssh_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![node.name, node.state.to_string(), port]);
    }
    println!("{}", table);
}

fn expectation_word(expect: topology::CheckExpectation) -> &'static str {
    match expect {
        topology::CheckExpectation::Reachable => "reachable",
        topology::CheckExpectation::Isolated => "isolated",
    }
}

fn print_check_table(results: &[checks::CheckResult]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["FROM", "TO", "EXPECT", "RESULT"]);
    for check in results {
        table.add_row(vec![
            check.from.clone(),
            format!("{} ({})", check.to, check.target),
            expectation_word(check.expect).to_string(),
            if check.passed { "pass" } else { "FAIL" }.to_string(),
        ]);
    }
    println!("{}", table);
}

fn print_keep_details(topology: &assembler::Topology) {
    let user = topology.guest_user();
    println!("topology kept running as run {}", topology.run_prefix());
    for node in topology.node_summaries() {
        if let Some(port) = node.ssh_port {
            println!("  ssh -p {port} {user}@127.0.0.1   # {}", node.name);
        }
    }
    println!(
        "remove it later with: vmlab clean --prefix {}",
        topology.run_prefix()
    );
}

fn list_topologies() {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["NAME", "SUMMARY", "NODES", "SWITCHES", "CHECKS"]);
    for preset in presets::catalog() {
        let topo = preset.description();
        table.add_row(vec![
            preset.name.to_string(),
            preset.summary.to_string(),
            (topo.hosts.len() + topo.routers.len()).to_string(),
            topo.switches.len().to_string(),
            topo.checks.len().to_string(),
        ]);
    }
    println!("{}", table);
}

fn clean_leftovers(opts: CleanOpts) -> Result<()> {
    let run_dir = opts.work_dir.join(&opts.prefix);
    let summary = clean::clean_run(&opts.prefix, &run_dir)?;
    println!(
        "removed {} tap(s), {} bridge(s), {} overlay(s){}",
        summary.taps_removed,
        summary.bridges_removed,
        summary.overlays_removed,
        if summary.processes_killed {
            ", killed leftover hypervisors"
        } else {
            ""
        }
    );
    if summary.is_clean() {
        Ok(())
    } else {
        for failure in &summary.failures {
            error!("could not remove: {failure}");
        }
        Err(eyre!(
            "sweep left {} item(s) behind",
            summary.failures.len()
        ))
    }
}
