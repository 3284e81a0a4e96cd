mod tui;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::config::{FleetConfig, default_config_path};
use common::schemas::AuthEntry;
use fleet::runner::{CommandRunner, ProcessRunner};
use fleet::watcher::{FleetStats, FleetWatcher};

#[derive(Parser, Debug)]
#[command(version, about = "Accelerator-VM fleet launcher")]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Reconcile the fleet and monitor progress
    Run(RunArgs),
    /// Write the default config and exit
    Init,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Config file path (defaults to ~/.raleigh/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stream status lines to the log instead of drawing the TUI
    #[arg(long, default_value_t = false)]
    headless: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.cmd {
        Cmd::Init => {
            let path = default_config_path()?;
            let cfg = FleetConfig::load_or_init(&path)?;
            info!(path = %path.display(), nodes = cfg.num_nodes, "config ready");
            Ok(())
        }
        Cmd::Run(run_args) => run_fleet(run_args),
    }
}

fn run_fleet(args: RunArgs) -> anyhow::Result<()> {
    let runner = Arc::new(ProcessRunner);

    ensure_gcloud_auth(runner.as_ref()).context("checking gcloud credentials")?;

    let path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let cfg = FleetConfig::load_or_init(&path)?;
    cfg.validate()
        .with_context(|| format!("config at {}", path.display()))?;

    info!(
        nodes = cfg.num_nodes,
        active = cfg.num_active,
        project = %cfg.project,
        "starting fleet watcher"
    );
    let watcher = FleetWatcher::new(cfg, runner)?;

    if args.headless {
        headless_loop(&watcher)
    } else {
        tui::run(&watcher)
    }
}

/// Fail fast when no gcloud credential is active; try an interactive login
/// first, as the CLI would.
fn ensure_gcloud_auth(runner: &dyn CommandRunner) -> anyhow::Result<()> {
    let out = runner.run("gcloud", &to_args(&["auth", "list", "--format", "json"]))?;
    if !out.success() {
        bail!("gcloud auth list failed: {}", out.stderr);
    }
    let entries: Vec<AuthEntry> =
        serde_json::from_str(&out.stdout).context("parsing gcloud auth list")?;
    if entries.iter().any(|e| e.status == "ACTIVE") {
        return Ok(());
    }

    info!("no active gcloud credential; launching login");
    let login = runner.run("gcloud", &to_args(&["auth", "login"]))?;
    if !login.success() {
        bail!("gcloud auth login failed: {}", login.stderr);
    }
    Ok(())
}

/// Log one aggregate line per status update instead of drawing.
fn headless_loop(watcher: &FleetWatcher) -> anyhow::Result<()> {
    for update in watcher.updates().iter() {
        let stats = FleetStats::collect(watcher.statuses(), &update);
        match &stats.last_error {
            Some((id, message)) => info!(
                active = stats.active,
                installed = stats.installed,
                cloned = stats.cloned,
                running = stats.running,
                node = id,
                error = %message,
                "fleet status"
            ),
            None => info!(
                active = stats.active,
                installed = stats.installed,
                cloned = stats.cloned,
                running = stats.running,
                "fleet status"
            ),
        }
    }
    Ok(())
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
