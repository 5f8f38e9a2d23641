//! Resumable infrastructure bootstrap.
//!
//! Keeps its config and run state under `<root>/.provisioner/`. `create` walks
//! the fixed step pipeline, skipping every step whose completion flag is
//! already set, so re-running after a failure resumes at the failed step.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

use provisioner::core::types::GuardOutcome;
use provisioner::destroy::run_destroy;
use provisioner::error::{ProvisionError, find_kind};
use provisioner::exit_codes;
use provisioner::io::api::UreqApiClient;
use provisioner::io::config::{ProvisionerConfig, load_config};
use provisioner::io::init::{InitOptions, ProvisionerPaths, init_provisioner};
use provisioner::io::process::ProcessRunner;
use provisioner::io::run_state::RunState;
use provisioner::logging;
use provisioner::pipeline::{PipelineReport, StepEnv, run_pipeline};
use provisioner::status::{ResetTarget, captured_statuses, reset_flags, step_statuses};
use provisioner::steps::PIPELINE;

#[derive(Parser)]
#[command(
    name = "provisioner",
    version,
    about = "Resumable infrastructure bootstrap pipeline"
)]
struct Cli {
    /// Directory holding `.provisioner/` and the gitops tree.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.provisioner/config.toml` and an empty run state if missing.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run every pending step in order.
    Create {
        /// Log what would run without touching anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Tear down applied terraform modules in reverse order.
    Destroy {
        #[arg(long)]
        dry_run: bool,
    },
    /// Show which steps are complete and which values are captured.
    Status,
    /// Clear completion flags for manual recovery.
    Reset {
        /// Flag key to clear, e.g. `gitlab.keyuploaded`.
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        key: Option<String>,
        /// Clear every step flag (captured values are kept).
        #[arg(long)]
        all: bool,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            let kind = find_kind(&err).map_or("other", ProvisionError::kind);
            error!(kind, "provisioning aborted");
            eprintln!("error: {err:#}");
            exit_codes::FAILURE
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Create { dry_run } => cmd_create(&cli.root, dry_run),
        Command::Destroy { dry_run } => cmd_destroy(&cli.root, dry_run),
        Command::Status => cmd_status(&cli.root),
        Command::Reset { key, all } => {
            let target = match key {
                Some(key) if !all => ResetTarget::Key(key),
                _ => ResetTarget::All,
            };
            cmd_reset(&cli.root, &target)
        }
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let paths = init_provisioner(root, &InitOptions { force })?;
    println!("{}", paths.config_path.display());
    Ok(())
}

/// Config and state for commands that talk to remote systems.
fn load_workspace(root: &Path) -> Result<(ProvisionerPaths, ProvisionerConfig, RunState)> {
    let paths = ProvisionerPaths::new(root);
    if !paths.config_path.exists() {
        return Err(ProvisionError::Prerequisite(format!(
            "{} not found; run `provisioner init` first",
            paths.config_path.display()
        ))
        .into());
    }
    let config = load_config(&paths.config_path)?;
    config.require_account()?;
    let state = RunState::load(&paths.run_state_path)?;
    Ok((paths, config, state))
}

fn runners(config: &ProvisionerConfig) -> (ProcessRunner, UreqApiClient) {
    let runner = ProcessRunner {
        timeout: config.tools.command_timeout(),
        output_limit_bytes: config.tools.output_limit_bytes,
    };
    (runner, UreqApiClient::new(config.gitlab.http_timeout()))
}

fn cmd_create(root: &Path, dry_run: bool) -> Result<()> {
    let (paths, config, mut state) = load_workspace(root)?;
    let (runner, api) = runners(&config);
    let env = StepEnv {
        config: &config,
        paths: &paths,
        runner: &runner,
        api: &api,
    };
    let report = run_pipeline(&env, &mut state, PIPELINE, dry_run)?;
    print_report(&report);
    Ok(())
}

fn cmd_destroy(root: &Path, dry_run: bool) -> Result<()> {
    let (paths, config, mut state) = load_workspace(root)?;
    let (runner, api) = runners(&config);
    let env = StepEnv {
        config: &config,
        paths: &paths,
        runner: &runner,
        api: &api,
    };
    let report = run_destroy(&env, &mut state, dry_run)?;
    print_report(&report);
    Ok(())
}

fn cmd_status(root: &Path) -> Result<()> {
    let paths = ProvisionerPaths::new(root);
    let state = RunState::load(&paths.run_state_path)?;
    for step in step_statuses(&state) {
        let mark = if step.completed { "done" } else { "pending" };
        println!("{mark:<8} {:<32} {}", step.key, step.name);
    }
    for captured in captured_statuses(&state) {
        let mark = if captured.present { "set" } else { "unset" };
        println!("{mark:<8} {}", captured.key);
    }
    Ok(())
}

fn cmd_reset(root: &Path, target: &ResetTarget) -> Result<()> {
    let paths = ProvisionerPaths::new(root);
    let mut state = RunState::load(&paths.run_state_path)?;
    for key in reset_flags(&mut state, target)? {
        println!("cleared {key}");
    }
    Ok(())
}

fn print_report(report: &PipelineReport) {
    for step in &report.steps {
        println!("{:<9} {:<32} {}", step.outcome.as_str(), step.key, step.name);
    }
    if report.count(GuardOutcome::DryRun) > 0 {
        println!("dry run: no changes made");
    }
}
