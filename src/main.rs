use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use orchestra::config::Config;
use orchestra::core::TaskBoard;
use orchestra::orchestration::{
    CommandExecutor, Coordinator, ModePreference, SynthesizedResult, TaskOutcome,
};
use orchestra::workflow::{templates, Plan};
use orchestra::{Error, Result};

/// Orchestra - layered multi-worker task orchestration
#[derive(Parser, Debug)]
#[command(name = "orchestra")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    ORCHESTRA_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG=...        Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging (to stderr)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a plan file
    Run {
        /// Path to the plan TOML
        plan: PathBuf,

        /// auto, concurrent (team) or sequential
        #[arg(long)]
        mode: Option<ModePreference>,

        /// Print the synthesized result as JSON
        #[arg(long)]
        json: bool,

        /// Abort the run after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Maximum concurrent workers
        #[arg(long)]
        workers: Option<usize>,

        /// Config file (default: ~/.orchestra/orchestra.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Check a plan and print its layers
    Validate {
        /// Path to the plan TOML
        plan: PathBuf,
    },

    /// List built-in workflow templates
    Templates,

    /// Print a plan for a goal from a template
    Plan {
        /// Template name (detected from the goal when omitted)
        #[arg(long, short = 't')]
        template: Option<String>,

        /// What the plan should achieve
        goal: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    orchestra::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Run {
            plan,
            mode,
            json,
            timeout,
            workers,
            config,
        } => run_plan(&plan, mode, json, timeout, workers, config.as_deref()),
        Command::Validate { plan } => validate_plan(&plan),
        Command::Templates => {
            list_templates();
            Ok(())
        }
        Command::Plan { template, goal } => print_plan(template.as_deref(), &goal),
    }
}

fn run_plan(
    path: &Path,
    mode: Option<ModePreference>,
    json: bool,
    timeout: Option<u64>,
    workers: Option<usize>,
    config_path: Option<&Path>,
) -> Result<()> {
    let config = match config_path {
        Some(p) => Config::load_from(p)?,
        None => Config::load()?,
    };
    let mut settings = config.run_settings();
    if let Some(mode) = mode {
        settings.mode = mode;
    }
    if let Some(secs) = timeout {
        settings.run_timeout = Some(Duration::from_secs(secs));
    }
    if let Some(workers) = workers {
        settings.max_workers = workers.max(1);
    }

    let plan = Plan::load(path)?;
    let working_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let executor = CommandExecutor::new().with_working_dir(working_dir);
    let coordinator = Coordinator::new(settings, Arc::new(executor));

    let rt = tokio::runtime::Runtime::new()?;
    match rt.block_on(coordinator.run_plan(plan)) {
        Ok(result) => {
            print_result(&result, json)?;
            Ok(())
        }
        Err(Error::RunAborted { cause, partial }) => {
            print_result(&partial, json)?;
            eprintln!("Run aborted: {}", cause);
            std::process::exit(2);
        }
        Err(e) => Err(e),
    }
}

fn print_result(result: &SynthesizedResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!(
        "Run {} ({}): {} completed, {} failed, {} cancelled in {:.1}s",
        result.run_id.short(),
        result.mode,
        result.completed.len(),
        result.failed.len(),
        result.cancelled.len(),
        result.duration().as_secs_f64()
    );
    for outcome in result
        .completed
        .iter()
        .chain(&result.failed)
        .chain(&result.cancelled)
    {
        println!("  {}", format_outcome(outcome));
    }
    if !result.follow_ups.is_empty() {
        println!();
        println!("Follow-ups:");
        for added in &result.follow_ups {
            println!(
                "  [L{}] {} ({}) after {}",
                added.layer, added.task_id, added.role, added.triggered_by
            );
        }
    }
    if !result.anomalies.is_empty() {
        println!();
        println!("Anomalies:");
        for anomaly in &result.anomalies {
            println!("  {}", serde_json::to_string(anomaly)?);
        }
    }
    Ok(())
}

fn format_outcome(outcome: &TaskOutcome) -> String {
    format!(
        "[L{}] {:<24} {:<18} {}",
        outcome.layer,
        outcome.task_id.as_str(),
        outcome.role.as_str(),
        outcome.status
    )
}

fn validate_plan(path: &Path) -> Result<()> {
    let plan = Plan::load(path)?;
    let goal = plan.goal.clone();
    let roles = plan.distinct_roles();
    let board = TaskBoard::from_tasks(plan.into_tasks())?;

    println!("Plan OK: {}", goal);
    println!("  {} tasks, {} distinct roles", board.len(), roles);
    for (layer, ids) in board.layers() {
        let ids: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        println!("  layer {}: {}", layer, ids.join(", "));
    }
    Ok(())
}

fn list_templates() {
    for template in templates::list() {
        let roles: Vec<String> = template.roles().iter().map(|r| r.to_string()).collect();
        println!("{:<24} {}", template.name, template.description);
        println!("{:<24} roles: {}", "", roles.join(", "));
    }
}

fn print_plan(template: Option<&str>, goal: &str) -> Result<()> {
    let template = match template {
        Some(name) => templates::get(name)
            .ok_or_else(|| Error::Validation(format!("unknown template: {}", name)))?,
        None => templates::detect(goal).ok_or_else(|| {
            Error::Validation(format!(
                "no template matches goal {:?}; pass --template",
                goal
            ))
        })?,
    };
    print!("{}", template.expand(goal).to_toml_string()?);
    Ok(())
}
