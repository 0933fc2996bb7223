//! Pulse - build orchestration CLI
//!
//! The `pulse` command drives builds stored under the configured state
//! directory.
//!
//! ## Commands
//!
//! - `validate`: Check a plan without starting it
//! - `start`: Register a build from a plan file
//! - `tick`: Run one scheduling pass
//! - `status`: Show the build view
//! - `retry` / `ack`: Human decisions on failed drops
//! - `finalize`: Seal a completed build
//! - `pool`: Shared task pool operations

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pulse_core::{
    render_recovery_log, render_status, validate, BuildId, BuildPlan, BuildStatus, DepositRecord,
    DepositStatus, HypothesisVerdict, PulseConfig, PulseError, Scheduler, TickResult, Violation,
};
use pulse_state::{NewTask, PoolTask, TaskPool};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, Level};

const EXIT_OK: u8 = 0;
/// Validation failure or any error.
const EXIT_FAILED: u8 = 1;
/// A tick left its build blocked.
const EXIT_BLOCKED: u8 = 2;

#[derive(Parser)]
#[command(name = "pulse")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pulse build orchestration engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file (default: ./pulse.toml when present)
    #[arg(short, long, global = true, env = "PULSE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a plan file and list every problem found
    Validate {
        /// Path to the plan (JSON)
        plan: PathBuf,
    },

    /// Start a build from a plan file
    Start {
        /// Path to the plan (JSON)
        plan: PathBuf,

        /// Build id (default: the plan's id, else the file stem)
        #[arg(long)]
        id: Option<String>,
    },

    /// Run one tick of a build
    ///
    /// Ticks are serialized inside one process only. Run a single
    /// coordinator per state directory: `pulsed` or a scheduled
    /// `pulse tick`, not both at once.
    Tick {
        build: String,

        /// Print the tick result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show build status
    Status {
        build: String,

        /// Print the raw build view as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop a running or blocked build
    Stop { build: String },

    /// Resume a stopped or blocked build
    Resume { build: String },

    /// Retry a failed drop with corrected context
    Retry {
        build: String,
        drop: String,

        /// Context handed to the next attempt
        #[arg(short, long, default_value = "retry requested by operator")]
        reason: String,
    },

    /// Accept a failed drop so its wave can advance
    Ack { build: String, drop: String },

    /// Seal a completed build and write its summary
    Finalize { build: String },

    /// Show the recovery log of a build
    Log { build: String },

    /// Record a deposit on behalf of a worker
    Deposit {
        build: String,
        drop: String,

        #[arg(long, value_enum)]
        status: DepositArg,

        #[arg(long)]
        summary: String,

        /// Hypothesis verdict for racing drops
        #[arg(long, value_enum)]
        verdict: Option<VerdictArg>,

        /// Artifact path (repeatable)
        #[arg(long = "artifact")]
        artifacts: Vec<String>,
    },

    /// Shared task pool operations
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },
}

#[derive(Subcommand)]
enum PoolAction {
    /// Add a pending task
    Add {
        pool: String,
        task_id: String,

        #[arg(long = "type")]
        task_type: String,

        #[arg(long)]
        target: String,
    },

    /// Claim the oldest pending task for a worker
    Claim { pool: String, worker: String },

    /// Return a claimed task to pending
    Release {
        pool: String,
        task_id: String,
        worker: String,
    },

    /// Mark a claimed task complete
    Complete {
        pool: String,
        task_id: String,
        worker: String,
    },

    /// Mark a claimed task failed
    Fail {
        pool: String,
        task_id: String,
        worker: String,
    },

    /// List every task in a pool
    List {
        pool: String,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DepositArg {
    Complete,
    Blocked,
    Failed,
}

impl From<DepositArg> for DepositStatus {
    fn from(arg: DepositArg) -> Self {
        match arg {
            DepositArg::Complete => DepositStatus::Complete,
            DepositArg::Blocked => DepositStatus::Blocked,
            DepositArg::Failed => DepositStatus::Failed,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum VerdictArg {
    Confirmed,
    Rejected,
    Inconclusive,
}

impl From<VerdictArg> for HypothesisVerdict {
    fn from(arg: VerdictArg) -> Self {
        match arg {
            VerdictArg::Confirmed => HypothesisVerdict::Confirmed,
            VerdictArg::Rejected => HypothesisVerdict::Rejected,
            VerdictArg::Inconclusive => HypothesisVerdict::Inconclusive,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    pulse_core::init_tracing(cli.json_logs, level);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = PulseConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    debug!(state_dir = %config.state_dir.display(), "configuration loaded");

    match cli.command {
        Commands::Validate { plan } => cmd_validate(&plan),
        Commands::Pool { action } => {
            let pool = config
                .open_pool()
                .await
                .context("Failed to open task pool")?;
            cmd_pool(pool.as_ref(), action).await
        }
        Commands::Start { plan, id } => cmd_start(&open(&config).await?, &plan, id).await,
        Commands::Tick { build, json } => cmd_tick(&open(&config).await?, &build, json).await,
        Commands::Status { build, json } => cmd_status(&open(&config).await?, &build, json).await,
        Commands::Stop { build } => cmd_stop(&open(&config).await?, &build).await,
        Commands::Resume { build } => cmd_resume(&open(&config).await?, &build).await,
        Commands::Retry {
            build,
            drop,
            reason,
        } => cmd_retry(&open(&config).await?, &build, &drop, &reason).await,
        Commands::Ack { build, drop } => cmd_ack(&open(&config).await?, &build, &drop).await,
        Commands::Finalize { build } => cmd_finalize(&open(&config).await?, &build).await,
        Commands::Log { build } => cmd_log(&open(&config).await?, &build).await,
        Commands::Deposit {
            build,
            drop,
            status,
            summary,
            verdict,
            artifacts,
        } => {
            let mut deposit = DepositRecord::new(drop, status.into(), summary);
            deposit.verdict = verdict.map(Into::into);
            deposit.artifacts = artifacts;
            cmd_deposit(&open(&config).await?, &build, deposit).await
        }
    }
}

async fn open(config: &PulseConfig) -> Result<Scheduler> {
    config.open_scheduler().await.with_context(|| {
        format!(
            "Failed to open state directory {}",
            config.state_dir.display()
        )
    })
}

fn print_violations(violations: &[Violation]) {
    println!("{} violation(s):", violations.len());
    for v in violations {
        println!("  - {v}");
    }
}

/// Validate a plan file
fn cmd_validate(path: &Path) -> Result<u8> {
    let plan = BuildPlan::from_file(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    let report = validate(&plan);
    if report.is_valid() {
        println!(
            "Plan {} is valid: {} wave(s), {} drop(s)",
            plan.id,
            plan.waves.len(),
            plan.drops.len()
        );
        Ok(EXIT_OK)
    } else {
        println!("Plan {} is invalid", plan.id);
        print_violations(&report.violations);
        Ok(EXIT_FAILED)
    }
}

/// Start a build
async fn cmd_start(scheduler: &Scheduler, path: &Path, id: Option<String>) -> Result<u8> {
    let mut plan = BuildPlan::from_file(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    if let Some(id) = id {
        plan.id = id;
    }
    let (waves, drops) = (plan.waves.len(), plan.drops.len());

    match scheduler.start(plan).await {
        Ok(view) => {
            println!(
                "Started build {} ({} drop(s) across {} wave(s))",
                view.build_id, drops, waves
            );
            Ok(EXIT_OK)
        }
        Err(PulseError::MalformedPlan { violations }) => {
            println!("Build not started: plan is malformed");
            print_violations(&violations);
            Ok(EXIT_FAILED)
        }
        Err(e) => Err(e).context("Failed to start build"),
    }
}

fn print_tick(result: &TickResult) {
    println!("Tick {}: {}", result.build_id, result.build_status);
    if result.is_noop() {
        println!("  no changes");
        return;
    }
    for change in &result.status_changes {
        println!("  {}: {} -> {}", change.drop_id, change.from, change.to);
    }
    for drop_id in &result.spawned {
        println!("  spawned {drop_id}");
    }
    for launcher in &result.launchers {
        println!("  launcher for {}: {}", launcher.drop_id, launcher.path);
    }
    for entry in &result.recovery {
        println!(
            "  {} {} {}: {}",
            entry.rule,
            entry.action,
            entry.drop_id.as_deref().unwrap_or("-"),
            entry.reason
        );
    }
    for wave in &result.waves_advanced {
        println!("  wave {wave} is now active");
    }
}

/// Run one tick
async fn cmd_tick(scheduler: &Scheduler, build: &str, json: bool) -> Result<u8> {
    let result = scheduler
        .tick(&BuildId::new(build))
        .await
        .with_context(|| format!("Tick of {build} failed"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_tick(&result);
    }

    if result.build_status == BuildStatus::Blocked {
        Ok(EXIT_BLOCKED)
    } else {
        Ok(EXIT_OK)
    }
}

/// Show build status
async fn cmd_status(scheduler: &Scheduler, build: &str, json: bool) -> Result<u8> {
    let id = BuildId::new(build);
    let view = scheduler
        .status(&id)
        .await
        .with_context(|| format!("Failed to load build {build}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        let plan = scheduler.plan(&id).await?;
        print!("{}", render_status(&plan, &view));
    }
    Ok(EXIT_OK)
}

async fn cmd_stop(scheduler: &Scheduler, build: &str) -> Result<u8> {
    let view = scheduler
        .stop(&BuildId::new(build))
        .await
        .with_context(|| format!("Failed to stop {build}"))?;
    println!("Build {}: {}", view.build_id, view.status);
    Ok(EXIT_OK)
}

async fn cmd_resume(scheduler: &Scheduler, build: &str) -> Result<u8> {
    let view = scheduler
        .resume(&BuildId::new(build))
        .await
        .with_context(|| format!("Failed to resume {build}"))?;
    println!("Build {}: {}", view.build_id, view.status);
    Ok(EXIT_OK)
}

/// Queue a failed drop for another attempt
async fn cmd_retry(scheduler: &Scheduler, build: &str, drop: &str, reason: &str) -> Result<u8> {
    let view = scheduler
        .retry(&BuildId::new(build), drop, reason)
        .await
        .with_context(|| format!("Failed to retry {drop} in {build}"))?;
    let attempt = view.drop_view(drop).map(|d| d.attempt).unwrap_or_default();
    println!("Queued {drop} for attempt {attempt}; build {}", view.status);
    Ok(EXIT_OK)
}

async fn cmd_ack(scheduler: &Scheduler, build: &str, drop: &str) -> Result<u8> {
    let view = scheduler
        .acknowledge(&BuildId::new(build), drop)
        .await
        .with_context(|| format!("Failed to acknowledge {drop} in {build}"))?;
    println!("Acknowledged {drop}; build {}", view.status);
    Ok(EXIT_OK)
}

/// Seal a completed build
async fn cmd_finalize(scheduler: &Scheduler, build: &str) -> Result<u8> {
    let summary = scheduler
        .finalize(&BuildId::new(build))
        .await
        .with_context(|| format!("Failed to finalize {build}"))?;

    println!(
        "Finalized {}: {} drop(s), {} recovery action(s), {} escalation(s)",
        summary.build_id,
        summary.drops.len(),
        summary.recovery_actions,
        summary.escalations
    );
    if let Some(secs) = summary.duration_secs {
        println!("Duration:     {secs}s");
    }
    println!("Events:       {}", summary.event_count);
    println!("Event digest: {}", summary.events_digest);
    for (group, winner) in &summary.hypothesis_winners {
        println!("Hypothesis {group}: {winner}");
    }
    Ok(EXIT_OK)
}

async fn cmd_log(scheduler: &Scheduler, build: &str) -> Result<u8> {
    let entries = scheduler
        .recovery_log(&BuildId::new(build))
        .await
        .with_context(|| format!("Failed to read recovery log of {build}"))?;
    print!("{}", render_recovery_log(&entries));
    Ok(EXIT_OK)
}

async fn cmd_deposit(scheduler: &Scheduler, build: &str, deposit: DepositRecord) -> Result<u8> {
    let drop_id = deposit.drop_id.clone();
    scheduler
        .deposit(&BuildId::new(build), deposit)
        .await
        .with_context(|| format!("Failed to record deposit for {drop_id}"))?;
    println!("Deposit recorded for {drop_id}; it is judged on the next tick");
    Ok(EXIT_OK)
}

fn print_task(task: &PoolTask) {
    println!(
        "{}\t{}\t{}\t{}\t{}",
        task.task_id,
        task.status.as_str(),
        task.task_type,
        task.target,
        task.claimant.as_deref().unwrap_or("-")
    );
}

async fn cmd_pool(pool: &dyn TaskPool, action: PoolAction) -> Result<u8> {
    match action {
        PoolAction::Add {
            pool: name,
            task_id,
            task_type,
            target,
        } => {
            let task = pool
                .add(&name, NewTask::new(task_id, task_type, target))
                .await
                .context("Failed to add task")?;
            print_task(&task);
        }
        PoolAction::Claim { pool: name, worker } => {
            match pool.claim(&name, &worker).await.context("Failed to claim")? {
                Some(task) => print_task(&task),
                None => println!("No pending tasks in {name}"),
            }
        }
        PoolAction::Release {
            pool: name,
            task_id,
            worker,
        } => {
            let task = pool
                .release(&name, &task_id, &worker)
                .await
                .context("Failed to release task")?;
            print_task(&task);
        }
        PoolAction::Complete {
            pool: name,
            task_id,
            worker,
        } => {
            let task = pool
                .complete(&name, &task_id, &worker)
                .await
                .context("Failed to complete task")?;
            print_task(&task);
        }
        PoolAction::Fail {
            pool: name,
            task_id,
            worker,
        } => {
            let task = pool
                .fail(&name, &task_id, &worker)
                .await
                .context("Failed to mark task failed")?;
            print_task(&task);
        }
        PoolAction::List { pool: name, json } => {
            let tasks = pool.list(&name).await.context("Failed to list tasks")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                println!("Pool {name} is empty");
            } else {
                tasks.iter().for_each(print_task);
            }
        }
    }
    Ok(EXIT_OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_state::fakes::MemoryTaskPool;
    use pulse_state::TaskStatus;

    const MANUAL_PLAN: &str = r#"{
        "waves": { "W1": ["review"] },
        "drops": { "review": { "name": "Review", "spawn_mode": "manual" } }
    }"#;

    fn config_in(dir: &Path) -> PulseConfig {
        PulseConfig {
            state_dir: dir.join("state"),
            release_pool_tasks: false,
            ..PulseConfig::default()
        }
    }

    #[test]
    fn tick_help_warns_about_concurrent_coordinators() {
        use clap::CommandFactory;
        let mut cli = Cli::command();
        let tick = cli.find_subcommand_mut("tick").expect("tick subcommand");
        let help = tick.render_long_help().to_string();
        assert!(help.contains("single\ncoordinator") || help.contains("single coordinator"));
        assert!(help.contains("not both at once"));
    }

    #[test]
    fn cli_parses_deposit_flags() {
        let cli = Cli::try_parse_from([
            "pulse",
            "deposit",
            "b1",
            "h1",
            "--status",
            "complete",
            "--summary",
            "found it",
            "--verdict",
            "confirmed",
            "--artifact",
            "out/a.txt",
            "--artifact",
            "out/b.txt",
        ])
        .expect("parse");
        match cli.command {
            Commands::Deposit {
                verdict, artifacts, ..
            } => {
                assert!(matches!(verdict, Some(VerdictArg::Confirmed)));
                assert_eq!(artifacts, vec!["out/a.txt", "out/b.txt"]);
            }
            _ => panic!("expected deposit"),
        }
    }

    #[test]
    fn validate_fails_on_broken_plan() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        std::fs::write(
            &path,
            r#"{ "waves": { "W1": ["a"] }, "drops": { "a": { "name": "A", "depends_on": ["a"] } } }"#,
        )
        .expect("write");
        assert_eq!(cmd_validate(&path).expect("validate"), EXIT_FAILED);

        let good = dir.path().join("good.json");
        std::fs::write(&good, MANUAL_PLAN).expect("write");
        assert_eq!(cmd_validate(&good).expect("validate"), EXIT_OK);
    }

    #[tokio::test]
    async fn manual_build_runs_to_finalize() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plan = dir.path().join("review-42.json");
        std::fs::write(&plan, MANUAL_PLAN).expect("write plan");
        let scheduler = config_in(dir.path())
            .open_scheduler()
            .await
            .expect("scheduler");

        assert_eq!(
            cmd_start(&scheduler, &plan, None).await.expect("start"),
            EXIT_OK
        );
        assert_eq!(
            cmd_tick(&scheduler, "review-42", false).await.expect("tick"),
            EXIT_OK
        );

        let deposit = DepositRecord::new("review", DepositStatus::Complete, "approved");
        cmd_deposit(&scheduler, "review-42", deposit)
            .await
            .expect("deposit");
        cmd_tick(&scheduler, "review-42", true).await.expect("tick");

        let view = scheduler
            .status(&BuildId::new("review-42"))
            .await
            .expect("status");
        assert_eq!(view.status, BuildStatus::Complete);
        cmd_finalize(&scheduler, "review-42").await.expect("finalize");
        assert!(dir
            .path()
            .join("state/builds/review-42/summary.json")
            .is_file());
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plan = dir.path().join("p.json");
        std::fs::write(&plan, MANUAL_PLAN).expect("write plan");
        let scheduler = config_in(dir.path())
            .open_scheduler()
            .await
            .expect("scheduler");

        cmd_start(&scheduler, &plan, Some("twice".into()))
            .await
            .expect("first start");
        let err = cmd_start(&scheduler, &plan, Some("twice".into()))
            .await
            .expect_err("second start");
        assert!(format!("{err:#}").contains("already exists"));
    }

    #[tokio::test]
    async fn pool_commands_round_through_the_pool() {
        let pool = MemoryTaskPool::new();
        let add = PoolAction::Add {
            pool: "p".into(),
            task_id: "t1".into(),
            task_type: "lint".into(),
            target: "src/lib.rs".into(),
        };
        cmd_pool(&pool, add).await.expect("add");
        cmd_pool(
            &pool,
            PoolAction::Claim {
                pool: "p".into(),
                worker: "w1".into(),
            },
        )
        .await
        .expect("claim");
        cmd_pool(
            &pool,
            PoolAction::Complete {
                pool: "p".into(),
                task_id: "t1".into(),
                worker: "w1".into(),
            },
        )
        .await
        .expect("complete");

        let tasks = pool.list("p").await.expect("list");
        assert_eq!(tasks[0].status, TaskStatus::Complete);
        assert!(cmd_pool(
            &pool,
            PoolAction::Fail {
                pool: "p".into(),
                task_id: "t1".into(),
                worker: "w2".into(),
            },
        )
        .await
        .is_err());
    }
}
