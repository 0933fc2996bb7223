use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pulse_core::{BuildStatus, PulseConfig, Scheduler, METRICS};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Level};

#[derive(Parser)]
#[command(name = "pulsed")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tick every running Pulse build on an interval")]
#[command(long_about = "Tick every running Pulse build on an interval.\n\n\
Ticks are serialized inside this process only. Run one pulsed per state \
directory and do not schedule `pulse tick` against the same directory.")]
struct Args {
    /// Config file (default: ./pulse.toml when present)
    #[arg(short, long, env = "PULSE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json_logs: bool,

    /// Run a single round and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    pulse_core::init_tracing(args.json_logs, Level::INFO);

    let config = PulseConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let scheduler = config
        .open_scheduler()
        .await
        .context("Failed to open state directory")?;

    info!(
        state_dir = %config.state_dir.display(),
        interval_secs = config.tick_interval().as_secs(),
        "pulsed started"
    );

    let mut interval = tokio::time::interval(config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = tick_running(&scheduler).await {
                    error!(error = %format!("{e:#}"), "tick round failed");
                }
                if args.once {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    METRICS.flush();
    Ok(())
}

/// Tick every running build once. A failing build is logged and skipped.
async fn tick_running(scheduler: &Scheduler) -> Result<usize> {
    let builds = scheduler
        .running_builds()
        .await
        .context("Failed to list running builds")?;

    let mut ticked = 0;
    for build in builds {
        match scheduler.tick(&build).await {
            Ok(result) => {
                ticked += 1;
                if result.build_status == BuildStatus::Blocked {
                    warn!(build_id = %build, "build is blocked awaiting a human decision");
                } else if !result.is_noop() {
                    debug!(build_id = %build, events = result.events_appended, "tick applied");
                }
            }
            Err(e) => error!(build_id = %build, error = %e, "tick failed"),
        }
    }
    METRICS.flush();
    Ok(ticked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{
        BuildId, BuildPlan, CollectingChannel, CommandSpawner, DepositStatusOracle, DropSpec,
        DropStatus, Stores,
    };
    use std::sync::Arc;

    fn scheduler(dir: &std::path::Path) -> Scheduler {
        Scheduler::new(
            Stores::in_memory(),
            Arc::new(DepositStatusOracle),
            Arc::new(CommandSpawner::new(dir, Vec::new())),
            Arc::new(CollectingChannel::new()),
        )
    }

    fn manual_plan(id: &str) -> BuildPlan {
        let mut plan = BuildPlan::new(id);
        plan.add_wave("W1", &["review"])
            .add_drop("review", DropSpec::new("Review").manual());
        plan
    }

    #[test]
    fn long_help_names_the_one_coordinator_rule() {
        use clap::CommandFactory;
        let help = Args::command().render_long_help().to_string();
        assert!(help.contains("one pulsed per state directory"));
    }

    #[tokio::test]
    async fn only_running_builds_are_ticked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = scheduler(dir.path());
        s.start(manual_plan("live")).await.expect("start live");
        s.start(manual_plan("parked")).await.expect("start parked");
        s.stop(&BuildId::new("parked")).await.expect("stop");

        assert_eq!(tick_running(&s).await.expect("round"), 1);
        let live = s.status(&BuildId::new("live")).await.expect("live");
        assert_eq!(live.status_of("review"), Some(DropStatus::AwaitingManual));
        let parked = s.status(&BuildId::new("parked")).await.expect("parked");
        assert_eq!(parked.status_of("review"), Some(DropStatus::Pending));
    }
}
