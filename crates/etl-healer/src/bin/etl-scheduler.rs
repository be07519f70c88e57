//! Scheduled entry point of the inventory pipeline.
//!
//! Exit codes: 0 success or skipped, 1 execution failure, 2 initialisation
//! failure, 3 lock failure.

use anyhow::{Context, Result};
use clap::Parser;
use etl_config::HealerConfig;
use etl_healer::{
    logging, Filters, GateReason, HealerError, LockManager, RunKind, RunOptions, RunStatus, ScheduleGate, Services,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

const EXIT_EXECUTION: u8 = 1;
const EXIT_INIT: u8 = 2;
const EXIT_LOCK: u8 = 3;

/// Run the inventory ETL pipeline if the schedule allows it.
#[derive(Parser, Debug)]
#[command(name = "etl-scheduler", version, about = "Run the inventory ETL pipeline")]
struct Cli {
    /// Run now as a manual run, ignoring the schedule window
    #[arg(long)]
    manual: bool,

    /// Run now even if today's run already succeeded
    #[arg(long)]
    force: bool,

    /// Extract and filter without loading or snapshotting
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,

    /// Only process records of this warehouse
    #[arg(long, value_name = "NAME")]
    warehouse: Option<String>,

    /// Only process records of this product SKU
    #[arg(long, value_name = "SKU")]
    product: Option<String>,

    /// Configuration file (defaults to $ETL_HEALER_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn init(cli: &Cli) -> Result<(Services, tracing_appender::non_blocking::WorkerGuard)> {
    let config = HealerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let guard = logging::init("etl-scheduler", &config.paths.log_dir(), cli.verbose)
        .context("failed to initialise logging")?;
    let services = Services::open(config).context("failed to open state store")?;
    if services.config.pipeline.sources.is_empty() {
        anyhow::bail!("no pipeline sources configured");
    }
    Ok((services, guard))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (services, _guard) = match init(&cli) {
        Ok(initialised) => initialised,
        Err(e) => {
            logging::init_console(cli.verbose);
            error!("Initialisation failed: {e:#}");
            return ExitCode::from(EXIT_INIT);
        }
    };

    match run(&cli, &services).await {
        Ok(code) => code,
        Err(e) => {
            error!("Pipeline run failed: {e:#}");
            ExitCode::from(EXIT_EXECUTION)
        }
    }
}

async fn run(cli: &Cli, services: &Services) -> Result<ExitCode> {
    let target = match services.config.schedule.target_time() {
        Ok(target) => target,
        Err(e) => {
            error!("Invalid schedule: {e}");
            return Ok(ExitCode::from(EXIT_INIT));
        }
    };
    let gate = ScheduleGate::new(
        services.store.clone(),
        target,
        services.config.schedule.window_minutes,
    );

    let bypass = cli.manual || cli.force;
    let decision = gate.should_run(bypass).context("schedule gate check failed")?;
    if !decision.should_run {
        info!(reason = %decision, "Skipping run");
        return Ok(ExitCode::SUCCESS);
    }
    info!(reason = %decision, "Schedule gate passed");

    let kind = if cli.manual {
        RunKind::Manual
    } else if matches!(decision.reason, GateReason::RestartRequested { .. }) {
        RunKind::Restart
    } else {
        RunKind::Scheduled
    };

    let holder = match services.lock.acquire() {
        Ok(holder) => holder,
        Err(e @ HealerError::LockHeld { .. }) => {
            warn!("Another run is in progress: {e}");
            return Ok(ExitCode::from(EXIT_LOCK));
        }
        Err(e) => {
            error!("Failed to acquire execution lock: {e}");
            return Ok(ExitCode::from(EXIT_LOCK));
        }
    };
    info!(pid = holder.pid, host = %holder.host, "Execution lock acquired");

    let options = RunOptions {
        kind,
        dry_run: cli.dry_run,
        filters: Filters {
            warehouse: cli.warehouse.clone(),
            product: cli.product.clone(),
        },
        consume_restarts: !cli.dry_run,
    };
    let result = services.pipeline().run(&options).await;

    if let Err(e) = services.lock.release() {
        warn!("Failed to release execution lock: {e}");
    }

    let summary = result.context("pipeline run aborted")?;
    for source in &summary.sources {
        info!(
            source = %source.name,
            status = ?source.status,
            extracted = source.extracted,
            saved = source.saved,
            error = ?source.error,
            "Source result"
        );
    }

    Ok(match summary.run.status {
        RunStatus::Failed => ExitCode::from(EXIT_EXECUTION),
        _ => ExitCode::SUCCESS,
    })
}
