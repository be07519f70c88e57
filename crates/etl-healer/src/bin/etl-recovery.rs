//! Operator tool for inspecting and repairing the inventory pipeline.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser, ValueEnum};
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Confirm};
use etl_config::HealerConfig;
use etl_healer::manual::{CleanupReport, StatusReport};
use etl_healer::{logging, AuditLog, AuditRecord, HealthStatus, ManualRecovery, RunId, Services, StoreLoader};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum Command {
    /// Lock state, runs, retries, errors and monitor status
    #[default]
    Status,
    /// Force-remove the execution lock and running flag
    ClearLocks,
    /// Close open retries and resolve critical errors
    ResetFailed,
    /// Purge data past its retention period
    Cleanup,
    /// Stop, clear locks, reset failures and schedule a restart
    ForceRestart,
    /// Stop the monitor and fail running runs
    EmergencyStop,
    /// Replay cached data into live tables
    RestoreFallback,
    /// Run a one-off health assessment
    HealthCheck,
    /// Print usage
    Help,
}

impl Command {
    fn name(self) -> String {
        self.to_possible_value()
            .map(|v| v.get_name().to_string())
            .unwrap_or_default()
    }

    const fn is_destructive(self) -> bool {
        matches!(
            self,
            Self::ClearLocks
                | Self::ResetFailed
                | Self::Cleanup
                | Self::ForceRestart
                | Self::EmergencyStop
                | Self::RestoreFallback
        )
    }
}

/// Manual recovery for the inventory ETL pipeline.
#[derive(Parser, Debug)]
#[command(name = "etl-recovery", version, about = "Manual recovery for the inventory ETL pipeline")]
struct Cli {
    #[arg(value_enum, default_value_t = Command::Status)]
    command: Command,

    /// Scope reset-failed and force-restart to one run
    #[arg(long, value_name = "ID")]
    etl_id: Option<RunId>,

    /// Skip confirmation prompts
    #[arg(long)]
    force: bool,

    /// Show what would change without changing it
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,

    /// Configuration file (defaults to $ETL_HEALER_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl Cli {
    fn flags(&self) -> serde_json::Value {
        json!({
            "etl_id": self.etl_id,
            "force": self.force,
            "dry_run": self.dry_run,
        })
    }

    fn audit_record(&self, outcome: impl Into<String>) -> AuditRecord {
        AuditRecord::new(&self.command.name(), self.flags(), outcome, Utc::now())
    }
}

/// Audit an invocation that never reached the state store.
fn audit_without_store(path: &Path, cli: &Cli, outcome: String) {
    if let Err(e) = AuditLog::file_only(path).append(&cli.audit_record(outcome)) {
        eprintln!("{} failed to write audit record: {e}", "!".yellow());
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("{} {e:#}", "✗".red());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = match HealerConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let path = HealerConfig::defaults_from_env().paths.audit_log();
            audit_without_store(&path, cli, format!("failed: {e}"));
            return Err(e).context("failed to load configuration");
        }
    };
    let audit_path = config.paths.audit_log();
    let _guard = match logging::init("etl-recovery", &config.paths.log_dir(), cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            audit_without_store(&audit_path, cli, format!("failed: {e}"));
            return Err(e).context("failed to initialise logging");
        }
    };
    let services = match Services::open(config) {
        Ok(services) => services,
        Err(e) if cli.command == Command::Help => {
            warn!(error = %e, "State store unavailable, audit record not mirrored");
            Cli::command().print_long_help()?;
            audit_without_store(&audit_path, cli, "ok".to_string());
            return Ok(());
        }
        Err(e) => {
            audit_without_store(&audit_path, cli, format!("failed: {e}"));
            return Err(e).context("failed to open state store");
        }
    };
    let audit = AuditLog::new(audit_path, services.store.clone());

    if cli.command == Command::Help {
        Cli::command().print_long_help()?;
        audit.append(&cli.audit_record("ok"))?;
        return Ok(());
    }

    let tool = services.manual();
    if cli.command.is_destructive() && !cli.dry_run && !cli.force && !confirm(cli.command)? {
        println!("{}", "Cancelled.".yellow());
        audit.append(&cli.audit_record("aborted"))?;
        return Ok(());
    }

    let result = execute(cli, &services, &tool).await;
    let outcome = match (&result, cli.dry_run) {
        (Ok(()), true) => "dry_run".to_string(),
        (Ok(()), false) => "ok".to_string(),
        (Err(e), _) => format!("failed: {e:#}"),
    };
    audit.append(&cli.audit_record(outcome))?;
    result
}

fn confirm(command: Command) -> Result<bool> {
    let proceed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Run {}?", command.name()))
        .default(false)
        .interact()?;
    Ok(proceed)
}

fn dry_run_banner(dry_run: bool) {
    if dry_run {
        println!("{}", "DRY RUN: nothing will be changed".cyan().bold());
    }
}

async fn execute(cli: &Cli, services: &Services, tool: &ManualRecovery) -> Result<()> {
    let now = Utc::now();
    match cli.command {
        Command::Status => print_status(&tool.status()?),
        Command::ClearLocks => {
            dry_run_banner(cli.dry_run);
            let report = tool.clear_locks(cli.dry_run)?;
            match (&report.before.holder, report.before.is_held()) {
                (Some(holder), true) => println!("Lock held by pid {} on {}", holder.pid, holder.host),
                (Some(holder), false) => println!("Stale lock from dead pid {}", holder.pid),
                (None, _) if report.before.flag.is_running => println!("Running flag set without lock file"),
                (None, _) => println!("No lock present"),
            }
            if let Some(cleared) = report.cleared {
                println!(
                    "{} lock file removed: {}, running flag cleared: {}",
                    "✓".green(),
                    cleared.file_removed,
                    cleared.flag_cleared
                );
            }
        }
        Command::ResetFailed => {
            dry_run_banner(cli.dry_run);
            let report = tool.reset_failed(cli.etl_id, cli.dry_run, now)?;
            println!(
                "{} {} retry attempts closed, {} critical errors resolved",
                "✓".green(),
                report.attempts_closed,
                report.errors_resolved
            );
        }
        Command::Cleanup => {
            dry_run_banner(cli.dry_run);
            print_cleanup(&tool.cleanup(cli.dry_run, now)?);
        }
        Command::ForceRestart => {
            dry_run_banner(cli.dry_run);
            let report = tool.force_restart(cli.etl_id, cli.dry_run, now).await?;
            println!("  runs failed:      {}", report.stop.failed_runs.len());
            println!("  retries closed:   {}", report.reset.attempts_closed);
            println!("  errors resolved:  {}", report.reset.errors_resolved);
            if let Some(restart) = report.restart {
                println!(
                    "{} restart {} scheduled for {}",
                    "✓".green(),
                    restart.id,
                    restart.run_after.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        Command::EmergencyStop => {
            dry_run_banner(cli.dry_run);
            let report = tool.emergency_stop(cli.dry_run, now).await?;
            match report.daemon_pid {
                Some(pid) if report.daemon_forced => println!("{} monitor pid {pid} force-killed", "!".yellow()),
                Some(pid) => println!("{} monitor pid {pid} stopped", "✓".green()),
                None => println!("Monitor not running"),
            }
            println!("  runs marked failed: {:?}", report.failed_runs);
            println!("  running flag cleared: {}", report.flag_cleared);
        }
        Command::RestoreFallback => {
            dry_run_banner(cli.dry_run);
            let loader = StoreLoader::new(services.store.clone());
            let report = tool.restore_fallback(&loader, cli.dry_run, now).await?;
            if report.entries.is_empty() {
                println!("No fallback data within {}h", services.config.recovery.fallback_max_age_hours);
            }
            for entry in &report.entries {
                let mark = match &entry.error {
                    None => "✓".green(),
                    Some(_) => "✗".red(),
                };
                println!(
                    "{mark} {}/{} ({} records){}",
                    entry.data_type,
                    entry.data_key,
                    entry.records,
                    entry.error.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
                );
            }
            if report.failed() > 0 {
                anyhow::bail!("{} fallback entries could not be restored", report.failed());
            }
        }
        Command::HealthCheck => {
            let report = tool.health_check();
            let overall = match report.overall {
                HealthStatus::Healthy => report.overall.as_str().green(),
                HealthStatus::Warning => report.overall.as_str().yellow(),
                HealthStatus::Critical => report.overall.as_str().red(),
            };
            println!("Overall: {}", overall.bold());
            for check in &report.checks {
                println!("  {:<18} {:<9} {}", check.name, check.status.as_str(), check.message);
            }
            for recommendation in &report.recommendations {
                println!("  → {recommendation}");
            }
        }
        Command::Help => {}
    }
    Ok(())
}

fn print_status(status: &StatusReport) {
    println!("{}", "Execution lock".bold());
    match &status.lock.holder {
        Some(holder) if status.lock.holder_alive => {
            println!("  held by pid {} on {} since {}", holder.pid, holder.host, holder.started_at);
        }
        Some(holder) => println!("  {} stale lock from dead pid {}", "!".yellow(), holder.pid),
        None if status.lock.corrupt => println!("  {} unreadable lock file", "!".yellow()),
        None => println!("  free"),
    }
    if status.lock.flag.is_running {
        println!(
            "  running flag: pid {:?} run {:?}{}",
            status.lock.flag.pid,
            status.lock.flag.run_id,
            if status.lock.flag_holder_alive { "" } else { " (holder dead)" }
        );
    }

    println!("{}", "Runs".bold());
    for run in &status.recent_runs {
        let state = match run.status.as_str() {
            "success" => run.status.as_str().green(),
            "running" => run.status.as_str().cyan(),
            "partial_success" => run.status.as_str().yellow(),
            _ => run.status.as_str().red(),
        };
        println!(
            "  #{:<5} {:<9} {:<16} {}  extracted {} saved {}",
            run.id,
            run.kind.as_str(),
            state,
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.records_extracted,
            run.records_saved
        );
    }

    println!("{} ({})", "Active retries".bold(), status.active_retries.len());
    for attempt in &status.active_retries {
        println!(
            "  run {} {} {} {}/{}{}",
            attempt.run_id,
            attempt.operation_type,
            attempt.error_type,
            attempt.attempt_number,
            attempt.max_attempts,
            if attempt.is_exhausted { " exhausted" } else { "" }
        );
    }

    println!("{} ({})", "Unresolved critical errors".bold(), status.unresolved_errors.len());
    for critical in &status.unresolved_errors {
        println!(
            "  #{} {} {}: {}",
            critical.id, critical.operation_type, critical.error_type, critical.message
        );
    }

    println!("{} ({})", "Pending restarts".bold(), status.pending_restarts.len());
    for restart in &status.pending_restarts {
        println!("  #{} after {}: {}", restart.id, restart.run_after, restart.reason);
    }

    println!("{}", "Health monitor".bold());
    match status.daemon_pid {
        Some(pid) => println!("  running (pid {pid})"),
        None => println!("  not running"),
    }
    println!(
        "  checks {} alerts {} last status {}",
        status.daemon_stats.checks_performed,
        status.daemon_stats.alerts_sent,
        status.daemon_stats.last_status.as_deref().unwrap_or("-")
    );
    if let Some(health) = &status.latest_health {
        println!("  last assessment {} at {}", health.overall_status, health.checked_at);
    }
}

fn print_cleanup(report: &CleanupReport) {
    println!("  retry attempts:   {}", report.retry_attempts);
    println!("  health results:   {}", report.health_results);
    println!("  alerts:           {}", report.alerts);
    println!("  runs:             {}", report.runs);
    println!("  critical errors:  {}", report.critical_errors);
    println!("  fallback entries: {}", report.fallback_entries);
    println!("  log rows:         {}", report.log_rows);
    println!("  temp files:       {} ({} bytes)", report.temp_files.removed, report.temp_files.bytes);
    println!("  log files:        {} ({} bytes)", report.log_files.removed, report.log_files.bytes);
    println!("{} {} rows total", "✓".green(), report.total_rows());
}
