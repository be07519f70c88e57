//! Background health monitor for the inventory pipeline.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use colored::Colorize;
use etl_config::HealerConfig;
use etl_healer::health::daemon::MonitorDaemon;
use etl_healer::{logging, process, PidMarker, Services};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Periodically assess pipeline health and alert operators.
#[derive(Parser, Debug)]
#[command(name = "health-monitor", version, about = "Monitor inventory ETL health")]
struct Cli {
    /// Seconds between checks (raised to the configured minimum)
    #[arg(long, value_name = "SECONDS")]
    interval: Option<u64>,

    /// Detach and keep running in the background
    #[arg(long, conflicts_with_all = ["stop", "status"])]
    daemon: bool,

    /// Stop a running monitor
    #[arg(long, conflicts_with = "status")]
    stop: bool,

    /// Show monitor status and statistics
    #[arg(long)]
    status: bool,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,

    /// Configuration file (defaults to $ETL_HEALER_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Arguments for the detached child: everything except `--daemon`.
    fn child_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(interval) = self.interval {
            args.push(format!("--interval={interval}"));
        }
        if self.verbose {
            args.push("--verbose".to_string());
        }
        if let Some(config) = &self.config {
            args.push(format!("--config={}", config.display()));
        }
        args
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = HealerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    if cli.daemon {
        logging::init_console(cli.verbose);
        let pid = process::spawn_detached(&cli.child_args())?;
        println!("{} health monitor started (pid {pid})", "✓".green());
        return Ok(());
    }

    let _guard = logging::init("health-monitor", &config.paths.log_dir(), cli.verbose)?;
    let services = Services::open(config).context("failed to open state store")?;
    let marker = PidMarker::new(services.config.paths.pid_file());

    if cli.status {
        return print_status(&services, &marker);
    }
    if cli.stop {
        return stop(&services, &marker).await;
    }

    if let Some(pid) = marker.live_pid(services.processes.as_ref())? {
        if pid != process::current_pid() {
            anyhow::bail!("health monitor already running with pid {pid}");
        }
    }

    let interval = services.config.health.effective_interval(cli.interval);
    if cli.interval.is_some_and(|requested| requested < interval) {
        warn!(requested = ?cli.interval, interval, "Interval raised to the configured minimum");
    }

    marker.write(process::current_pid())?;
    let daemon = MonitorDaemon::new(
        services.health_checker(),
        services.store.clone(),
        services.alert_gate(),
        Duration::from_secs(interval),
    );

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    let result = daemon.run(token).await;
    if let Err(e) = marker.remove() {
        warn!("Failed to remove PID marker: {e}");
    }
    let cycles = result?;
    info!(cycles, "Health monitor exited");
    Ok(())
}

fn print_status(services: &Services, marker: &PidMarker) -> Result<()> {
    let stats = services.store.daemon_stats()?;
    match marker.live_pid(services.processes.as_ref())? {
        Some(pid) => println!("{} running (pid {pid})", "●".green()),
        None => println!("{} not running", "●".red()),
    }

    let now = Utc::now();
    if let Some(uptime) = stats.uptime(now) {
        println!("  uptime:           {}m", uptime.num_minutes());
    }
    println!("  checks performed: {}", stats.checks_performed);
    println!("  alerts sent:      {}", stats.alerts_sent);
    if let Some(status) = &stats.last_status {
        let painted = match status.as_str() {
            "healthy" => status.green(),
            "warning" => status.yellow(),
            _ => status.red(),
        };
        println!("  last status:      {painted}");
    }
    if let Some(at) = stats.last_check_at {
        println!("  last check:       {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}

async fn stop(services: &Services, marker: &PidMarker) -> Result<()> {
    let Some(pid) = marker.live_pid(services.processes.as_ref())? else {
        marker.remove()?;
        println!("{} health monitor is not running", "●".yellow());
        return Ok(());
    };

    let timeout = Duration::from_secs(services.config.health.stop_timeout_secs);
    let forced = process::stop_process(services.processes.as_ref(), pid, timeout).await?;
    marker.remove()?;
    if forced {
        services.store.daemon_stopped(Utc::now())?;
        println!("{} health monitor (pid {pid}) force-killed", "!".yellow());
    } else {
        println!("{} health monitor (pid {pid}) stopped", "✓".green());
    }
    Ok(())
}

/// Cancel `token` on SIGTERM or Ctrl+C. SIGHUP is accepted and ignored.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use signal::unix::{signal, SignalKind};
        let (mut term, mut hup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(term), Ok(hup)) => (term, hup),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {e}");
                return std::future::pending::<()>().await;
            }
        };
        loop {
            tokio::select! {
                _ = term.recv() => break,
                _ = hup.recv() => info!("Received SIGHUP, reload is not supported; continuing"),
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        () = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
    token.cancel();
}
