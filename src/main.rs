//! resetguard: counter reset detection and correction
//!
//! Usage:
//!   resetguard --config resetguard.toml serve
//!   resetguard scan --group inverter-1 --start "2024-03-01 00:00" --end "2024-03-02 00:00"
//!   resetguard correct --group inverter-1 --start 2024-03-01 --end 2024-03-02 --out ledger.json
//!   resetguard reverse --report ledger.json
//!   resetguard simulate-reset --counter sensor.energy --at "2024-03-01 12:00" --drop 50
//!   some-feed | resetguard watch --group inverter-1
//!
//! Environment Variables:
//!   RESETGUARD_CONFIG - Path to TOML config file
//!   RESETGUARD_LOG_LEVEL - Log filter (default: resetguard_backend=info,tower_http=info)
//!   RESETGUARD_* - Config overrides, see `AppConfig::with_env_overrides`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use resetguard_backend::{
    api::create_router,
    config::AppConfig,
    models::{ReversalRequest, SessionRequest},
    monitor::state_change_lines,
    service::{MonitorStart, ResetGuard},
};

#[derive(Parser, Debug)]
#[command(name = "resetguard")]
#[command(about = "Detect and repair resets in cumulative counter statistics")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, env = "RESETGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `resetguard_backend=trace`
    #[arg(short, long, env = "RESETGUARD_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API
    Serve {
        /// Listen address, overrides `[server] bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Preview resets for a group without touching the store
    Scan {
        #[arg(long)]
        group: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Detect and correct resets for a group
    Correct {
        #[arg(long)]
        group: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Where to save the report; keep it to be able to reverse
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Undo the adjustments listed in a saved correction report
    Reverse {
        #[arg(long)]
        report: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Manufacture a reset on one counter
    SimulateReset {
        #[arg(long)]
        counter: String,
        /// Local time of the reset
        #[arg(long)]
        at: String,
        /// Amount to drop; omitted drops the counter to zero
        #[arg(long)]
        drop: Option<f64>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Watch a group's main counter, reading state changes as JSON lines on
    /// stdin and printing alerts as JSON lines on stdout
    Watch {
        #[arg(long)]
        group: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = match &cli.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            AppConfig::load(path)?
        }
        None => {
            info!("Using default configuration");
            AppConfig::default()
        }
    }
    .with_env_overrides();

    match cli.command {
        Command::Serve { bind } => serve(config, bind).await,
        Command::Scan {
            group,
            start,
            end,
            out,
        } => run_session(config, group, start, end, true, out.as_deref()).await,
        Command::Correct {
            group,
            start,
            end,
            out,
        } => run_session(config, group, start, end, false, out.as_deref()).await,
        Command::Reverse { report, out } => {
            let guard = ResetGuard::from_config(config)?;
            let content = std::fs::read_to_string(&report)
                .with_context(|| format!("read report {}", report.display()))?;
            let request: ReversalRequest = serde_json::from_str(&content).with_context(|| {
                format!("{} holds no adjustments to reverse", report.display())
            })?;
            let result = guard.handle_reversal(request).await;
            emit(&result, out.as_deref())?;
            if !result.success {
                bail!("{}", result.message);
            }
            Ok(())
        }
        Command::SimulateReset {
            counter,
            at,
            drop,
            out,
        } => {
            let guard = ResetGuard::from_config(config)?;
            let result = guard
                .handle_reversal(ReversalRequest::Simulate {
                    counter_id: counter,
                    reset_time: at,
                    drop_amount: drop,
                })
                .await;
            emit(&result, out.as_deref())?;
            if !result.success {
                bail!("{}", result.message);
            }
            Ok(())
        }
        Command::Watch { group } => watch(config, group).await,
    }
}

async fn serve(config: AppConfig, bind: Option<String>) -> Result<()> {
    let addr = bind.unwrap_or_else(|| config.server.bind.clone());
    let guard = Arc::new(ResetGuard::from_config(config)?);
    let _alerts = guard.start_alert_delivery();

    let app = create_router(guard.clone());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
        })
        .await
        .context("Server error")?;

    guard.monitors.shutdown();
    Ok(())
}

async fn run_session(
    config: AppConfig,
    group_id: String,
    start_time: String,
    end_time: String,
    dry_run: bool,
    out: Option<&Path>,
) -> Result<()> {
    let guard = ResetGuard::from_config(config)?;
    let report = guard
        .run_session(&SessionRequest {
            group_id,
            start_time,
            end_time,
            dry_run,
        })
        .await?;
    emit(&report, out)?;
    if let Some(error) = &report.error {
        bail!("{}", error);
    }
    Ok(())
}

async fn watch(config: AppConfig, group_id: String) -> Result<()> {
    let guard = ResetGuard::from_config(config)?;
    match guard.start_monitor(&group_id).await? {
        MonitorStart::Created(info) | MonitorStart::AlreadyRunning(info) => {
            info!(
                group_id = %info.group_id,
                counter_id = %info.counter_id,
                "Watching state changes from stdin"
            );
        }
        MonitorStart::UnknownGroup => bail!("unknown group {}", group_id),
        MonitorStart::NoMainCounter => bail!("group {} has no main counter", group_id),
    }

    let mut alerts = guard.monitors.subscribe();
    let _delivery = guard.start_alert_delivery();
    let changes = state_change_lines(BufReader::new(tokio::io::stdin()));
    guard.monitors.attach_stream(&group_id, changes);

    let mut tick = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            alert = alerts.recv() => match alert {
                Ok(alert) => println!("{}", serde_json::to_string(&alert)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Alert output lagging"),
                Err(RecvError::Closed) => break,
            },
            _ = tick.tick() => {
                let streaming = guard
                    .monitors
                    .lookup(&group_id)
                    .map(|m| m.streaming)
                    .unwrap_or(false);
                if !streaming {
                    // Input exhausted; flush what the feed task already published
                    while let Ok(alert) = alerts.try_recv() {
                        println!("{}", serde_json::to_string(&alert)?);
                    }
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping");
                break;
            }
        }
    }

    guard.monitors.shutdown();
    Ok(())
}

/// Print a report as JSON and optionally save it.
fn emit<T: Serialize>(report: &T, out: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    println!("{}", json);
    if let Some(path) = out {
        std::fs::write(path, &json).with_context(|| format!("write report {}", path.display()))?;
        info!("Report written to {}", path.display());
    }
    Ok(())
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => tracing_subscriber::EnvFilter::new(f),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "resetguard_backend=info,tower_http=info".into()),
    };
    // Reports go to stdout; keep logs on stderr
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then next to the manifest
    let _ = dotenv();
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
