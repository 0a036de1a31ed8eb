use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use veectl::config::DaemonConfig;
use veectl::AppContext;

#[derive(Parser)]
#[command(name = "veectl", about = "Vee VPN subscription control plane", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory for config, SQLite database, and logs.
    #[arg(long, env = "VEECTL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "VEECTL_LOG")]
    log: Option<String>,

    /// Port for `GET /api/subscription/{token}`.
    #[arg(long, env = "VEECTL_REST_PORT")]
    rest_port: Option<u16>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "VEECTL_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon: traffic monitor, expiry scheduler, bundle server.
    Serve,
    /// Run the fleet reconciler once and print a drift report.
    Reconcile {
        /// Apply repairs instead of only reporting drift.
        #[arg(long)]
        apply: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        Some(Command::Reconcile { apply }) => run_reconcile(args.data_dir, apply).await,
        None | Some(Command::Serve) => run_serve(args.data_dir, args.log, args.rest_port).await,
    }
}

async fn run_serve(data_dir: Option<PathBuf>, log: Option<String>, rest_port: Option<u16>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "veectl starting");
    let config = DaemonConfig::new(data_dir, log, rest_port);
    info!(
        data_dir = %config.data_dir.display(),
        rest_port = config.rest_port,
        "config loaded"
    );

    let ctx = Arc::new(AppContext::new(config).await?);
    ctx.run().await
}

async fn run_reconcile(data_dir: Option<PathBuf>, apply: bool) -> Result<()> {
    let config = DaemonConfig::new(data_dir, Some("warn".to_string()), None);
    let ctx = AppContext::new(config).await?;

    let reports = ctx.reconciler.reconcile_all(apply).await?;
    for report in &reports {
        println!("server {}: {} drift item(s)", report.server_id, report.drift.len());
        for item in &report.drift {
            match item {
                veectl::reconcile::Drift::MissingOnServer { key } => {
                    println!("  missing on server: key {} ({})", key.id, key.email);
                }
                veectl::reconcile::Drift::MissingInLocal { remote_id, email } => {
                    println!(
                        "  missing in local: remote {remote_id} ({})",
                        email.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        if apply {
            println!("  deleted {} orphan remote key(s)", report.deleted_remote_keys);
            println!("  deleted {} orphan subscription row(s)", report.deleted_orphan_subscriptions);
        }
    }
    Ok(())
}

/// Initialize the tracing subscriber. If `log_file` is set, logs go to both
/// stdout and a daily-rolling file. Returns a `WorkerGuard` that must stay
/// alive for the process lifetime.
///
/// Falls back to stdout-only logging with a warning if the log directory
/// cannot be created — never panics on a bad log path.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("veectl.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_serve_with_no_subcommand() {
        let args = Args::parse_from(["veectl"]);
        assert!(args.command.is_none());
    }

    #[test]
    fn args_parse_reconcile_apply_flag() {
        let args = Args::parse_from(["veectl", "reconcile", "--apply"]);
        match args.command {
            Some(Command::Reconcile { apply }) => assert!(apply),
            _ => panic!("expected Reconcile command"),
        }
    }
}
