mod adapters;
pub(crate) mod cli;
mod commands;
mod daemon_config;
mod format;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use flock_cluster::https::HttpsTransport;
use flock_cluster::{ClusterCore, ClusterCoreConfig};
use flock_crypto::identity::ServerIdentity;
use tokio_util::sync::CancellationToken;

use cli::{Cli, ClusterSubcommand, Command, ConfigSubcommand, TrustSubcommand};
use daemon_config::DaemonConfig;

/// Brief pause after cancellation to let in-flight requests complete.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

/// Certificate subject when the host name is unknown.
const FALLBACK_SERVER_NAME: &str = "flock";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = match cli.verbose {
        0 => cli.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Hold the non-blocking guards for the lifetime of main so logs flush on exit.
    let _log_guards = init_logging(env_filter, cli.log_file.as_deref())?;

    if let Command::Version = cli.command {
        if cli.json {
            println!(
                "{}",
                serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "platform": std::env::consts::OS,
                })
            );
        } else {
            println!("flock {}", env!("CARGO_PKG_VERSION"));
        }
        return Ok(());
    }

    // ── Everything below needs a Tokio runtime ──────────────────────
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(flock_common::paths::flock_data_dir);

    if let Command::Daemon = cli.command {
        return daemon(&data_dir, cli.socket.clone()).await;
    }

    let socket = match &cli.socket {
        Some(path) => path.clone(),
        None => DaemonConfig::load_if_present(&data_dir)?.socket_path(&data_dir),
    };
    dispatch(&cli, &socket).await
}

async fn dispatch(cli: &Cli, socket: &Path) -> anyhow::Result<()> {
    let json = cli.json;
    match &cli.command {
        Command::Cluster(cmd) => match &cmd.command {
            ClusterSubcommand::Show => commands::cluster::show(socket, json).await,
            ClusterSubcommand::List => commands::cluster::list(socket, json).await,
            ClusterSubcommand::Bootstrap { name } => {
                commands::cluster::bootstrap(socket, name, json).await
            }
            ClusterSubcommand::Join {
                name,
                address,
                certificate,
            } => commands::cluster::join(socket, name, address, certificate, json).await,
            ClusterSubcommand::Rename { name, new_name } => {
                commands::cluster::rename(socket, name, new_name, json).await
            }
            ClusterSubcommand::Remove { name, force } => {
                commands::cluster::remove(socket, name, *force, json).await
            }
        },
        Command::Config(cmd) => match &cmd.command {
            ConfigSubcommand::Show => commands::config::show(socket, json).await,
            ConfigSubcommand::Set { pairs } => commands::config::set(socket, pairs, json).await,
        },
        Command::Trust(cmd) => match &cmd.command {
            TrustSubcommand::Add { certificate, name } => {
                commands::trust::add(socket, certificate, name.as_deref(), json).await
            }
            TrustSubcommand::List => commands::trust::list(socket, json).await,
            TrustSubcommand::Remove { fingerprint } => {
                commands::trust::remove(socket, fingerprint, json).await
            }
        },
        // Handled before dispatch.
        Command::Daemon | Command::Version => Ok(()),
    }
}

// ── Daemon mode ─────────────────────────────────────────────────────

async fn daemon(data_dir: &Path, socket_override: Option<PathBuf>) -> anyhow::Result<()> {
    let config = DaemonConfig::load_or_init(data_dir)?;
    let socket = socket_override.unwrap_or_else(|| config.socket_path(data_dir));

    let server_name = std::env::var("HOSTNAME").unwrap_or_else(|_| FALLBACK_SERVER_NAME.to_string());
    let identity = ServerIdentity::load_or_generate(data_dir, &server_name)?;
    let transport = Arc::new(HttpsTransport::new(
        identity.clone(),
        config.cluster.notify_timeout(),
    ));
    let core = ClusterCore::open(
        ClusterCoreConfig {
            identity,
            data_dir: Some(data_dir.to_path_buf()),
            settings: config.cluster.clone(),
        },
        transport,
    )?;
    startup_diagnostics(&core, data_dir, &socket).await;

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    {
        let router = core.routes();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = adapters::unix::start(router, socket, token).await {
                tracing::error!(error = %e, "Admin socket failed");
            }
        }));
    }
    {
        let c = core.clone();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = adapters::https::supervise(c, token).await {
                tracing::error!(error = %e, "HTTPS adapter failed");
            }
        }));
    }
    tasks.push(tokio::spawn(heartbeat_loop(core.clone(), cancel.clone())));

    tracing::info!("Ready.");

    // Wait for shutdown signal
    shutdown_signal().await;
    tracing::info!("Shutting down...");

    // Ordered shutdown with hard timeout
    let shutdown_timeout = config.shutdown_timeout();
    let shutdown = async {
        cancel.cancel();
        tokio::time::sleep(SHUTDOWN_DRAIN).await;
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(shutdown_timeout, shutdown).await.is_err() {
        tracing::warn!("Shutdown timed out after {:?}, forcing exit", shutdown_timeout);
    }

    Ok(())
}

/// Leader heartbeat rounds until cancelled. Non-leaders tick but skip.
async fn heartbeat_loop(core: ClusterCore, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(core.settings().heartbeat_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match core.heartbeat_once().await {
                    Ok(Some(report)) if !report.all_delivered() => {
                        tracing::debug!(failed = report.failed.len(), "Heartbeat round incomplete");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Heartbeat round failed"),
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    tracing::debug!("Heartbeat loop stopped");
}

// ── Infrastructure helpers ──────────────────────────────────────────

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ── Daemon startup diagnostics ──────────────────────────────────────

async fn startup_diagnostics(core: &ClusterCore, data_dir: &Path, socket: &Path) {
    tracing::info!("flock v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("Platform: {}", std::env::consts::OS);
    tracing::info!("Data directory: {}", data_dir.display());
    tracing::info!("Admin socket: {}", socket.display());
    tracing::info!("Certificate fingerprint: {}", core.fingerprint());

    let view = core.get_cluster().await;
    if view.enabled {
        let members = core.get_cluster_members().await;
        tracing::info!(member = %view.server_name, members = members.len(), "Clustered");
    } else {
        tracing::info!("Not clustered");
    }
}

// ── Logging setup ───────────────────────────────────────────────────

/// Initialize tracing with stderr + optional file output.
/// Returns guards that must be held for the lifetime of the program
/// to ensure the non-blocking writers flush on shutdown.
pub(crate) fn init_logging(
    env_filter: tracing_subscriber::EnvFilter,
    log_file: Option<&std::path::Path>,
) -> anyhow::Result<Vec<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    // Non-blocking stderr so a redirected pipe nobody reads cannot stall the daemon.
    let (nb_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(nb_stderr);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (nb_file, file_guard) = tracing_appender::non_blocking(file);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(nb_file);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();

        Ok(vec![stderr_guard, file_guard])
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();

        Ok(vec![stderr_guard])
    }
}
