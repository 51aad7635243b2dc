mod config;
mod error;
mod services;

use crate::config::{load_jobs, require_source_paths, AppConfig};
use crate::services::backup_scheduler::BackupScheduler;
use crate::services::drive::DriveClient;
use crate::services::drive_auth::TokenProvider;
use crate::services::ssh_host::{verify_read_only, SshHost};
use backup_rotation::{HostAccess, StorageClient};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backup jobs file, overrides JOBS_FILE
    #[arg(short, long, value_name = "FILE")]
    jobs: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate configuration and jobs, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_env()?;
    if let Some(jobs) = args.jobs {
        config.jobs_file = jobs;
    }

    // RUST_LOG wins over the configured level
    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let jobs = load_jobs(&config.jobs_file)?;
    if config.ssh.is_some() {
        require_source_paths(&jobs)?;
    }
    tracing::info!(jobs = jobs.len(), file = %config.jobs_file.display(), "Loaded backup jobs");
    if args.check {
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?;
    let auth = TokenProvider::from_files(http.clone(), &config.credentials_file, &config.token_file)?;
    let storage: Arc<dyn StorageClient> = Arc::new(DriveClient::new(http, auth));

    let host: Option<Arc<dyn HostAccess>> = match &config.ssh {
        Some(ssh) => {
            let host = SshHost::new(ssh.clone());
            verify_read_only(&host).await?;
            Some(Arc::new(host))
        }
        None => {
            tracing::warn!("SSH_IP is not set, running rotation only");
            None
        }
    };

    let cancel = CancellationToken::new();
    let scheduler = BackupScheduler::new(config, storage, host, cancel.clone()).await?;
    scheduler.init_schedules(jobs).await?;
    scheduler.start().await?;
    tracing::info!("Backup scheduler running");

    shutdown_signal(cancel.clone()).await;

    tracing::info!("Shutting down...");
    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }
    tracing::info!("Stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
