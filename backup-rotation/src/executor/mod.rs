//! Backup job executor - runs one job's cycle under its execution lock.
//!
//! A cycle is strictly sequential:
//! - ensure the job folder inside the root folder
//! - list it and build the verified chain
//! - rotate when the chain is exactly at capacity
//! - capture and upload a new snapshot, if a host is configured

use crate::chain::{self, naming, VerifiedChain};
use crate::job::BackupJob;
use crate::remote::{ensure_folder, Folder, HostAccess, StorageClient, GZIP_CONTENT_TYPE};
use crate::utils::errors::RunError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

/// Upper bound for a single run unless configured otherwise.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Scheduling state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    /// Flagged disabled at load time; never scheduled
    Disabled,
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub job: String,
    pub folder_created: bool,
    pub listed: usize,
    /// Chain length before any rotation
    pub verified: usize,
    pub evicted: Option<String>,
    pub uploaded: Option<String>,
}

/// Per-run cancellation context.
struct RunContext {
    cancel: CancellationToken,
    shutdown: CancellationToken,
    timeout: Duration,
}

impl RunContext {
    fn checkpoint(&self) -> Result<(), RunError> {
        if self.cancel.is_cancelled() {
            return Err(self.cancellation_error());
        }
        Ok(())
    }

    fn cancellation_error(&self) -> RunError {
        if self.shutdown.is_cancelled() {
            RunError::Cancelled
        } else {
            RunError::TimedOut(self.timeout)
        }
    }
}

/// Owns one job's configuration, collaborators and execution lock.
pub struct JobRunner {
    job: BackupJob,
    storage: Arc<dyn StorageClient>,
    host: Option<Arc<dyn HostAccess>>,
    root: Folder,
    run_timeout: Duration,
    lock: Mutex<()>,
}

impl JobRunner {
    pub fn new(
        job: BackupJob,
        storage: Arc<dyn StorageClient>,
        host: Option<Arc<dyn HostAccess>>,
        root: Folder,
    ) -> Self {
        Self {
            job,
            storage,
            host,
            root,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            lock: Mutex::new(()),
        }
    }

    pub fn with_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn job(&self) -> &BackupJob {
        &self.job
    }

    pub fn state(&self) -> JobState {
        match self.lock.try_lock() {
            Ok(_) => JobState::Idle,
            Err(_) => JobState::Running,
        }
    }

    /// Wait for the in-flight run, if any, and every trigger queued ahead
    /// of this call.
    pub async fn drain(&self) {
        let _guard = self.lock.lock().await;
    }

    /// Run one cycle. Waits for any in-flight run of this job first;
    /// waiting triggers are served in arrival order.
    pub async fn trigger(&self, shutdown: &CancellationToken) -> Result<RunReport, RunError> {
        let _guard = self.lock.lock().await;

        let run_id = Uuid::new_v4();
        let span = info_span!("backup_run", job = %self.job.name, %run_id);
        self.run_bounded(run_id, shutdown).instrument(span).await
    }

    async fn run_bounded(&self, run_id: Uuid, shutdown: &CancellationToken) -> Result<RunReport, RunError> {
        let ctx = RunContext {
            cancel: shutdown.child_token(),
            shutdown: shutdown.clone(),
            timeout: self.run_timeout,
        };

        info!("Running backup");
        let started = std::time::Instant::now();

        let cycle = self.run_cycle(run_id, &ctx);
        tokio::pin!(cycle);
        let deadline = tokio::time::sleep(self.run_timeout);
        tokio::pin!(deadline);

        // Cancellation is cooperative: the cycle notices at its next checkpoint
        let result = loop {
            tokio::select! {
                result = &mut cycle => break result,
                _ = &mut deadline, if !ctx.cancel.is_cancelled() => {
                    info!(timeout = ?self.run_timeout, "Run deadline reached, cancelling");
                    ctx.cancel.cancel();
                }
            }
        };

        let result = match result {
            Err(e) if ctx.cancel.is_cancelled() && !e.is_cancellation() => {
                debug!(error = %e, "Run failed after cancellation");
                Err(ctx.cancellation_error())
            }
            other => other,
        };

        info!(elapsed_ms = started.elapsed().as_millis() as u64, ok = result.is_ok(), "Finished backup");
        result
    }

    async fn run_cycle(&self, run_id: Uuid, ctx: &RunContext) -> Result<RunReport, RunError> {
        let job = &self.job;

        ctx.checkpoint()?;
        let (folder, folder_created) = ensure_folder(self.storage.as_ref(), &job.folder_name, Some(&self.root))
            .await
            .map_err(|source| RunError::Provision {
                folder: job.folder_name.clone(),
                source,
            })?;
        if folder_created {
            info!(folder = %folder.name, "Created job folder");
        }

        ctx.checkpoint()?;
        let artifacts = self
            .storage
            .list_folder(&folder, &ctx.cancel)
            .await
            .map_err(|source| RunError::List {
                folder: folder.name.clone(),
                source,
            })?;

        let mut chain = chain::validate(job, &artifacts);
        let verified = chain.len();
        info!(listed = artifacts.len(), verified, max = job.max_retained, "Verified backup chain");

        let mut evicted = None;
        if chain.is_full(job.max_retained) {
            ctx.checkpoint()?;
            info!(max = job.max_retained, "Max backups reached, rotating");
            evicted = chain.records().first().map(|r| r.artifact.title.clone());
            chain = chain::rotate(chain, Arc::clone(&self.storage)).await?;
        }

        let uploaded = match &self.host {
            Some(host) => Some(self.upload_snapshot(host.as_ref(), &folder, &chain, ctx).await?),
            None => {
                debug!("No host configured, skipping upload");
                None
            }
        };

        Ok(RunReport {
            run_id,
            job: job.name.clone(),
            folder_created,
            listed: artifacts.len(),
            verified,
            evicted,
            uploaded,
        })
    }

    async fn upload_snapshot(
        &self,
        host: &dyn HostAccess,
        folder: &Folder,
        chain: &VerifiedChain,
        ctx: &RunContext,
    ) -> Result<String, RunError> {
        let job = &self.job;

        ctx.checkpoint()?;
        let today = chrono::Local::now().date_naive();
        let title = naming::format(&job.name, today, chain.next_index());

        let body = host
            .capture_snapshot(&job.source_path, &ctx.cancel)
            .await
            .map_err(|source| RunError::Capture {
                path: job.source_path.clone(),
                source,
            })?;

        info!(title = %title, "Uploading snapshot");
        let artifact = self
            .storage
            .create_artifact(folder, &title, GZIP_CONTENT_TYPE, body)
            .await
            .map_err(|source| RunError::Upload {
                title: title.clone(),
                source,
            })?;

        info!(title = %artifact.title, id = %artifact.id, "Uploaded snapshot");
        Ok(artifact.title)
    }
}
