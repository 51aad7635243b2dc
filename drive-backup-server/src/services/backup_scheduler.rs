use crate::config::AppConfig;
use backup_rotation::remote::ensure_folder;
use backup_rotation::{BackupJob, HostAccess, JobRunner, JobState, StorageClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

/// Upper bound on waiting for in-flight runs at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Scheduler lifecycle. Only forward transitions are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Initialized,
    Running,
    Stopped,
}

impl Phase {
    fn advance(self, to: Phase) -> anyhow::Result<Phase> {
        use Phase::*;
        match (self, to) {
            (Created, Initialized) | (Initialized, Running) | (Initialized, Stopped) | (Running, Stopped) => Ok(to),
            _ => anyhow::bail!("Scheduler cannot move from {:?} to {:?}", self, to),
        }
    }
}

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    config: AppConfig,
    storage: Arc<dyn StorageClient>,
    host: Option<Arc<dyn HostAccess>>,
    shutdown: CancellationToken,
    phase: Mutex<Phase>,
    runners: Mutex<Vec<Arc<JobRunner>>>,
    disabled: Mutex<Vec<String>>,
    kickoffs: Mutex<Vec<JoinHandle<()>>>,
}

impl BackupScheduler {
    pub async fn new(
        config: AppConfig,
        storage: Arc<dyn StorageClient>,
        host: Option<Arc<dyn HostAccess>>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            config,
            storage,
            host,
            shutdown,
            phase: Mutex::new(Phase::Created),
            runners: Mutex::new(Vec::new()),
            disabled: Mutex::new(Vec::new()),
            kickoffs: Mutex::new(Vec::new()),
        })
    }

    pub async fn phase(&self) -> Phase {
        *self.phase.lock().await
    }

    async fn transition(&self, to: Phase) -> anyhow::Result<()> {
        let mut phase = self.phase.lock().await;
        *phase = phase.advance(to)?;
        Ok(())
    }

    async fn schedule_job(&self, runner: Arc<JobRunner>, every: Duration) -> anyhow::Result<()> {
        let shutdown = self.shutdown.clone();
        let scheduled = runner.clone();

        let job = Job::new_repeated_async(every, move |_uuid, _lock| {
            let runner = scheduled.clone();
            let shutdown = shutdown.clone();
            Box::pin(async move {
                tracing::info!(job = %runner.job().name, "Starting scheduled backup");
                run_and_log(&runner, &shutdown).await;
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(job = %runner.job().name, every_days = runner.job().interval_days, "Job scheduled");
        Ok(())
    }

    /// Ensure the root folder, then register every enabled job. Returns the
    /// number of jobs scheduled; scheduling none is an error. A failed
    /// provisioning leaves the scheduler in `Created`, so it can be retried.
    pub async fn init_schedules(&self, jobs: Vec<BackupJob>) -> anyhow::Result<usize> {
        let mut phase = self.phase.lock().await;
        let next = phase.advance(Phase::Initialized)?;

        let (root, created) = ensure_folder(self.storage.as_ref(), &self.config.backups_folder_name, None).await?;
        let link = root.link.as_deref().unwrap_or("-");
        if created {
            tracing::info!(folder = %root.name, link = %link, "Created backups folder");
        } else {
            tracing::info!(folder = %root.name, link = %link, "Using existing backups folder");
        }

        let mut count = 0;
        for job in jobs {
            if job.disabled {
                tracing::info!(job = %job.name, "Job disabled, not scheduling");
                self.disabled.lock().await.push(job.name);
                continue;
            }

            let every = job.interval();
            let runner = Arc::new(
                JobRunner::new(job, self.storage.clone(), self.host.clone(), root.clone())
                    .with_timeout(self.config.run_timeout),
            );
            if let Err(e) = self.schedule_job(runner.clone(), every).await {
                tracing::error!(job = %runner.job().name, error = %e, "Failed to schedule job");
            } else {
                count += 1;
                self.runners.lock().await.push(runner);
            }
        }

        if count == 0 {
            anyhow::bail!("No backup jobs could be scheduled");
        }
        *phase = next;
        tracing::info!(count, "Backup schedules initialized");
        Ok(count)
    }

    /// Start ticking, and kick off jobs flagged to run at startup.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.transition(Phase::Running).await?;
        self.scheduler.lock().await.start().await?;

        let mut kickoffs = self.kickoffs.lock().await;
        for runner in self.runners.lock().await.iter() {
            if runner.job().run_immediately {
                let runner = runner.clone();
                let shutdown = self.shutdown.clone();
                kickoffs.push(tokio::spawn(async move {
                    tracing::info!(job = %runner.job().name, "Starting initial backup");
                    run_and_log(&runner, &shutdown).await;
                }));
            }
        }
        Ok(())
    }

    /// Stop ticking, then wait for in-flight runs to finish, bounded by
    /// `DRAIN_TIMEOUT`. Runs see the cancelled shutdown token at their next
    /// checkpoint.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.transition(Phase::Stopped).await?;
        self.scheduler.lock().await.shutdown().await?;
        self.drain(DRAIN_TIMEOUT).await;
        Ok(())
    }

    async fn drain(&self, limit: Duration) {
        let kickoffs: Vec<JoinHandle<()>> = self.kickoffs.lock().await.drain(..).collect();
        let runners = self.runners.lock().await.clone();

        let wait = async {
            for handle in kickoffs {
                let _ = handle.await;
            }
            for runner in &runners {
                runner.drain().await;
            }
        };
        if tokio::time::timeout(limit, wait).await.is_err() {
            tracing::warn!(timeout = ?limit, "Backup runs still in flight at shutdown");
        }
    }

    /// Current state of every known job, scheduled ones first.
    pub async fn job_states(&self) -> Vec<(String, JobState)> {
        let mut states: Vec<(String, JobState)> = self
            .runners
            .lock()
            .await
            .iter()
            .map(|r| (r.job().name.clone(), r.state()))
            .collect();
        states.extend(self.disabled.lock().await.iter().map(|name| (name.clone(), JobState::Disabled)));
        states
    }
}

/// Run one cycle and log the outcome. Failures end the run, never the
/// process; the next tick starts from a fresh listing.
pub async fn run_and_log(runner: &JobRunner, shutdown: &CancellationToken) {
    let name = &runner.job().name;
    match runner.trigger(shutdown).await {
        Ok(report) => tracing::info!(
            job = %name,
            run_id = %report.run_id,
            verified = report.verified,
            evicted = ?report.evicted,
            uploaded = ?report.uploaded,
            "Backup run complete"
        ),
        Err(e) if e.is_cancellation() => tracing::warn!(job = %name, error = %e, "Backup run stopped"),
        Err(e) => tracing::error!(job = %name, error = %e, "Backup run failed"),
    }
}
