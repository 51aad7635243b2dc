//! Backup job definitions.

use crate::utils::errors::JobError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Which earlier record a chain candidate must directly succeed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Linkage {
    /// Compare each candidate with the last record accepted into the chain.
    /// A stray entry is skipped without affecting the ones after it.
    #[default]
    LastAccepted,

    /// Additionally require each candidate to succeed its immediate
    /// predecessor in index order, so one stray entry also rejects every
    /// record that follows it.
    SortedPredecessor,
}

/// One named, independently scheduled backup target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    /// Unique job name, also the title prefix of every artifact
    pub name: String,

    /// Storage folder holding this job's artifacts
    #[serde(rename = "folder-name")]
    pub folder_name: String,

    /// Path on the remote host to snapshot. Only read when a host is
    /// configured.
    #[serde(rename = "vps-location", default)]
    pub source_path: String,

    /// Days between runs, and the exact date spacing of chain members
    #[serde(rename = "backup-time")]
    pub interval_days: u32,

    /// Chain capacity before rotation kicks in
    #[serde(rename = "max-backups")]
    pub max_retained: u32,

    #[serde(rename = "is-disabled", default)]
    pub disabled: bool,

    #[serde(rename = "run-initially", default)]
    pub run_immediately: bool,

    #[serde(rename = "chain-linkage", default)]
    pub linkage: Linkage,
}

impl BackupJob {
    /// Period between scheduled runs.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_days) * SECONDS_PER_DAY)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        let invalid = |reason: &str| JobError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("name may only contain letters, digits, '-' and '_'"));
        }
        if self.folder_name.trim().is_empty() {
            return Err(invalid("folder-name must not be empty"));
        }
        if self.interval_days == 0 {
            return Err(invalid("backup-time must be at least 1 day"));
        }
        if self.max_retained == 0 {
            return Err(invalid("max-backups must be at least 1"));
        }
        Ok(())
    }
}

/// Validate every job and check that names are unique.
pub fn validate_jobs(jobs: &[BackupJob]) -> Result<(), JobError> {
    let mut seen = HashSet::new();
    for job in jobs {
        job.validate()?;
        if !seen.insert(job.name.as_str()) {
            return Err(JobError::Duplicate(job.name.clone()));
        }
    }
    Ok(())
}
