use crate::error::ConfigError;
use backup_rotation::job::{validate_jobs, BackupJob};
use backup_rotation::JobError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    KeyFile(PathBuf),
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(<redacted>)"),
            SshAuth::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backups_folder_name: String,
    pub jobs_file: PathBuf,
    pub credentials_file: PathBuf,
    pub token_file: PathBuf,
    /// No host means rotation-only runs
    pub ssh: Option<SshConfig>,
    pub run_timeout: Duration,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backups_folder_name =
            var("BACKUPS_FOLDER_NAME").ok_or(ConfigError::MissingVar("BACKUPS_FOLDER_NAME"))?;

        let ssh = match var("SSH_IP") {
            Some(host) => {
                let user = var("SSH_USER").ok_or(ConfigError::MissingVar("SSH_USER"))?;
                let port = match var("SSH_PORT") {
                    Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
                        name: "SSH_PORT",
                        value: raw,
                    })?,
                    None => 22,
                };
                let auth = match (var("SSH_KEY_PATH"), var("SSH_PWD")) {
                    (Some(key), _) => SshAuth::KeyFile(PathBuf::from(key)),
                    (None, Some(password)) => SshAuth::Password(password),
                    (None, None) => return Err(ConfigError::MissingSshAuth),
                };
                Some(SshConfig { host, port, user, auth })
            }
            None => None,
        };

        let run_timeout = match var("RUN_TIMEOUT_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigError::InvalidVar {
                        name: "RUN_TIMEOUT_SECS",
                        value: raw,
                    })
                }
            },
            None => backup_rotation::executor::DEFAULT_RUN_TIMEOUT,
        };

        Ok(Self {
            backups_folder_name,
            jobs_file: PathBuf::from(var("JOBS_FILE").unwrap_or_else(|| "backups.json".into())),
            credentials_file: PathBuf::from(var("CREDENTIALS_FILE").unwrap_or_else(|| "credentials.json".into())),
            token_file: PathBuf::from(var("TOKEN_FILE").unwrap_or_else(|| "token.json".into())),
            ssh,
            run_timeout,
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".into()),
        })
    }
}

/// Read and validate the job definitions file. At least one job must be
/// enabled.
pub fn load_jobs(path: &Path) -> Result<Vec<BackupJob>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let jobs: Vec<BackupJob> = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    validate_jobs(&jobs)?;
    if jobs.iter().all(|j| j.disabled) {
        return Err(ConfigError::NoEnabledJobs(path.to_path_buf()));
    }
    Ok(jobs)
}

/// With a host configured every enabled job must name the path to snapshot.
pub fn require_source_paths(jobs: &[BackupJob]) -> Result<(), ConfigError> {
    match jobs.iter().find(|j| !j.disabled && j.source_path.trim().is_empty()) {
        Some(job) => Err(JobError::Invalid {
            name: job.name.clone(),
            reason: "vps-location must not be empty when SSH_IP is set".into(),
        }
        .into()),
        None => Ok(()),
    }
}
