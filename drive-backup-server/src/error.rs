use backup_rotation::JobError;
use std::path::PathBuf;

/// Startup configuration failure. The process does not start.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{0} is not set")]
    MissingVar(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    InvalidVar { name: &'static str, value: String },

    #[error("SSH_IP is set but neither SSH_PWD nor SSH_KEY_PATH is")]
    MissingSshAuth,

    #[error("Unable to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid credentials in {}: {reason}", .path.display())]
    Credentials { path: PathBuf, reason: String },

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("No enabled backup jobs in {}", .0.display())]
    NoEnabledJobs(PathBuf),
}
