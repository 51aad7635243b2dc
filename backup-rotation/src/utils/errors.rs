//! Error types for the rotation engine and its collaborators.

use std::time::Duration;
use thiserror::Error;

/// Why an artifact title could not be read as a backup record.
///
/// These never escape a validation pass: a title that fails to parse is
/// treated as a foreign file and skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("content type '{0}' is not a gzip archive")]
    NotGzip(String),

    #[error("title has fewer than three '-' separated segments")]
    TooFewSegments,

    #[error("title has an empty job name")]
    EmptyName,

    #[error("title does not end in .tar.gz")]
    MissingSuffix,

    #[error("invalid backup index: {0}")]
    InvalidIndex(String),

    #[error("invalid backup date: {0}")]
    InvalidDate(String),
}

/// Failure reported by the remote storage collaborator.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Storage API returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Stream error: {0}")]
    Stream(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Failure reported by the remote host collaborator.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Command `{command}` exited with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// A job definition that cannot be scheduled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Invalid job '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("Duplicate job name '{0}'")]
    Duplicate(String),
}

/// Failure while evicting or renumbering a full chain.
#[derive(Error, Debug)]
pub enum RotationError {
    #[error("Failed to delete oldest backup '{title}': {source}")]
    Evict {
        title: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to renumber {failed} of {total} backups, first failure on '{title}': {source}")]
    Rename {
        title: String,
        failed: usize,
        total: usize,
        #[source]
        source: StorageError,
    },
}

/// Failure of a single job run. Fails the run, never the process.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to provision folder '{folder}': {source}")]
    Provision {
        folder: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to list folder '{folder}': {source}")]
    List {
        folder: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Rotation(#[from] RotationError),

    #[error("Failed to capture snapshot of '{path}': {source}")]
    Capture {
        path: String,
        #[source]
        source: HostError,
    },

    #[error("Failed to upload '{title}': {source}")]
    Upload {
        title: String,
        #[source]
        source: StorageError,
    },

    #[error("Run timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Run cancelled by shutdown")]
    Cancelled,
}

impl RunError {
    /// True when the run stopped because its context was cancelled.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RunError::TimedOut(_) | RunError::Cancelled)
    }
}
