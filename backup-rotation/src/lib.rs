//! Backup Rotation Library
//!
//! Retention validation and rotation engine for chains of dated, indexed
//! snapshot archives kept in remote storage.

pub mod chain;
pub mod executor;
pub mod job;
pub mod remote;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use chain::{BackupRecord, VerifiedChain};
pub use executor::{JobRunner, JobState, RunReport};
pub use job::{BackupJob, Linkage};
pub use remote::{ByteStream, Folder, HostAccess, PermissionReport, RemoteArtifact, StorageClient};
pub use utils::errors::{HostError, JobError, NameError, RotationError, RunError, StorageError};
