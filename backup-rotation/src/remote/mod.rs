//! Collaborator interfaces for remote storage and the snapshotted host.
//!
//! The engine only ever reads, renames and deletes artifacts by reference;
//! every concrete client lives outside this crate.

pub mod provision;

use crate::utils::errors::{HostError, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub use provision::ensure_folder;

/// Media type every chain member must carry.
pub const GZIP_CONTENT_TYPE: &str = "application/gzip";

/// Handle to a stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    /// Opaque remote identifier
    pub id: String,

    /// Title, encodes job name, date and index
    pub title: String,

    /// Media type reported by the storage service
    pub content_type: String,
}

impl RemoteArtifact {
    pub fn new(id: impl Into<String>, title: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content_type: content_type.into(),
        }
    }
}

/// Handle to a remote folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: String,
    pub name: String,
    /// Browser link, when the service provides one
    pub link: Option<String>,
}

/// Streamed archive body, as produced by the host and consumed by uploads.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Remote file storage.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Find a folder by exact name, optionally restricted to a parent.
    async fn find_folder(&self, name: &str, parent: Option<&Folder>) -> Result<Option<Folder>, StorageError>;

    /// Create a folder, optionally inside a parent.
    async fn create_folder(&self, name: &str, parent: Option<&Folder>) -> Result<Folder, StorageError>;

    /// List every file in a folder. Implementations paginate transparently
    /// and stop between pages once `cancel` fires.
    async fn list_folder(&self, folder: &Folder, cancel: &CancellationToken) -> Result<Vec<RemoteArtifact>, StorageError>;

    async fn delete_artifact(&self, id: &str) -> Result<(), StorageError>;

    async fn rename_artifact(&self, id: &str, title: &str) -> Result<(), StorageError>;

    /// Create a file from a byte stream.
    async fn create_artifact(
        &self,
        folder: &Folder,
        title: &str,
        content_type: &str,
        body: ByteStream,
    ) -> Result<RemoteArtifact, StorageError>;
}

/// Outcome of the read-only account probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionReport {
    pub can_write: bool,
    pub can_delete: bool,
    pub has_sudo: bool,
}

impl PermissionReport {
    pub fn is_read_only(&self) -> bool {
        !self.can_write && !self.can_delete
    }
}

/// Access to the host being backed up.
#[async_trait]
pub trait HostAccess: Send + Sync {
    /// Stream a tar+gzip archive of `path`. The stream yields an error
    /// instead of ending cleanly if `cancel` fires mid-transfer.
    async fn capture_snapshot(&self, path: &str, cancel: &CancellationToken) -> Result<ByteStream, HostError>;

    /// Check that the account cannot write, delete or escalate.
    async fn probe_permissions(&self) -> Result<PermissionReport, HostError>;
}
