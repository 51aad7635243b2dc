//! In-memory collaborators and fixtures shared by the crate's tests.

use crate::job::{BackupJob, Linkage};
use crate::remote::{
    ByteStream, Folder, HostAccess, PermissionReport, RemoteArtifact, StorageClient, GZIP_CONTENT_TYPE,
};
use crate::utils::errors::{HostError, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

static NEXT_ARTIFACT: AtomicUsize = AtomicUsize::new(1);

pub fn job(name: &str, interval_days: u32, max_retained: u32) -> BackupJob {
    BackupJob {
        name: name.to_string(),
        folder_name: name.to_string(),
        source_path: format!("/srv/{name}"),
        interval_days,
        max_retained,
        disabled: false,
        run_immediately: false,
        linkage: Linkage::LastAccepted,
    }
}

/// A gzip artifact with a unique id.
pub fn gzip(title: &str) -> RemoteArtifact {
    let id = NEXT_ARTIFACT.fetch_add(1, Ordering::Relaxed);
    RemoteArtifact::new(format!("file-{id}"), title, GZIP_CONTENT_TYPE)
}

#[derive(Default)]
struct Inner {
    next_id: usize,
    folders: Vec<(Folder, Option<String>)>,
    files: Vec<(String, RemoteArtifact)>,
    uploads: Vec<(String, usize)>,
}

impl Inner {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// Storage fake with switchable failures and a concurrency probe on listing.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    fail_deletes: AtomicBool,
    fail_folder_creation: AtomicBool,
    failing_renames: Mutex<HashSet<String>>,
    rename_calls: AtomicUsize,
    list_delay: Mutex<Option<Duration>>,
    active_lists: AtomicUsize,
    max_active_lists: AtomicUsize,
    list_calls: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Top-level folder, created if missing.
    pub fn seed_folder(&self, name: &str) -> Folder {
        let mut inner = self.inner.lock().unwrap();
        if let Some((folder, _)) = inner.folders.iter().find(|(f, p)| f.name == name && p.is_none()) {
            return folder.clone();
        }
        let folder = Folder {
            id: inner.id("folder"),
            name: name.to_string(),
            link: None,
        };
        inner.folders.push((folder.clone(), None));
        folder
    }

    pub fn seed_gzip(&self, folder: &Folder, title: &str) -> RemoteArtifact {
        self.seed(folder, gzip(title))
    }

    pub fn seed(&self, folder: &Folder, artifact: RemoteArtifact) -> RemoteArtifact {
        self.inner
            .lock()
            .unwrap()
            .files
            .push((folder.id.clone(), artifact.clone()));
        artifact
    }

    pub fn files_in(&self, folder: &Folder) -> Vec<RemoteArtifact> {
        self.inner
            .lock()
            .unwrap()
            .files
            .iter()
            .filter(|(parent, _)| *parent == folder.id)
            .map(|(_, a)| a.clone())
            .collect()
    }

    pub fn all_titles(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .files
            .iter()
            .map(|(_, a)| a.title.clone())
            .collect()
    }

    pub fn folder_count(&self) -> usize {
        self.inner.lock().unwrap().folders.len()
    }

    pub fn find_child(&self, name: &str, parent: &Folder) -> Option<Folder> {
        self.inner
            .lock()
            .unwrap()
            .folders
            .iter()
            .find(|(f, p)| f.name == name && p.as_deref() == Some(parent.id.as_str()))
            .map(|(f, _)| f.clone())
    }

    /// Titles and byte counts of every upload, in order.
    pub fn uploads(&self) -> Vec<(String, usize)> {
        self.inner.lock().unwrap().uploads.clone()
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    pub fn fail_folder_creation(&self) {
        self.fail_folder_creation.store(true, Ordering::SeqCst);
    }

    /// Fail renames of the artifact currently carrying `title`.
    pub fn fail_rename_of(&self, title: &str) {
        self.failing_renames.lock().unwrap().insert(title.to_string());
    }

    pub fn rename_calls(&self) -> usize {
        self.rename_calls.load(Ordering::SeqCst)
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Highest number of listings observed in flight at once.
    pub fn max_concurrent_lists(&self) -> usize {
        self.max_active_lists.load(Ordering::SeqCst)
    }

    fn failure(message: &str) -> StorageError {
        StorageError::Status {
            status: 500,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn find_folder(&self, name: &str, parent: Option<&Folder>) -> Result<Option<Folder>, StorageError> {
        let parent_id = parent.map(|p| p.id.as_str());
        Ok(self
            .inner
            .lock()
            .unwrap()
            .folders
            .iter()
            .find(|(f, p)| f.name == name && p.as_deref() == parent_id)
            .map(|(f, _)| f.clone()))
    }

    async fn create_folder(&self, name: &str, parent: Option<&Folder>) -> Result<Folder, StorageError> {
        if self.fail_folder_creation.load(Ordering::SeqCst) {
            return Err(Self::failure("folder creation disabled"));
        }
        let mut inner = self.inner.lock().unwrap();
        let folder = Folder {
            id: inner.id("folder"),
            name: name.to_string(),
            link: Some(format!("https://storage.test/{name}")),
        };
        inner.folders.push((folder.clone(), parent.map(|p| p.id.clone())));
        Ok(folder)
    }

    async fn list_folder(&self, folder: &Folder, cancel: &CancellationToken) -> Result<Vec<RemoteArtifact>, StorageError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active_lists.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_lists.fetch_max(active, Ordering::SeqCst);

        let delay = *self.list_delay.lock().unwrap();
        let result = match delay {
            Some(delay) => tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(self.files_in(folder)),
                _ = cancel.cancelled() => Err(StorageError::Cancelled),
            },
            None => Ok(self.files_in(folder)),
        };

        self.active_lists.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn delete_artifact(&self, id: &str) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::failure("delete disabled"));
        }
        let mut inner = self.inner.lock().unwrap();
        let before = inner.files.len();
        inner.files.retain(|(_, a)| a.id != id);
        if inner.files.len() == before {
            return Err(StorageError::Status {
                status: 404,
                message: format!("no file {id}"),
            });
        }
        Ok(())
    }

    async fn rename_artifact(&self, id: &str, title: &str) -> Result<(), StorageError> {
        self.rename_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let failing = self.failing_renames.lock().unwrap().clone();
        let mut inner = self.inner.lock().unwrap();
        let (_, artifact) = inner
            .files
            .iter_mut()
            .find(|(_, a)| a.id == id)
            .ok_or_else(|| StorageError::Status {
                status: 404,
                message: format!("no file {id}"),
            })?;
        if failing.contains(&artifact.title) {
            return Err(Self::failure("rename disabled"));
        }
        artifact.title = title.to_string();
        Ok(())
    }

    async fn create_artifact(
        &self,
        folder: &Folder,
        title: &str,
        content_type: &str,
        mut body: ByteStream,
    ) -> Result<RemoteArtifact, StorageError> {
        let mut size = 0;
        while let Some(chunk) = body.next().await {
            size += chunk?.len();
        }

        let mut inner = self.inner.lock().unwrap();
        let artifact = RemoteArtifact::new(inner.id("upload"), title, content_type);
        inner.files.push((folder.id.clone(), artifact.clone()));
        inner.uploads.push((title.to_string(), size));
        Ok(artifact)
    }
}

/// Host fake streaming a fixed payload.
#[derive(Default)]
pub struct FakeHost {
    fail_capture: AtomicBool,
    captures: AtomicUsize,
}

impl FakeHost {
    pub const PAYLOAD: &'static [u8] = b"\x1f\x8b fake archive";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_capture(&self) {
        self.fail_capture.store(true, Ordering::SeqCst);
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostAccess for FakeHost {
    async fn capture_snapshot(&self, path: &str, _cancel: &CancellationToken) -> Result<ByteStream, HostError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.fail_capture.load(Ordering::SeqCst) {
            return Err(HostError::Command {
                command: format!("tar -czf - {path}"),
                status: 2,
                stderr: "No such file or directory".into(),
            });
        }
        let chunks = vec![Ok(Bytes::from_static(&Self::PAYLOAD[..4])), Ok(Bytes::from_static(&Self::PAYLOAD[4..]))];
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    async fn probe_permissions(&self) -> Result<PermissionReport, HostError> {
        Ok(PermissionReport::default())
    }
}
