//! Idempotent folder provisioning.

use super::{Folder, StorageClient};
use crate::utils::errors::StorageError;
use tracing::info;

/// Find `name` (inside `parent`, if given) or create it.
///
/// Returns the folder and whether it had to be created. Two callers racing
/// here may both create the folder; later lookups use whichever the service
/// returns first.
pub async fn ensure_folder<S>(
    storage: &S,
    name: &str,
    parent: Option<&Folder>,
) -> Result<(Folder, bool), StorageError>
where
    S: StorageClient + ?Sized,
{
    if let Some(folder) = storage.find_folder(name, parent).await? {
        return Ok((folder, false));
    }

    let folder = storage.create_folder(name, parent).await?;
    info!(folder = %folder.name, id = %folder.id, "Created folder");
    Ok((folder, true))
}
