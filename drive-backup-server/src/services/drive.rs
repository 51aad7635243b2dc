//! Google Drive v3 storage client.

use crate::services::drive_auth::TokenProvider;
use async_trait::async_trait;
use backup_rotation::{ByteStream, Folder, RemoteArtifact, StorageClient, StorageError};
use bytes::Bytes;
use futures_util::{future, stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,webViewLink";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,webViewLink)";
const PAGE_SIZE: &str = "1000";
/// Applies to metadata calls only; uploads run as long as the host streams.
const METADATA_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: String,
    web_view_link: Option<String>,
}

impl DriveFile {
    fn into_artifact(self) -> RemoteArtifact {
        RemoteArtifact::new(self.id, self.name, self.mime_type)
    }

    fn into_folder(self) -> Folder {
        Folder {
            id: self.id,
            name: self.name,
            link: self.web_view_link,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewFile<'a> {
    name: &'a str,
    mime_type: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parents: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct Rename<'a> {
    name: &'a str,
}

pub struct DriveClient {
    http: reqwest::Client,
    auth: TokenProvider,
}

impl DriveClient {
    pub fn new(http: reqwest::Client, auth: TokenProvider) -> Self {
        Self { http, auth }
    }

    /// Send an authorized request, retrying once with a fresh token on 401.
    async fn execute<F>(&self, build: F) -> Result<Response, StorageError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retried = false;
        loop {
            let token = self.auth.access_token().await?;
            let response = build()
                .bearer_auth(token)
                .timeout(METADATA_TIMEOUT)
                .send()
                .await
                .map_err(request_error)?;

            if response.status() == StatusCode::UNAUTHORIZED && !retried {
                tracing::debug!("Drive rejected access token, refreshing");
                self.auth.invalidate().await;
                retried = true;
                continue;
            }
            return check_status(response).await;
        }
    }
}

async fn check_status(response: Response) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(StorageError::Status {
        status: status.as_u16(),
        message,
    })
}

fn request_error(e: reqwest::Error) -> StorageError {
    StorageError::Request(e.to_string())
}

fn decode_error(e: reqwest::Error) -> StorageError {
    StorageError::InvalidResponse(e.to_string())
}

/// Quote a value for a Drive `q` string literal.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn folder_query(name: &str, parent: Option<&str>) -> String {
    let mut query = format!(
        "mimeType = '{FOLDER_MIME_TYPE}' and name = '{}' and trashed = false",
        escape_query(name)
    );
    if let Some(parent) = parent {
        query.push_str(&format!(" and '{}' in parents", escape_query(parent)));
    }
    query
}

fn children_query(folder_id: &str) -> String {
    format!("'{}' in parents and trashed = false", escape_query(folder_id))
}

/// Opening and closing parts of a multipart/related upload around the media.
fn multipart_frame(boundary: &str, metadata: &str, content_type: &str) -> (String, String) {
    let head = format!(
        "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{boundary}\r\nContent-Type: {content_type}\r\n\r\n"
    );
    let tail = format!("\r\n--{boundary}--\r\n");
    (head, tail)
}

#[async_trait]
impl StorageClient for DriveClient {
    async fn find_folder(&self, name: &str, parent: Option<&Folder>) -> Result<Option<Folder>, StorageError> {
        let query = folder_query(name, parent.map(|p| p.id.as_str()));
        let url = format!("{API_BASE}/files");
        let list: FileList = self
            .execute(|| {
                self.http.get(&url).query(&[
                    ("q", query.as_str()),
                    ("fields", LIST_FIELDS),
                    ("spaces", "drive"),
                    ("pageSize", "10"),
                ])
            })
            .await?
            .json()
            .await
            .map_err(decode_error)?;

        Ok(list.files.into_iter().next().map(DriveFile::into_folder))
    }

    async fn create_folder(&self, name: &str, parent: Option<&Folder>) -> Result<Folder, StorageError> {
        let body = NewFile {
            name,
            mime_type: FOLDER_MIME_TYPE,
            parents: parent.map(|p| p.id.as_str()).into_iter().collect(),
        };
        let url = format!("{API_BASE}/files");
        let file: DriveFile = self
            .execute(|| self.http.post(&url).query(&[("fields", FILE_FIELDS)]).json(&body))
            .await?
            .json()
            .await
            .map_err(decode_error)?;

        tracing::info!(folder = %name, id = %file.id, "Created Drive folder");
        Ok(file.into_folder())
    }

    async fn list_folder(&self, folder: &Folder, cancel: &CancellationToken) -> Result<Vec<RemoteArtifact>, StorageError> {
        let query = children_query(&folder.id);
        let url = format!("{API_BASE}/files");
        let mut artifacts = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let page: FileList = self
                .execute(|| {
                    let request = self.http.get(&url).query(&[
                        ("q", query.as_str()),
                        ("fields", LIST_FIELDS),
                        ("spaces", "drive"),
                        ("pageSize", PAGE_SIZE),
                    ]);
                    match &page_token {
                        Some(token) => request.query(&[("pageToken", token.as_str())]),
                        None => request,
                    }
                })
                .await?
                .json()
                .await
                .map_err(decode_error)?;

            artifacts.extend(page.files.into_iter().map(DriveFile::into_artifact));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::debug!(folder = %folder.name, count = artifacts.len(), "Listed Drive folder");
        Ok(artifacts)
    }

    async fn delete_artifact(&self, id: &str) -> Result<(), StorageError> {
        let url = format!("{API_BASE}/files/{id}");
        self.execute(|| self.http.delete(&url)).await?;
        Ok(())
    }

    async fn rename_artifact(&self, id: &str, title: &str) -> Result<(), StorageError> {
        let url = format!("{API_BASE}/files/{id}");
        let body = Rename { name: title };
        self.execute(|| self.http.patch(&url).json(&body)).await?;
        Ok(())
    }

    async fn create_artifact(
        &self,
        folder: &Folder,
        title: &str,
        content_type: &str,
        body: ByteStream,
    ) -> Result<RemoteArtifact, StorageError> {
        let metadata = serde_json::to_string(&NewFile {
            name: title,
            mime_type: content_type,
            parents: vec![folder.id.as_str()],
        })
        .map_err(|e| StorageError::Request(e.to_string()))?;

        let boundary = format!("drive-backup-{}", Uuid::new_v4().simple());
        let (head, tail) = multipart_frame(&boundary, &metadata, content_type);
        let payload = stream::once(future::ready(Ok::<_, std::io::Error>(Bytes::from(head))))
            .chain(body)
            .chain(stream::once(future::ready(Ok(Bytes::from(tail)))));

        // A streamed body cannot be replayed, so no 401 retry here.
        let token = self.auth.access_token().await?;
        let response = self
            .http
            .post(format!("{UPLOAD_BASE}/files"))
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .bearer_auth(token)
            .header(CONTENT_TYPE, format!("multipart/related; boundary={boundary}"))
            .body(reqwest::Body::wrap_stream(payload))
            .send()
            .await
            .map_err(request_error)?;

        let file: DriveFile = check_status(response).await?.json().await.map_err(decode_error)?;
        tracing::info!(title = %file.name, id = %file.id, "Uploaded archive to Drive");
        Ok(file.into_artifact())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_query() {
        assert_eq!(escape_query("plain"), "plain");
        assert_eq!(escape_query("o'brien"), "o\\'brien");
        assert_eq!(escape_query("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_folder_query() {
        assert_eq!(
            folder_query("vps-backups", None),
            "mimeType = 'application/vnd.google-apps.folder' and name = 'vps-backups' and trashed = false"
        );
        assert_eq!(
            folder_query("web", Some("root-id")),
            "mimeType = 'application/vnd.google-apps.folder' and name = 'web' and trashed = false and 'root-id' in parents"
        );
    }

    #[test]
    fn test_children_query() {
        assert_eq!(children_query("abc"), "'abc' in parents and trashed = false");
    }

    #[test]
    fn test_multipart_frame() {
        let (head, tail) = multipart_frame("b1", r#"{"name":"x"}"#, "application/gzip");
        assert!(head.starts_with("--b1\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{\"name\":\"x\"}\r\n"));
        assert!(head.ends_with("--b1\r\nContent-Type: application/gzip\r\n\r\n"));
        assert_eq!(tail, "\r\n--b1--\r\n");
    }

    #[test]
    fn test_new_file_metadata() {
        let json = serde_json::to_value(NewFile {
            name: "web-01/03/24-1.tar.gz",
            mime_type: "application/gzip",
            parents: vec!["folder-1"],
        })
        .unwrap();
        assert_eq!(json["mimeType"], "application/gzip");
        assert_eq!(json["parents"][0], "folder-1");

        let top_level = serde_json::to_value(NewFile {
            name: "root",
            mime_type: FOLDER_MIME_TYPE,
            parents: Vec::new(),
        })
        .unwrap();
        assert!(top_level.get("parents").is_none());
    }

    #[test]
    fn test_drive_file_conversion() {
        let file: DriveFile = serde_json::from_str(
            r#"{"id": "f1", "name": "web", "mimeType": "application/vnd.google-apps.folder",
                "webViewLink": "https://drive.google.com/drive/folders/f1"}"#,
        )
        .unwrap();
        let folder = file.into_folder();
        assert_eq!(folder.id, "f1");
        assert_eq!(folder.link.as_deref(), Some("https://drive.google.com/drive/folders/f1"));
    }
}
