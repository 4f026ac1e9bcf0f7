//! Google Drive v3 client for the publish contract.
//!
//! Uploads go through the Drive resumable-upload protocol: one initiate
//! request yields a session URI, then the file body is PUT in
//! `chunk_size` ranges. The protocol's retry/ack semantics belong to the
//! API; this client only sequences the requests and classifies failures
//! so the coordinator can tell retryable from fatal.

use std::path::Path;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::{CloudStore, RemoteRef};
use crate::config::UploadConfig;
use crate::error::{PublishErrorKind, Result, SyncError};

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Deserialize)]
struct FileMeta {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileMeta>,
}

/// Drive API client. Authentication is out of scope: the bearer token
/// comes pre-minted from config or environment.
pub struct DriveClient {
    http: reqwest::Client,
    api_base: String,
    upload_base: String,
    token: String,
}

impl DriveClient {
    /// Build a client from the upload configuration.
    ///
    /// Fails with a configuration error when no access token is
    /// available, so a misconfigured run aborts before any network call.
    pub fn new(config: &UploadConfig) -> Result<Self> {
        let token = config.resolve_access_token().ok_or_else(|| {
            SyncError::Config(format!(
                "No drive access token: set upload.access_token or export {}",
                config.access_token_env
            ))
        })?;

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::publish(PublishErrorKind::Network, e.to_string()))?;

        Ok(Self {
            http,
            api_base: config.api_base_url.trim_end_matches('/').to_string(),
            upload_base: config.upload_base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Map an unsuccessful response to a publish error kind.
    fn classify(status: StatusCode, body: &str) -> PublishErrorKind {
        match status.as_u16() {
            401 => PublishErrorKind::Auth,
            403 => {
                let body = body.to_ascii_lowercase();
                if body.contains("quota") || body.contains("storage") {
                    PublishErrorKind::Quota
                } else if body.contains("rate") {
                    PublishErrorKind::RateLimited
                } else {
                    PublishErrorKind::Auth
                }
            }
            429 => PublishErrorKind::RateLimited,
            _ => PublishErrorKind::Network,
        }
    }

    /// Escape a value embedded in a Drive search query.
    fn escape_query_value(value: &str) -> String {
        value.replace('\\', "\\\\").replace('\'', "\\'")
    }

    fn transport_error(e: reqwest::Error) -> SyncError {
        SyncError::publish(PublishErrorKind::Network, e.to_string())
    }

    /// Turn a non-success response into a classified publish error.
    async fn fail_from_response(context: &str, response: reqwest::Response) -> SyncError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let kind = Self::classify(status, &body);
        let detail: String = body.chars().take(200).collect();
        SyncError::publish(kind, format!("{context}: HTTP {status}: {detail}"))
    }

    async fn search(&self, query: &str) -> Result<Option<RemoteRef>> {
        let response = self
            .http
            .get(format!("{}/files", self.api_base))
            .bearer_auth(&self.token)
            .query(&[
                ("q", query),
                ("fields", "files(id, name)"),
                ("pageSize", "1"),
            ])
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::fail_from_response("file lookup", response).await);
        }

        let list: FileList = response.json().await.map_err(Self::transport_error)?;
        Ok(list
            .files
            .into_iter()
            .next()
            .map(|f| RemoteRef { id: f.id, name: f.name }))
    }

    /// Start a resumable upload session and return its URI.
    async fn initiate_resumable(&self, name: &str, folder_id: &str) -> Result<String> {
        let metadata = serde_json::json!({
            "name": name,
            "parents": [folder_id],
        });

        let response = self
            .http
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(&self.token)
            .query(&[("uploadType", "resumable")])
            .json(&metadata)
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::fail_from_response("upload initiation", response).await);
        }

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                SyncError::publish(
                    PublishErrorKind::Network,
                    "upload initiation returned no session URI",
                )
            })
    }
}

#[async_trait]
impl CloudStore for DriveClient {
    async fn upload_file(
        &self,
        path: &Path,
        folder_id: &str,
        chunk_size: u64,
    ) -> Result<RemoteRef> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let total = std::fs::metadata(path)?.len();

        let session_uri = self.initiate_resumable(&name, folder_id).await?;
        debug!("Resumable session opened for {name} ({total} bytes)");

        if total == 0 {
            let response = self
                .http
                .put(&session_uri)
                .bearer_auth(&self.token)
                .header(CONTENT_LENGTH, 0)
                .send()
                .await
                .map_err(Self::transport_error)?;
            if !response.status().is_success() {
                return Err(Self::fail_from_response("empty upload", response).await);
            }
            let meta: FileMeta = response.json().await.map_err(Self::transport_error)?;
            return Ok(RemoteRef { id: meta.id, name });
        }

        let mut file = tokio::fs::File::open(path).await?;
        let mut offset: u64 = 0;

        while offset < total {
            let len = chunk_size.min(total - offset);
            let mut buffer = vec![0u8; len as usize];
            file.read_exact(&mut buffer).await?;

            let range = format!("bytes {}-{}/{}", offset, offset + len - 1, total);
            let response = self
                .http
                .put(&session_uri)
                .bearer_auth(&self.token)
                .header(CONTENT_RANGE, range)
                .body(buffer)
                .send()
                .await
                .map_err(Self::transport_error)?;

            match response.status().as_u16() {
                // 308: the API acknowledged this range, keep going.
                308 => {
                    offset += len;
                    debug!("Uploaded {offset}/{total} bytes of {name}");
                }
                200 | 201 => {
                    let meta: FileMeta = response.json().await.map_err(Self::transport_error)?;
                    info!("Uploaded {name} ({total} bytes) as {}", meta.id);
                    return Ok(RemoteRef { id: meta.id, name });
                }
                _ => {
                    return Err(Self::fail_from_response("chunk upload", response).await);
                }
            }
        }

        Err(SyncError::publish(
            PublishErrorKind::Network,
            format!("upload of {name} ended without a completion response"),
        ))
    }

    async fn find_existing(&self, name: &str, folder_id: &str) -> Result<Option<RemoteRef>> {
        let query = format!(
            "name='{}' and '{}' in parents and trashed=false",
            Self::escape_query_value(name),
            Self::escape_query_value(folder_id),
        );
        self.search(&query).await
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<RemoteRef> {
        let query = format!(
            "name='{}' and '{}' in parents and mimeType='{}' and trashed=false",
            Self::escape_query_value(name),
            Self::escape_query_value(parent_id),
            FOLDER_MIME_TYPE,
        );
        if let Some(existing) = self.search(&query).await? {
            debug!("Reusing existing folder {} ({})", existing.name, existing.id);
            return Ok(existing);
        }

        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent_id],
        });

        let response = self
            .http
            .post(format!("{}/files", self.api_base))
            .bearer_auth(&self.token)
            .query(&[("fields", "id, name")])
            .json(&metadata)
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::fail_from_response("folder creation", response).await);
        }

        let meta: FileMeta = response.json().await.map_err(Self::transport_error)?;
        info!("Created folder {name} ({})", meta.id);
        Ok(RemoteRef {
            id: meta.id,
            name: name.to_string(),
        })
    }
}
