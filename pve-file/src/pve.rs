//! Proxmox VE backend.
//!
//! [`PveClient`] wraps the `api2/json` REST API with an API token.
//! [`PveBackend`] combines it with an [`SshStreamer`] for uploads the API
//! cannot place (snippets, backups and disk images).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::backend::{BackendVersion, Datastore, DatastoreFile, StorageBackend, UploadRequest};
use crate::error::{FileError, Result};
use crate::ssh::SshStreamer;

/// How often the status of an upload task is polled.
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ContentEntry {
    volid: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StorageEntry {
    storage: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    version: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

impl TaskStatus {
    fn is_running(&self) -> bool {
        self.status != "stopped"
    }

    fn succeeded(&self) -> bool {
        self.exitstatus.as_deref() == Some("OK")
    }
}

/// Client for the Proxmox VE REST API.
pub struct PveClient {
    base: Url,
    api_token: String,
    http: Client,
}

impl PveClient {
    /// `endpoint` is the web UI address, e.g. `https://pve.example.com:8006/`.
    /// `api_token` has the form `user@realm!tokenid=secret`.
    pub fn new(endpoint: &str, api_token: &str, insecure: bool) -> Result<Self> {
        let base = Url::parse(endpoint)
            .map_err(|e| FileError::Backend(format!("invalid endpoint \"{}\": {}", endpoint, e)))?;
        if base.cannot_be_a_base() {
            return Err(FileError::Backend(format!(
                "invalid endpoint \"{}\"",
                endpoint
            )));
        }

        let http = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(FileError::HttpClient)?;

        Ok(Self {
            base,
            api_token: api_token.to_string(),
            http,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| FileError::Backend(format!("invalid endpoint \"{}\"", self.base)))?
            .pop_if_empty()
            .extend(["api2", "json"])
            .extend(segments);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = request
            .header(AUTHORIZATION, format!("PVEAPIToken={}", self.api_token))
            .send()
            .await
            .map_err(|source| FileError::Request {
                what: what.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::NOT_FOUND || body.contains("does not exist") {
                return Err(FileError::NotFound(what.to_string()));
            }
            return Err(FileError::Backend(format!(
                "{}: {} {}",
                what,
                status,
                body.trim()
            )));
        }

        let envelope: Envelope<T> = response.json().await.map_err(|source| FileError::Request {
            what: what.to_string(),
            source,
        })?;
        Ok(envelope.data)
    }

    pub async fn list_content(&self, node: &str, storage: &str) -> Result<Vec<DatastoreFile>> {
        let url = self.url(&["nodes", node, "storage", storage, "content"])?;
        let entries: Vec<ContentEntry> = self
            .send(
                self.http.get(url),
                &format!("content of datastore {} on node {}", storage, node),
            )
            .await?;

        Ok(entries
            .into_iter()
            .map(|e| DatastoreFile {
                volume_id: e.volid,
                content_type: e.content,
            })
            .collect())
    }

    pub async fn storage(&self, storage: &str) -> Result<Datastore> {
        let url = self.url(&["storage", storage])?;
        let entry: StorageEntry = self
            .send(self.http.get(url), &format!("datastore {}", storage))
            .await?;

        Ok(Datastore {
            storage: entry.storage,
            path: entry.path,
            content: entry
                .content
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }

    /// Upload through `POST .../upload` and wait for the resulting task.
    pub async fn upload(&self, node: &str, storage: &str, request: &UploadRequest) -> Result<()> {
        let file = tokio::fs::File::open(&request.local_path).await?;
        let len = file.metadata().await?.len();

        let part = Part::stream_with_length(Body::from(file), len)
            .file_name(request.file_name.clone());
        let form = Form::new()
            .text("content", request.content_type.clone())
            .part("filename", part);

        let url = self.url(&["nodes", node, "storage", storage, "upload"])?;
        let upid: String = self
            .send(
                self.http.post(url).multipart(form),
                &format!("upload of {} to datastore {}", request.file_name, storage),
            )
            .await?;

        debug!(node = %node, upid = %upid, bytes = len, "Upload task started");

        self.wait_for_task(node, &upid).await
    }

    /// Poll a task until it stops. Bounded by the caller's timeout.
    pub async fn wait_for_task(&self, node: &str, upid: &str) -> Result<()> {
        let url = self.url(&["nodes", node, "tasks", upid, "status"])?;

        loop {
            let status: TaskStatus = self
                .send(self.http.get(url.clone()), &format!("task {}", upid))
                .await?;

            if !status.is_running() {
                if status.succeeded() {
                    return Ok(());
                }
                return Err(FileError::UploadFailed(format!(
                    "task {} failed: {}",
                    upid,
                    status.exitstatus.as_deref().unwrap_or("unknown exit status")
                )));
            }

            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    pub async fn delete_content(&self, node: &str, storage: &str, volume_id: &str) -> Result<()> {
        let url = self.url(&["nodes", node, "storage", storage, "content", volume_id])?;
        let _: serde_json::Value = self
            .send(self.http.delete(url), &format!("file {}", volume_id))
            .await?;
        Ok(())
    }

    pub async fn version(&self) -> Result<BackendVersion> {
        let url = self.url(&["version"])?;
        let info: VersionInfo = self.send(self.http.get(url), "version").await?;
        info.version.parse()
    }
}

/// [`StorageBackend`] backed by a Proxmox VE cluster.
pub struct PveBackend {
    api: PveClient,
    ssh: SshStreamer,
}

impl PveBackend {
    pub fn new(api: PveClient, ssh: SshStreamer) -> Self {
        Self { api, ssh }
    }
}

#[async_trait]
impl StorageBackend for PveBackend {
    async fn list_files(&self, node: &str, datastore: &str) -> Result<Vec<DatastoreFile>> {
        self.api.list_content(node, datastore).await
    }

    async fn api_upload(
        &self,
        node: &str,
        datastore: &str,
        request: &UploadRequest,
    ) -> Result<()> {
        info!(
            node = %node,
            datastore = %datastore,
            file = %request.file_name,
            "Uploading file via API"
        );
        self.api.upload(node, datastore, request).await
    }

    async fn get_datastore(&self, datastore: &str) -> Result<Datastore> {
        self.api.storage(datastore).await
    }

    async fn stream_upload(
        &self,
        node: &str,
        datastore_path: &str,
        request: &UploadRequest,
    ) -> Result<()> {
        self.ssh.stream_upload(node, datastore_path, request).await
    }

    async fn delete_file(&self, node: &str, datastore: &str, volume_id: &str) -> Result<()> {
        self.api.delete_content(node, datastore, volume_id).await
    }

    async fn version(&self) -> Result<BackendVersion> {
        self.api.version().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = PveClient::new("https://pve.example.com:8006/", "root@pam!t=s", false).unwrap();

        assert_eq!(
            client
                .url(&["nodes", "pve1", "storage", "local", "content"])
                .unwrap()
                .as_str(),
            "https://pve.example.com:8006/api2/json/nodes/pve1/storage/local/content"
        );
        assert_eq!(
            client
                .url(&["nodes", "pve1", "storage", "local", "content", "local:iso/a b.iso"])
                .unwrap()
                .as_str(),
            "https://pve.example.com:8006/api2/json/nodes/pve1/storage/local/content/local:iso%2Fa%20b.iso"
        );
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(PveClient::new("not a url", "t", false).is_err());
        assert!(PveClient::new("mailto:admin@example.com", "t", false).is_err());
    }

    #[test]
    fn test_task_status() {
        let running: TaskStatus = serde_json::from_str(r#"{"status": "running"}"#).unwrap();
        assert!(running.is_running());

        let ok: TaskStatus =
            serde_json::from_str(r#"{"status": "stopped", "exitstatus": "OK"}"#).unwrap();
        assert!(!ok.is_running());
        assert!(ok.succeeded());

        let failed: TaskStatus =
            serde_json::from_str(r#"{"status": "stopped", "exitstatus": "command failed"}"#)
                .unwrap();
        assert!(!failed.succeeded());
    }
}
