//! Upload routing
//!
//! ISO images, container templates and import images go through the backend's
//! upload API. Everything else (snippets, backups, disk images) is streamed
//! straight into the datastore directory on the node.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::backend::{FileMode, StorageBackend, UploadRequest};
use crate::content::ContentType;
use crate::diag::Diagnostics;
use crate::error::{FileError, Result};
use crate::source::ResolvedArtifact;
use crate::volume_id::VolumeId;

/// Where an artifact is uploaded to.
#[derive(Debug, Clone, Copy)]
pub struct UploadTarget<'a> {
    pub node: &'a str,
    pub datastore: &'a str,
    pub content_type: ContentType,
}

/// A way of getting a local file onto a datastore.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upload(
        &self,
        target: &UploadTarget<'_>,
        artifact: &ResolvedArtifact,
        mode: Option<FileMode>,
        diagnostics: &mut Diagnostics,
    ) -> Result<()>;
}

/// Single API call, the backend manages placement.
pub struct ApiUpload {
    backend: Arc<dyn StorageBackend>,
}

impl ApiUpload {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl UploadTransport for ApiUpload {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn upload(
        &self,
        target: &UploadTarget<'_>,
        artifact: &ResolvedArtifact,
        mode: Option<FileMode>,
        _diagnostics: &mut Diagnostics,
    ) -> Result<()> {
        let request = UploadRequest {
            content_type: target.content_type.as_str().to_string(),
            file_name: artifact.file_name.clone(),
            local_path: artifact.path.clone(),
            mode,
        };

        self.backend
            .api_upload(target.node, target.datastore, &request)
            .await
    }
}

/// Streams the file into the datastore directory on the node.
pub struct StreamUpload {
    backend: Arc<dyn StorageBackend>,
}

impl StreamUpload {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl UploadTransport for StreamUpload {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn upload(
        &self,
        target: &UploadTarget<'_>,
        artifact: &ResolvedArtifact,
        mode: Option<FileMode>,
        diagnostics: &mut Diagnostics,
    ) -> Result<()> {
        let datastore = self.backend.get_datastore(target.datastore).await?;

        let path = match datastore.path.as_deref() {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => return Err(FileError::NoDestinationPath(target.datastore.to_string())),
        };

        // The backend is authoritative; an unsupported content type only warns.
        let content_type = target.content_type.as_str();
        if !datastore.content.iter().any(|c| c == content_type) {
            let mut supported = datastore.content.clone();
            supported.sort();
            diagnostics.warn(format!(
                "the datastore \"{}\" does not support content type \"{}\"; supported content types are: {:?}",
                target.datastore, content_type, supported
            ));
        }

        let request = UploadRequest {
            content_type: target.content_type.directory().to_string(),
            file_name: artifact.file_name.clone(),
            local_path: artifact.path.clone(),
            mode,
        };

        self.backend.stream_upload(target.node, &path, &request).await
    }
}

/// Picks the transport for a content type and guards against name collisions.
pub struct UploadRouter {
    backend: Arc<dyn StorageBackend>,
    api: Box<dyn UploadTransport>,
    stream: Box<dyn UploadTransport>,
}

impl UploadRouter {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            api: Box::new(ApiUpload::new(Arc::clone(&backend))),
            stream: Box::new(StreamUpload::new(Arc::clone(&backend))),
            backend,
        }
    }

    pub fn transport_for(&self, content_type: ContentType) -> &dyn UploadTransport {
        if content_type.uses_api_upload() {
            self.api.as_ref()
        } else {
            self.stream.as_ref()
        }
    }

    /// Fail if a file named `file_name` already exists on the datastore, unless
    /// `overwrite` is set, in which case only a warning is recorded. Returns the
    /// files that will be overwritten.
    pub async fn check_collision(
        &self,
        node: &str,
        datastore: &str,
        file_name: &str,
        overwrite: bool,
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<VolumeId>> {
        let files = self.backend.list_files(node, datastore).await?;
        let mut overwritten = Vec::new();

        for file in files {
            let volume_id = match VolumeId::parse(&file.volume_id) {
                Ok(id) => id,
                Err(e) => {
                    warn!(volume_id = %file.volume_id, error = %e, "Failed to parse volume ID");
                    continue;
                }
            };

            if volume_id.file_name != file_name {
                continue;
            }

            if !overwrite {
                return Err(FileError::AlreadyExists(volume_id.to_string()));
            }

            diagnostics.warn(format!(
                "the existing file \"{}\" has been overwritten by the resource",
                volume_id
            ));
            overwritten.push(volume_id);
        }

        Ok(overwritten)
    }

    pub async fn upload(
        &self,
        target: &UploadTarget<'_>,
        artifact: &ResolvedArtifact,
        mode: Option<FileMode>,
        diagnostics: &mut Diagnostics,
    ) -> Result<()> {
        let transport = self.transport_for(target.content_type);

        debug!(
            node = %target.node,
            datastore = %target.datastore,
            content_type = %target.content_type,
            transport = transport.name(),
            file = %artifact.file_name,
            "Uploading file"
        );

        transport
            .upload(target, artifact, mode, diagnostics)
            .await?;

        info!(
            node = %target.node,
            datastore = %target.datastore,
            file = %artifact.file_name,
            transport = transport.name(),
            "Upload completed"
        );

        Ok(())
    }
}
