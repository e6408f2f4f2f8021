//! File reconciler
//!
//! Entry points for the host: create, read, update, delete and import of a
//! single file on a datastore. There is no in-place update; identity-affecting
//! changes are handled by the host as delete followed by create.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::FileAuditLogger;
use crate::backend::{BackendVersion, FileMode, StorageBackend};
use crate::content::{self, ContentType};
use crate::diag::{Diagnostics, Outcome};
use crate::drift::{self, ObservedMetadata};
use crate::error::{ErrorKind, FileError, Result};
use crate::source::{self, SourceDescriptor, SourceFile, SourceRaw};
use crate::upload::{UploadRouter, UploadTarget};
use crate::volume_id::VolumeId;

/// Default upload timeout in seconds.
pub const DEFAULT_TIMEOUT_UPLOAD: u64 = 1800;

fn default_overwrite() -> bool {
    true
}

fn default_timeout_upload() -> u64 {
    DEFAULT_TIMEOUT_UPLOAD
}

/// Desired state of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub node_name: String,
    pub datastore_id: String,
    /// Explicit content type; inferred from the file name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<SourceFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_raw: Option<SourceRaw>,
    /// Octal file mode, only honored for streamed uploads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<String>,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
    /// Seconds
    #[serde(default = "default_timeout_upload")]
    pub timeout_upload: u64,
}

impl FileSpec {
    pub fn source(&self) -> Result<SourceDescriptor> {
        SourceDescriptor::from_blocks(self.source_file.as_ref(), self.source_raw.as_ref())
    }

    pub fn file_mode(&self) -> Result<Option<FileMode>> {
        match self.file_mode.as_deref() {
            None | Some("") => Ok(None),
            Some(mode) => mode.parse().map(Some),
        }
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_upload)
    }
}

/// Observed state of a file, as reported back to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    /// `datastore_id:content_type/file_name`
    pub id: String,
    pub node_name: String,
    pub datastore_id: String,
    pub content_type: String,
    pub file_name: String,
    #[serde(default)]
    pub file_modification_date: String,
    #[serde(default)]
    pub file_size: i64,
    #[serde(default)]
    pub file_tag: String,
    /// The external source changed since the last read
    #[serde(default)]
    pub source_changed: bool,
}

impl FileState {
    pub fn metadata(&self) -> ObservedMetadata {
        ObservedMetadata {
            modification_date: self.file_modification_date.clone(),
            size: self.file_size,
            tag: self.file_tag.clone(),
        }
    }

    fn set_metadata(&mut self, metadata: ObservedMetadata) {
        self.file_modification_date = metadata.modification_date;
        self.file_size = metadata.size;
        self.file_tag = metadata.tag;
    }
}

/// Reconciles files on datastores through a [`StorageBackend`].
pub struct FileReconciler {
    backend: Arc<dyn StorageBackend>,
    router: UploadRouter,
    audit: Arc<FileAuditLogger>,
    tmp_dir: PathBuf,
}

impl FileReconciler {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        audit: Arc<FileAuditLogger>,
        tmp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            router: UploadRouter::new(Arc::clone(&backend)),
            backend,
            audit,
            tmp_dir: tmp_dir.into(),
        }
    }

    /// Upload the file and return its observed state.
    ///
    /// The whole operation is bounded by `timeout_upload`. Temporary
    /// files are removed whether it succeeds, fails or times out. A file that
    /// was uploaded before the operation failed is deleted again.
    pub async fn create(&self, spec: &FileSpec) -> Result<Outcome<FileState>> {
        let timeout = spec.upload_timeout();
        let mut uploaded = None;

        let result =
            match tokio::time::timeout(timeout, self.create_inner(spec, &mut uploaded)).await {
                Ok(result) => result,
                Err(_) => Err(FileError::Timeout(timeout)),
            };

        if let Err(ref e) = result {
            if let Some(volume_id) = uploaded {
                self.roll_back(spec, &volume_id).await;
            }
            let name = spec
                .source()
                .and_then(|s| s.file_name())
                .unwrap_or_default();
            self.audit
                .upload_failed(&spec.node_name, &name, &e.to_string());
        }

        result
    }

    /// Remove a file left behind by a failed create.
    async fn roll_back(&self, spec: &FileSpec, volume_id: &str) {
        match self
            .backend
            .delete_file(&spec.node_name, &spec.datastore_id, volume_id)
            .await
        {
            Ok(()) => {
                info!(volume_id = %volume_id, "Removed file after failed create");
                self.audit.upload_rolled_back(&spec.node_name, volume_id);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(volume_id = %volume_id, error = %e, "Failed to remove file after failed create");
            }
        }
    }

    async fn create_inner(
        &self,
        spec: &FileSpec,
        uploaded: &mut Option<String>,
    ) -> Result<Outcome<FileState>> {
        let mut diagnostics = Diagnostics::new();

        let source = spec.source()?;
        source.validate()?;
        let mode = spec.file_mode()?;
        let file_name = source.file_name()?;
        let content_type = self.content_type(spec, &file_name).await?;

        let overwritten = self
            .router
            .check_collision(
                &spec.node_name,
                &spec.datastore_id,
                &file_name,
                spec.overwrite,
                &mut diagnostics,
            )
            .await?;

        let artifact = source::resolve(&source, &self.tmp_dir).await?;

        let target = UploadTarget {
            node: &spec.node_name,
            datastore: &spec.datastore_id,
            content_type,
        };
        let volume_id = VolumeId::new(&spec.datastore_id, content_type.as_str(), &file_name);
        let id = volume_id.to_string();

        self.router
            .upload(&target, &artifact, mode, &mut diagnostics)
            .await?;
        *uploaded = Some(id.clone());
        drop(artifact);

        for existing in &overwritten {
            self.audit
                .file_overwritten(&spec.node_name, &existing.to_string());
        }
        self.audit.file_uploaded(
            &spec.node_name,
            &id,
            self.router.transport_for(content_type).name(),
        );

        let state = FileState {
            id: id.clone(),
            node_name: spec.node_name.clone(),
            datastore_id: spec.datastore_id.clone(),
            content_type: content_type.as_str().to_string(),
            file_name,
            ..Default::default()
        };

        let read = self.read(spec, &state).await?;
        diagnostics.extend(read.diagnostics);

        match read.value {
            Some(state) => Ok(Outcome::new(state, diagnostics)),
            None => Err(FileError::ReadBackFailed(id)),
        }
    }

    async fn content_type(&self, spec: &FileSpec, file_name: &str) -> Result<ContentType> {
        if let Some(explicit) = spec.content_type.as_deref().filter(|c| !c.is_empty()) {
            return content::classify(file_name, Some(explicit), false);
        }

        let version = self.backend_version().await;
        content::classify(file_name, None, version.supports_import_content_type())
    }

    async fn backend_version(&self) -> BackendVersion {
        match self.backend.version().await {
            Ok(version) => version,
            Err(e) => {
                warn!(
                    error = %e,
                    assumed = %BackendVersion::MINIMUM,
                    "Failed to determine backend version"
                );
                BackendVersion::MINIMUM
            }
        }
    }

    /// Refresh the observed state. `None` means the file no longer exists.
    pub async fn read(&self, spec: &FileSpec, state: &FileState) -> Result<Outcome<Option<FileState>>> {
        let diagnostics = Diagnostics::new();

        let files = self
            .backend
            .list_files(&spec.node_name, &spec.datastore_id)
            .await?;

        let Some(file) = files.into_iter().find(|f| f.volume_id == state.id) else {
            debug!(volume_id = %state.id, "File not found on datastore");
            return Ok(Outcome::new(None, diagnostics));
        };

        let volume_id = VolumeId::parse(&file.volume_id)?;

        let mut next = state.clone();
        next.node_name = spec.node_name.clone();
        next.datastore_id = volume_id.datastore_id;
        next.file_name = volume_id.file_name;
        next.content_type = file.content_type;
        next.source_changed = false;

        if let Some(source_file) = &spec.source_file {
            let previous = state.metadata();
            let observed = drift::observe(source_file).await?;

            next.source_changed = drift::has_changed(&previous, &observed);
            if observed.is_known() {
                next.set_metadata(observed);
            }

            if next.source_changed {
                info!(
                    volume_id = %next.id,
                    source = %source_file.path,
                    "Source file changed since last read"
                );
            }
        }

        Ok(Outcome::new(Some(next), diagnostics))
    }

    /// No remote action; only host-side attributes such as the upload timeout
    /// can change without recreating the file.
    pub async fn update(&self, spec: &FileSpec, state: &FileState) -> Result<Outcome<FileState>> {
        spec.file_mode()?;
        debug!(
            volume_id = %state.id,
            timeout_upload = spec.timeout_upload,
            "Update requires no remote action"
        );
        Ok(Outcome::new(state.clone(), Diagnostics::new()))
    }

    /// Delete the file. A file that is already gone counts as deleted.
    pub async fn delete(&self, spec: &FileSpec, state: &FileState) -> Result<Outcome<()>> {
        match self
            .backend
            .delete_file(&spec.node_name, &spec.datastore_id, &state.id)
            .await
        {
            Ok(()) => self.audit.file_deleted(&spec.node_name, &state.id),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(volume_id = %state.id, "File already absent");
            }
            Err(e) => return Err(e),
        }

        Ok(Outcome::new((), Diagnostics::new()))
    }

    /// Build the initial state from an import ID `node/datastore_id:content_type/file_name`.
    pub fn import(id: &str) -> Result<FileState> {
        let (node_name, volume_id) = VolumeId::parse_with_node(id)?;

        Ok(FileState {
            id: volume_id.to_string(),
            node_name,
            datastore_id: volume_id.datastore_id,
            content_type: volume_id.content_type,
            file_name: volume_id.file_name,
            ..Default::default()
        })
    }
}
