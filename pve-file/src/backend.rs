//! Storage backend interface.
//!
//! The reconciler only talks to the cluster through [`StorageBackend`]. The
//! production implementation lives in [`crate::pve`]; tests use in-memory fakes.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::{FileError, Result};

/// One entry of a datastore content listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreFile {
    pub volume_id: String,
    pub content_type: String,
}

/// Datastore configuration relevant for streaming uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Datastore {
    pub storage: String,
    /// Mount path on the nodes, only set for file-based storages
    pub path: Option<String>,
    /// Content types the datastore is configured for
    pub content: Vec<String>,
}

/// File mode bits applied after a streaming upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(u32);

impl FileMode {
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl FromStr for FileMode {
    type Err = FileError;

    /// Accepts plain octal such as `0700` or `600`; `0o`/`0x` prefixes are rejected.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FileError::InvalidFileMode(s.to_string());

        if s.is_empty() || s.len() > 5 || !s.chars().all(|c| ('0'..='7').contains(&c)) {
            return Err(invalid());
        }
        let bits = u32::from_str_radix(s, 8).map_err(|_| invalid())?;
        if bits > 0o7777 {
            return Err(invalid());
        }
        Ok(FileMode(bits))
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

/// A local file to place on a datastore.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Content type for the API upload, or the target directory for streaming
    pub content_type: String,
    pub file_name: String,
    pub local_path: PathBuf,
    pub mode: Option<FileMode>,
}

/// Backend release version, used for capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BackendVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl BackendVersion {
    /// Assumed when the version cannot be determined.
    pub const MINIMUM: BackendVersion = BackendVersion::new(8, 0, 0);

    /// First release with the `import` content type.
    const IMPORT_CONTENT_TYPE: BackendVersion = BackendVersion::new(8, 4, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn supports_import_content_type(&self) -> bool {
        *self >= Self::IMPORT_CONTENT_TYPE
    }
}

impl FromStr for BackendVersion {
    type Err = FileError;

    /// Parses `8.2.4`, `8.4` or `8.2.4-1`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FileError::Backend(format!("invalid version \"{}\"", s));

        let core = s.trim().split(['-', '+', '~']).next().unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = |required: bool| -> Result<u32> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| invalid()),
                None if required => Err(invalid()),
                None => Ok(0),
            }
        };

        let major = next(true)?;
        let minor = next(true)?;
        let patch = next(false)?;
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Operations the reconciler needs from the cluster.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// List all files stored on a datastore of a node.
    async fn list_files(&self, node: &str, datastore: &str) -> Result<Vec<DatastoreFile>>;

    /// Upload through the API; the backend decides where the file lands.
    async fn api_upload(&self, node: &str, datastore: &str, request: &UploadRequest)
    -> Result<()>;

    /// Datastore configuration (path and supported content types).
    async fn get_datastore(&self, datastore: &str) -> Result<Datastore>;

    /// Stream the file into `{datastore_path}/{content_type}/{file_name}` on the node.
    async fn stream_upload(
        &self,
        node: &str,
        datastore_path: &str,
        request: &UploadRequest,
    ) -> Result<()>;

    /// Delete a file. Fails with [`FileError::NotFound`] if it does not exist.
    async fn delete_file(&self, node: &str, datastore: &str, volume_id: &str) -> Result<()>;

    async fn version(&self) -> Result<BackendVersion>;
}
