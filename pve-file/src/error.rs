//! File reconciliation error types.

use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a [`FileError`], used by callers to decide
/// whether retrying can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Desired state is invalid; the caller must change it.
    Configuration,
    /// Source bytes do not match the declared checksum.
    Integrity,
    /// A file with the same name already exists and overwrite is off.
    Collision,
    /// Download, upload, metadata or backend request failed.
    Transport,
    /// The backend object is absent.
    NotFound,
}

/// Errors that can occur while reconciling a file.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("unexpected format of ID ({input}), expected {expected}")]
    MalformedIdentity {
        input: String,
        expected: &'static str,
    },

    #[error("please specify \"source_file.path\" or \"source_raw\" - not both")]
    ConflictingSource,

    #[error("missing argument \"source_file.path\" or \"source_raw\"")]
    MissingSource,

    #[error("failed to determine file name from the source \"{0}\"")]
    UnresolvableFileName(String),

    #[error("unknown content type \"{0}\", must be one of: backup, images, import, iso, snippets, vztmpl")]
    UnknownClassification(String),

    #[error(
        "cannot determine the content type of source \"{0}\" - please manually define the \"content_type\" argument"
    )]
    UndeterminedClassification(String),

    #[error("unsupported minimum TLS version \"{0}\", supported values: 1.0|1.1|1.2|1.3")]
    InvalidTlsVersion(String),

    #[error("invalid node address \"{0}\", expected <node>=<address>")]
    InvalidNodeAddress(String),

    #[error("invalid file mode \"{0}\", expected an octal value such as \"0700\" or \"600\"")]
    InvalidFileMode(String),

    #[error("cannot resize {size} bytes to {target} bytes")]
    ResizeTooSmall { size: u64, target: u64 },

    #[error("the calculated SHA256 checksum \"{computed}\" does not match source checksum \"{expected}\"")]
    ChecksumMismatch { computed: String, expected: String },

    #[error("file \"{0}\" already exists")]
    AlreadyExists(String),

    #[error("failed to download \"{url}\": {source}")]
    DownloadFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to HEAD \"{url}\": {source}")]
    MetadataFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to parse Last-Modified header \"{0}\"")]
    InvalidDateHeader(String),

    #[error("failed to determine the path of datastore \"{0}\"")]
    NoDestinationPath(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to read file from \"{0}\"")]
    ReadBackFailed(String),

    #[error("{0} does not exist")]
    NotFound(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("backend request for {what} failed: {source}")]
    Request {
        what: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("backend request failed: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FileError::MalformedIdentity { .. }
            | FileError::ConflictingSource
            | FileError::MissingSource
            | FileError::UnresolvableFileName(_)
            | FileError::UnknownClassification(_)
            | FileError::UndeterminedClassification(_)
            | FileError::InvalidTlsVersion(_)
            | FileError::InvalidFileMode(_)
            | FileError::InvalidNodeAddress(_)
            | FileError::HttpClient(_)
            | FileError::ResizeTooSmall { .. }
            | FileError::NoDestinationPath(_) => ErrorKind::Configuration,
            FileError::ChecksumMismatch { .. } => ErrorKind::Integrity,
            FileError::AlreadyExists(_) => ErrorKind::Collision,
            FileError::NotFound(_) => ErrorKind::NotFound,
            FileError::DownloadFailed { .. }
            | FileError::MetadataFailed { .. }
            | FileError::InvalidDateHeader(_)
            | FileError::UploadFailed(_)
            | FileError::Timeout(_)
            | FileError::ReadBackFailed(_)
            | FileError::Request { .. }
            | FileError::Backend(_)
            | FileError::Io(_) => ErrorKind::Transport,
        }
    }
}

/// Result type for file reconciliation.
pub type Result<T> = std::result::Result<T, FileError>;
