//! Content type classification.
//!
//! Infers what kind of artifact a file is from its name, or validates an
//! explicitly configured content type.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{FileError, Result};

/// Datastore content types a file can be stored as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// VM disk images
    Images,
    /// Container templates
    Vztmpl,
    Backup,
    Snippets,
    Iso,
    /// Disk images for import into VMs
    Import,
}

impl ContentType {
    pub const ALL: [ContentType; 6] = [
        ContentType::Backup,
        ContentType::Images,
        ContentType::Import,
        ContentType::Iso,
        ContentType::Snippets,
        ContentType::Vztmpl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Images => "images",
            ContentType::Vztmpl => "vztmpl",
            ContentType::Backup => "backup",
            ContentType::Snippets => "snippets",
            ContentType::Iso => "iso",
            ContentType::Import => "import",
        }
    }

    /// Directory below the datastore path that holds this content type.
    pub fn directory(&self) -> &'static str {
        match self {
            ContentType::Backup => "dump",
            other => other.as_str(),
        }
    }

    /// Whether the backend manages placement itself through its upload API.
    pub fn uses_api_upload(&self) -> bool {
        matches!(
            self,
            ContentType::Iso | ContentType::Vztmpl | ContentType::Import
        )
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = FileError;

    fn from_str(s: &str) -> Result<Self> {
        ContentType::ALL
            .into_iter()
            .find(|ct| ct.as_str() == s)
            .ok_or_else(|| FileError::UnknownClassification(s.to_string()))
    }
}

/// Resolve the content type of `file_name`.
///
/// An explicit content type wins. Otherwise the suffix decides: container
/// templates first, then import images when the backend supports them, then
/// ISO and snippet extensions.
pub fn classify(
    file_name: &str,
    explicit: Option<&str>,
    supports_import: bool,
) -> Result<ContentType> {
    if let Some(explicit) = explicit.filter(|s| !s.is_empty()) {
        return explicit.parse();
    }

    if file_name.ends_with(".tar.gz") || file_name.ends_with(".tar.xz") {
        return Ok(ContentType::Vztmpl);
    }

    if supports_import
        && [".qcow2", ".raw", ".vmdk"]
            .iter()
            .any(|suffix| file_name.ends_with(suffix))
    {
        return Ok(ContentType::Import);
    }

    let ext = Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "img" | "iso" => Ok(ContentType::Iso),
        "yaml" | "yml" => Ok(ContentType::Snippets),
        _ => Err(FileError::UndeterminedClassification(file_name.to_string())),
    }
}
