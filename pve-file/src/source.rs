//! Source resolution
//!
//! Turns the configured source (local file, HTTP(S) URL or inline data) into a
//! single local file that can be uploaded, verifying its checksum if requested.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FileError, Result};

/// `source_file` block: a local path or an HTTP(S) URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    /// Expected SHA256 of the file, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Name to store the file under instead of the source name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Skip TLS certificate verification for HTTPS sources
    #[serde(default)]
    pub insecure: bool,
    /// Minimum TLS version for HTTPS sources (1.0|1.1|1.2|1.3, default 1.3)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tls: Option<String>,
}

impl SourceFile {
    pub fn is_url(&self) -> bool {
        is_url(&self.path)
    }

    /// Build an HTTP client honoring `min_tls` and `insecure`.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let min_tls = parse_min_tls(self.min_tls.as_deref().unwrap_or_default())?;

        reqwest::Client::builder()
            .min_tls_version(min_tls)
            .danger_accept_invalid_certs(self.insecure)
            .build()
            .map_err(FileError::HttpClient)
    }
}

/// `source_raw` block: inline file content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRaw {
    pub data: String,
    pub file_name: String,
    /// Pad the data with spaces up to this many bytes (0 = no resize)
    #[serde(default)]
    pub resize: u64,
}

/// Exactly one configured source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    File(SourceFile),
    Raw(SourceRaw),
}

impl SourceDescriptor {
    /// Build the descriptor from the two optional blocks of the desired state.
    pub fn from_blocks(file: Option<&SourceFile>, raw: Option<&SourceRaw>) -> Result<Self> {
        match (file, raw) {
            (Some(_), Some(_)) => Err(FileError::ConflictingSource),
            (Some(file), None) => Ok(SourceDescriptor::File(file.clone())),
            (None, Some(raw)) => Ok(SourceDescriptor::Raw(raw.clone())),
            (None, None) => Err(FileError::MissingSource),
        }
    }

    /// Name the file is stored under on the datastore.
    pub fn file_name(&self) -> Result<String> {
        match self {
            SourceDescriptor::File(file) => {
                if let Some(name) = file.file_name.as_deref().filter(|n| !n.is_empty()) {
                    return Ok(name.to_string());
                }
                if file.is_url() {
                    file_name_from_url(&file.path)
                } else {
                    Path::new(&file.path)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .ok_or_else(|| FileError::UnresolvableFileName(file.path.clone()))
                }
            }
            SourceDescriptor::Raw(raw) => {
                if raw.file_name.is_empty() {
                    return Err(FileError::UnresolvableFileName("source_raw".to_string()));
                }
                Ok(raw.file_name.clone())
            }
        }
    }

    /// Check everything that can be checked without I/O.
    pub fn validate(&self) -> Result<()> {
        self.file_name()?;
        match self {
            SourceDescriptor::File(file) => {
                parse_min_tls(file.min_tls.as_deref().unwrap_or_default())?;
            }
            SourceDescriptor::Raw(raw) => {
                padding(raw)?;
            }
        }
        Ok(())
    }
}

pub fn is_url(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

fn file_name_from_url(url: &str) -> Result<String> {
    let parsed =
        reqwest::Url::parse(url).map_err(|_| FileError::UnresolvableFileName(url.to_string()))?;

    match parsed.path().rsplit('/').next() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(FileError::UnresolvableFileName(url.to_string())),
    }
}

/// Parse a minimum TLS version. An empty value means TLS 1.3.
pub fn parse_min_tls(version: &str) -> Result<reqwest::tls::Version> {
    match version {
        "" | "1.3" => Ok(reqwest::tls::Version::TLS_1_3),
        "1.2" => Ok(reqwest::tls::Version::TLS_1_2),
        "1.1" => Ok(reqwest::tls::Version::TLS_1_1),
        "1.0" => Ok(reqwest::tls::Version::TLS_1_0),
        other => Err(FileError::InvalidTlsVersion(other.to_string())),
    }
}

/// Temporary file removed when dropped.
///
/// Dropping happens on every exit path, including when the owning future is
/// cancelled by a timeout.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    /// Create a new empty file named `{prefix}-{uuid}.tmp` inside `dir`.
    pub async fn create(dir: &Path, prefix: &str) -> Result<(Self, File)> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}-{}.tmp", prefix, Uuid::new_v4()));
        let file = File::create(&path).await?;
        Ok((Self { path }, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(file = %self.path.display(), "Removed temporary file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                file = %self.path.display(),
                error = %e,
                "Failed to remove temporary file"
            ),
        }
    }
}

/// A source materialized as a local file.
#[derive(Debug)]
pub struct ResolvedArtifact {
    pub path: PathBuf,
    pub file_name: String,
    temp: Option<TempFile>,
}

impl ResolvedArtifact {
    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }
}

/// Materialize `source` as a local file. Downloads and raw data land in
/// `tmp_dir` and are removed when the returned artifact is dropped.
pub async fn resolve(source: &SourceDescriptor, tmp_dir: &Path) -> Result<ResolvedArtifact> {
    let file_name = source.file_name()?;

    match source {
        SourceDescriptor::File(file) => {
            let artifact = if file.is_url() {
                let client = file.http_client()?;
                let temp = download(&client, &file.path, tmp_dir).await?;
                ResolvedArtifact {
                    path: temp.path().to_path_buf(),
                    file_name,
                    temp: Some(temp),
                }
            } else {
                ResolvedArtifact {
                    path: PathBuf::from(&file.path),
                    file_name,
                    temp: None,
                }
            };

            if let Some(expected) = file.checksum.as_deref().filter(|c| !c.is_empty()) {
                verify_checksum(&artifact.path, expected).await?;
                debug!(source = %file.path, sha256 = %expected, "Checksum verified");
            }

            Ok(artifact)
        }
        SourceDescriptor::Raw(raw) => {
            let padding = padding(raw)?;
            let (temp, mut out) = TempFile::create(tmp_dir, "raw").await?;
            out.write_all(raw.data.as_bytes()).await?;
            if padding > 0 {
                tokio::io::copy(&mut tokio::io::repeat(b' ').take(padding), &mut out).await?;
            }
            out.flush().await?;
            drop(out);

            Ok(ResolvedArtifact {
                path: temp.path().to_path_buf(),
                file_name,
                temp: Some(temp),
            })
        }
    }
}

/// Number of spaces appended to raw data to reach `resize` bytes. Resizing
/// never truncates.
fn padding(raw: &SourceRaw) -> Result<u64> {
    if raw.resize == 0 {
        return Ok(0);
    }
    let size = raw.data.len() as u64;
    if size >= raw.resize {
        return Err(FileError::ResizeTooSmall {
            size,
            target: raw.resize,
        });
    }
    Ok(raw.resize - size)
}

/// Stream `url` into a new temporary file.
pub async fn download(client: &reqwest::Client, url: &str, tmp_dir: &Path) -> Result<TempFile> {
    let failed = |source| FileError::DownloadFailed {
        url: url.to_string(),
        source,
    };

    debug!(url = %url, "Downloading file from URL");

    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(failed)?;

    let (temp, mut file) = TempFile::create(tmp_dir, "download").await?;

    let mut stream = response.bytes_stream();
    let mut bytes_downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(failed)?;
        file.write_all(&chunk).await?;
        bytes_downloaded += chunk.len() as u64;
    }

    file.flush().await?;
    drop(file);

    info!(url = %url, bytes = %bytes_downloaded, "Download completed");

    Ok(temp)
}

/// SHA256 of a local file, lowercase hex.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

async fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let computed = sha256_file(path).await?;
    if !computed.eq_ignore_ascii_case(expected) {
        return Err(FileError::ChecksumMismatch {
            computed,
            expected: expected.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // sha256("hello world")
    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn file_source(path: &str) -> SourceFile {
        SourceFile {
            path: path.to_string(),
            ..Default::default()
        }
    }

    fn raw_source(data: &str, resize: u64) -> SourceDescriptor {
        SourceDescriptor::Raw(SourceRaw {
            data: data.to_string(),
            file_name: "raw.txt".to_string(),
            resize,
        })
    }

    #[test]
    fn test_from_blocks() {
        let file = file_source("/tmp/a.iso");
        let raw = SourceRaw {
            data: "x".to_string(),
            file_name: "x.yaml".to_string(),
            resize: 0,
        };

        assert!(matches!(
            SourceDescriptor::from_blocks(Some(&file), Some(&raw)),
            Err(FileError::ConflictingSource)
        ));
        assert!(matches!(
            SourceDescriptor::from_blocks(None, None),
            Err(FileError::MissingSource)
        ));
        assert_eq!(
            SourceDescriptor::from_blocks(Some(&file), None).unwrap(),
            SourceDescriptor::File(file)
        );
    }

    #[test]
    fn test_file_name_resolution() {
        let local = SourceDescriptor::File(file_source("/srv/images/debian.iso"));
        assert_eq!(local.file_name().unwrap(), "debian.iso");

        let url = SourceDescriptor::File(file_source(
            "https://example.com/releases/alpine.tar.xz?mirror=1",
        ));
        assert_eq!(url.file_name().unwrap(), "alpine.tar.xz");

        let trailing = SourceDescriptor::File(file_source("https://example.com/releases/"));
        assert!(matches!(
            trailing.file_name(),
            Err(FileError::UnresolvableFileName(_))
        ));

        let bare = SourceDescriptor::File(file_source("https://example.com"));
        assert!(matches!(
            bare.file_name(),
            Err(FileError::UnresolvableFileName(_))
        ));

        let overridden = SourceDescriptor::File(SourceFile {
            file_name: Some("renamed.iso".to_string()),
            ..file_source("https://example.com/releases/")
        });
        assert_eq!(overridden.file_name().unwrap(), "renamed.iso");
    }

    #[test]
    fn test_parse_min_tls() {
        assert_eq!(parse_min_tls("").unwrap(), reqwest::tls::Version::TLS_1_3);
        assert_eq!(parse_min_tls("1.2").unwrap(), reqwest::tls::Version::TLS_1_2);
        assert!(matches!(
            parse_min_tls("1.4"),
            Err(FileError::InvalidTlsVersion(_))
        ));
        assert!(matches!(
            parse_min_tls("TLS1.2"),
            Err(FileError::InvalidTlsVersion(_))
        ));
    }

    #[tokio::test]
    async fn test_local_file_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, "hello world").unwrap();
        let path_str = path.to_str().unwrap();

        let ok = SourceDescriptor::File(SourceFile {
            checksum: Some(HELLO_SHA256.to_uppercase()),
            ..file_source(path_str)
        });
        let artifact = resolve(&ok, dir.path()).await.unwrap();
        assert_eq!(artifact.path, path);
        assert_eq!(artifact.file_name, "hello.txt");
        assert!(!artifact.is_temporary());

        let bad = SourceDescriptor::File(SourceFile {
            checksum: Some("00".repeat(32)),
            ..file_source(path_str)
        });
        match resolve(&bad, dir.path()).await {
            Err(FileError::ChecksumMismatch { computed, expected }) => {
                assert_eq!(computed, HELLO_SHA256);
                assert_eq!(expected, "00".repeat(32));
            }
            other => panic!("expected ChecksumMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_raw_resize_pads() {
        let dir = TempDir::new().unwrap();
        let artifact = resolve(&raw_source("abc", 5), dir.path()).await.unwrap();
        assert!(artifact.is_temporary());
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"abc  ");

        let temp_path = artifact.path.clone();
        drop(artifact);
        assert!(!temp_path.exists(), "temporary file must be removed on drop");
    }

    #[tokio::test]
    async fn test_raw_resize_too_small() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            resolve(&raw_source("abc", 2), dir.path()).await,
            Err(FileError::ResizeTooSmall { size: 3, target: 2 })
        ));
        assert!(matches!(
            resolve(&raw_source("abc", 3), dir.path()).await,
            Err(FileError::ResizeTooSmall { size: 3, target: 3 })
        ));
        // Nothing left behind after a failed resolve
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_raw_resize_large_target() {
        let dir = TempDir::new().unwrap();
        let target = 64 * 1024 * 1024 + 7;
        let artifact = resolve(&raw_source("#cloud-config\n", target), dir.path())
            .await
            .unwrap();

        assert_eq!(std::fs::metadata(&artifact.path).unwrap().len(), target);

        let mut head = vec![0u8; 16];
        let mut file = File::open(&artifact.path).await.unwrap();
        file.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"#cloud-config\n  ");
    }

    #[test]
    fn test_raw_resize_huge_target_is_accepted() {
        let raw = SourceRaw {
            data: "abc".to_string(),
            file_name: "ci.yaml".to_string(),
            resize: u64::MAX,
        };
        assert_eq!(padding(&raw).unwrap(), u64::MAX - 3);
        assert!(SourceDescriptor::Raw(raw).validate().is_ok());
    }

    #[tokio::test]
    async fn test_raw_without_resize() {
        let dir = TempDir::new().unwrap();
        let artifact = resolve(&raw_source("#cloud-config\n", 0), dir.path())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&artifact.path).unwrap(),
            "#cloud-config\n"
        );
        assert_eq!(artifact.file_name, "raw.txt");
    }
}
