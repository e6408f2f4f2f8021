//! Drift detection for externally owned sources.
//!
//! Local files and URLs can change behind our back. Their size, modification
//! date and a tag are recorded on every read and compared with the previous
//! observation.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderName, LAST_MODIFIED};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FileError, Result};
use crate::source::SourceFile;

const RFC1123: &str = "%a, %d %b %Y %H:%M:%S";
const RFC1123Z: &str = "%a, %d %b %Y %H:%M:%S %z";

/// Source metadata. Unknown values are empty strings and zero, never absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedMetadata {
    /// RFC3339, UTC
    pub modification_date: String,
    pub size: i64,
    pub tag: String,
}

impl ObservedMetadata {
    /// At least one field is known.
    pub fn is_known(&self) -> bool {
        !self.modification_date.is_empty() || self.size != 0 || !self.tag.is_empty()
    }

    /// All fields are known.
    pub fn is_complete(&self) -> bool {
        !self.modification_date.is_empty() && self.size != 0 && !self.tag.is_empty()
    }
}

/// Whether the source changed since `previous` was recorded.
///
/// An incomplete baseline never reports a change: there is nothing reliable
/// to compare against yet.
pub fn has_changed(previous: &ObservedMetadata, current: &ObservedMetadata) -> bool {
    previous.is_complete() && previous != current
}

/// Fetch current metadata of a `source_file` path or URL.
pub async fn observe(source: &SourceFile) -> Result<ObservedMetadata> {
    if source.is_url() {
        let client = source.http_client()?;
        observe_url(&client, &source.path).await
    } else {
        observe_local(Path::new(&source.path)).await
    }
}

/// Stat a local file. A missing file yields empty metadata, not an error.
pub async fn observe_local(path: &Path) -> Result<ObservedMetadata> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Source file does not exist locally");
            return Ok(ObservedMetadata::default());
        }
        Err(e) => return Err(e.into()),
    };

    let modified: DateTime<Utc> = metadata.modified()?.into();
    let size = metadata.len() as i64;

    Ok(ObservedMetadata {
        modification_date: modified.to_rfc3339_opts(SecondsFormat::Secs, true),
        size,
        tag: format!("{:x}-{:x}", modified.timestamp(), size),
    })
}

/// HEAD a URL and read `Content-Length`, `Last-Modified` and `ETag`.
pub async fn observe_url(client: &reqwest::Client, url: &str) -> Result<ObservedMetadata> {
    let response = client
        .head(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|source| FileError::MetadataFailed {
            url: url.to_string(),
            source,
        })?;

    let headers = response.headers();
    let header = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("");

    let size = header(CONTENT_LENGTH).trim().parse::<i64>().unwrap_or(0);

    let modification_date = match header(LAST_MODIFIED) {
        "" => String::new(),
        value => parse_http_date(value)?.to_rfc3339_opts(SecondsFormat::Secs, true),
    };

    let tag = header(ETAG).split('"').nth(1).unwrap_or("").to_string();

    Ok(ObservedMetadata {
        modification_date,
        size,
        tag,
    })
}

/// Parse an HTTP date: RFC1123 with a zone name (read as UTC), then RFC1123
/// with a numeric offset.
pub fn parse_http_date(value: &str) -> Result<DateTime<Utc>> {
    if let Some((stamp, zone)) = value.trim().rsplit_once(' ')
        && !zone.is_empty()
        && zone.chars().all(|c| c.is_ascii_alphabetic())
        && let Ok(parsed) = NaiveDateTime::parse_from_str(stamp, RFC1123)
    {
        return Ok(parsed.and_utc());
    }

    DateTime::parse_from_str(value.trim(), RFC1123Z)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| FileError::InvalidDateHeader(value.to_string()))
}
