//! Volume identity: `datastore_id:content_type/file_name`.
//!
//! The identity is the key the backend uses for every stored file. Import
//! identifiers additionally carry the node name in front: `node/datastore_id:content_type/file_name`.

use std::fmt;
use std::str::FromStr;

use crate::error::{FileError, Result};

const VOLUME_ID_FORMAT: &str = "datastore_id:content_type/file_name";
const IMPORT_ID_FORMAT: &str = "node/datastore_id:content_type/file_name";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId {
    pub datastore_id: String,
    pub content_type: String,
    pub file_name: String,
}

impl VolumeId {
    pub fn new(
        datastore_id: impl Into<String>,
        content_type: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            datastore_id: datastore_id.into(),
            content_type: content_type.into(),
            file_name: file_name.into(),
        }
    }

    pub fn parse(id: &str) -> Result<Self> {
        let malformed = || FileError::MalformedIdentity {
            input: id.to_string(),
            expected: VOLUME_ID_FORMAT,
        };

        let (datastore_id, rest) = split_non_empty(id, ':').ok_or_else(malformed)?;
        let (content_type, file_name) = split_non_empty(rest, '/').ok_or_else(malformed)?;

        Ok(Self::new(datastore_id, content_type, file_name))
    }

    /// Parse an import identifier, returning the node name and the volume ID.
    pub fn parse_with_node(id: &str) -> Result<(String, Self)> {
        let (node, rest) = split_non_empty(id, '/').ok_or_else(|| FileError::MalformedIdentity {
            input: id.to_string(),
            expected: IMPORT_ID_FORMAT,
        })?;

        Ok((node.to_string(), Self::parse(rest)?))
    }
}

/// Split on the first `sep`; both halves must be non-empty.
fn split_non_empty(s: &str, sep: char) -> Option<(&str, &str)> {
    match s.split_once(sep) {
        Some((head, tail)) if !head.is_empty() && !tail.is_empty() => Some((head, tail)),
        _ => None,
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.datastore_id, self.content_type, self.file_name
        )
    }
}

impl FromStr for VolumeId {
    type Err = FileError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let ids = [
            VolumeId::new("local", "iso", "debian-12.iso"),
            VolumeId::new("nfs-backup", "backup", "vzdump-qemu-100.vma.zst"),
            VolumeId::new("local", "snippets", "cloud-init.yaml"),
        ];
        for id in ids {
            assert_eq!(VolumeId::parse(&id.to_string()).unwrap(), id);
        }
    }

    #[test]
    fn test_format() {
        let id = VolumeId::new("local", "vztmpl", "alpine.tar.xz");
        assert_eq!(id.to_string(), "local:vztmpl/alpine.tar.xz");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in ["", "a", "a:", "a:b", "a:b/", ":/x", ":b/c", "a:/c"] {
            let err = VolumeId::parse(input).unwrap_err();
            assert!(
                matches!(err, FileError::MalformedIdentity { .. }),
                "expected MalformedIdentity for {input:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_parse_splits_on_first_delimiter() {
        let id = VolumeId::parse("local:snippets/dir/file.yaml").unwrap();
        assert_eq!(id.datastore_id, "local");
        assert_eq!(id.content_type, "snippets");
        assert_eq!(id.file_name, "dir/file.yaml");
    }

    #[test]
    fn test_parse_with_node() {
        let (node, id) = VolumeId::parse_with_node("pve1/local:iso/debian.iso").unwrap();
        assert_eq!(node, "pve1");
        assert_eq!(id, VolumeId::new("local", "iso", "debian.iso"));

        assert!(VolumeId::parse_with_node("local:iso/debian.iso").is_err());
        assert!(VolumeId::parse_with_node("/local:iso/debian.iso").is_err());
        assert!(VolumeId::parse_with_node("pve1/").is_err());
        assert!(VolumeId::parse_with_node("pve1/local:iso").is_err());
    }
}
