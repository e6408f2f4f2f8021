//! Provider configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::StorageBackend;
use crate::error::{FileError, Result};
use crate::pve::{PveBackend, PveClient};
use crate::ssh::{SshConfig, SshStreamer};

/// Connection settings shared by all lifecycle operations.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Proxmox VE API endpoint, e.g. `https://pve.example.com:8006/`
    pub endpoint: String,
    pub api_token: String,
    /// Skip TLS verification of the API endpoint
    pub insecure: bool,
    /// Directory for downloads and raw payloads
    pub tmp_dir: PathBuf,
    pub ssh: SshConfig,
}

impl ProviderConfig {
    pub fn new(endpoint: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_token: api_token.into(),
            insecure: false,
            tmp_dir: std::env::temp_dir(),
            ssh: SshConfig::default(),
        }
    }

    /// Build the production backend.
    pub fn backend(&self) -> Result<Arc<dyn StorageBackend>> {
        let api = PveClient::new(&self.endpoint, &self.api_token, self.insecure)?;
        let ssh = SshStreamer::new(self.ssh.clone());
        Ok(Arc::new(PveBackend::new(api, ssh)))
    }
}

/// Parse `name=address` pairs into a node address map.
pub fn parse_node_addresses<S: AsRef<str>>(pairs: &[S]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let pair = pair.as_ref();
            match pair.split_once('=') {
                Some((name, address)) if !name.is_empty() && !address.is_empty() => {
                    Ok((name.to_string(), address.to_string()))
                }
                _ => Err(FileError::InvalidNodeAddress(pair.to_string())),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_addresses() {
        let map = parse_node_addresses(&["pve1=10.0.0.11", "pve2=pve2.lan"]).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["pve1"], "10.0.0.11");
        assert_eq!(map["pve2"], "pve2.lan");

        assert!(matches!(
            parse_node_addresses(&["pve1"]),
            Err(FileError::InvalidNodeAddress(ref pair)) if pair == "pve1"
        ));
        assert!(parse_node_addresses(&["=10.0.0.1"]).is_err());
        assert!(parse_node_addresses(&["pve1="]).is_err());
        assert!(parse_node_addresses::<&str>(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::new("https://pve:8006/", "root@pam!t=s");
        assert!(!config.insecure);
        assert_eq!(config.ssh.user, "root");
        assert_eq!(config.ssh.port, 22);
        assert!(config.backend().is_ok());
    }
}
