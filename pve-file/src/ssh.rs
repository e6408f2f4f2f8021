//! Streaming uploads over SSH.
//!
//! Uses the system `ssh` client and pipes the local file into `cat` on the
//! node, so arbitrarily large files never have to fit in memory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::fs::File;
use tokio::process::Command;
use tracing::{debug, info};

use crate::backend::UploadRequest;
use crate::error::{FileError, Result};

/// SSH connection settings.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Client program followed by leading arguments, `ssh` by default
    pub command: Vec<String>,
    pub user: String,
    pub port: u16,
    /// Private key passed with `-i`; the agent/default keys are used otherwise
    pub identity_file: Option<PathBuf>,
    /// Node name to address overrides
    pub node_addresses: HashMap<String, String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            command: vec!["ssh".to_string()],
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            node_addresses: HashMap::new(),
        }
    }
}

pub struct SshStreamer {
    config: SshConfig,
}

impl SshStreamer {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn node_address<'a>(&'a self, node: &'a str) -> &'a str {
        self.config
            .node_addresses
            .get(node)
            .map(String::as_str)
            .unwrap_or(node)
    }

    /// Shell script run on the node for an upload.
    pub fn remote_script(datastore_path: &str, request: &UploadRequest) -> String {
        let dir = format!(
            "{}/{}",
            datastore_path.trim_end_matches('/'),
            request.content_type
        );
        let dest = format!("{}/{}", dir, request.file_name);

        let mut script = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(&dir),
            shell_quote(&dest)
        );
        if let Some(mode) = request.mode {
            script.push_str(&format!(" && chmod {} {}", mode, shell_quote(&dest)));
        }
        script
    }

    pub async fn stream_upload(
        &self,
        node: &str,
        datastore_path: &str,
        request: &UploadRequest,
    ) -> Result<()> {
        let address = self.node_address(node);
        let script = Self::remote_script(datastore_path, request);

        debug!(node = %node, address = %address, script = %script, "Starting SSH upload");

        let (program, leading) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| FileError::UploadFailed("no ssh command configured".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(["-o", "BatchMode=yes"])
            .arg("-p")
            .arg(self.config.port.to_string());
        if let Some(identity) = &self.config.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", self.config.user, address))
            .arg(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| FileError::UploadFailed("ssh stdin unavailable".to_string()))?;

        let mut file = File::open(&request.local_path).await?;

        // Drain stderr while feeding stdin.
        let feed = async move {
            let copied = tokio::io::copy(&mut file, &mut stdin).await;
            drop(stdin);
            copied
        };
        let (copied, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FileError::UploadFailed(format!(
                "ssh upload to node {} failed: {}",
                node,
                stderr.trim()
            )));
        }
        let bytes = copied?;

        info!(
            node = %node,
            file = %request.file_name,
            bytes = %bytes,
            "SSH upload completed"
        );

        Ok(())
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
