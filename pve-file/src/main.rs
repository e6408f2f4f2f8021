use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pve_file::audit::create_audit_logger;
use pve_file::config::{ProviderConfig, parse_node_addresses};
use pve_file::ssh::SshConfig;
use pve_file::{FileReconciler, FileSpec, FileState};

#[derive(Parser)]
#[command(name = "pve-file")]
#[command(about = "Manage file artifacts on Proxmox VE datastores", long_about = None)]
struct Cli {
    /// Proxmox VE API endpoint
    #[arg(long, env = "PVE_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// API token (user@realm!tokenid=secret)
    #[arg(long, env = "PVE_API_TOKEN", hide_env_values = true, global = true)]
    api_token: Option<String>,

    /// Skip TLS verification of the API endpoint
    #[arg(long, global = true)]
    insecure: bool,

    /// Directory for downloads and raw payloads
    #[arg(long, global = true)]
    tmp_dir: Option<PathBuf>,

    /// SSH user for streamed uploads
    #[arg(long, default_value = "root", global = true)]
    ssh_user: String,

    /// SSH port for streamed uploads
    #[arg(long, default_value = "22", global = true)]
    ssh_port: u16,

    /// SSH private key
    #[arg(long, global = true)]
    ssh_identity: Option<PathBuf>,

    /// Node address override (name=address), repeatable
    #[arg(long = "ssh-node", global = true)]
    ssh_nodes: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload the file described by the desired state
    Create {
        /// Desired state (JSON)
        #[arg(long)]
        spec: PathBuf,
    },

    /// Refresh the observed state
    Read {
        /// Desired state (JSON)
        #[arg(long)]
        spec: PathBuf,

        /// Previously recorded state (JSON)
        #[arg(long)]
        state: PathBuf,
    },

    /// Apply in-place changes
    Update {
        /// Desired state (JSON)
        #[arg(long)]
        spec: PathBuf,

        /// Previously recorded state (JSON)
        #[arg(long)]
        state: PathBuf,
    },

    /// Delete the file
    Delete {
        /// Desired state (JSON)
        #[arg(long)]
        spec: PathBuf,

        /// Previously recorded state (JSON)
        #[arg(long)]
        state: PathBuf,
    },

    /// Build a state from node/datastore:content_type/file_name
    Import {
        /// Import ID
        id: String,
    },
}

impl Cli {
    fn provider_config(&self) -> Result<ProviderConfig> {
        let endpoint = self
            .endpoint
            .clone()
            .context("--endpoint (or PVE_ENDPOINT) is required")?;
        let api_token = self
            .api_token
            .clone()
            .context("--api-token (or PVE_API_TOKEN) is required")?;

        let mut config = ProviderConfig::new(endpoint, api_token);
        config.insecure = self.insecure;
        if let Some(tmp_dir) = &self.tmp_dir {
            config.tmp_dir = tmp_dir.clone();
        }
        config.ssh = SshConfig {
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            identity_file: self.ssh_identity.clone(),
            node_addresses: parse_node_addresses(&self.ssh_nodes)?,
            ..SshConfig::default()
        };
        Ok(config)
    }

    fn reconciler(&self) -> Result<FileReconciler> {
        let config = self.provider_config()?;
        let backend = config.backend()?;
        Ok(FileReconciler::new(
            backend,
            create_audit_logger("pve-file"),
            config.tmp_dir,
        ))
    }
}

async fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("pve_file=info".parse()?))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Create { spec } => {
            let spec: FileSpec = load(spec).await?;
            info!(node = %spec.node_name, datastore = %spec.datastore_id, "Creating file");
            let outcome = cli.reconciler()?.create(&spec).await?;
            print(&outcome)?;
        }
        Commands::Read { spec, state } => {
            let spec: FileSpec = load(spec).await?;
            let state: FileState = load(state).await?;
            let outcome = cli.reconciler()?.read(&spec, &state).await?;
            print(&outcome)?;
        }
        Commands::Update { spec, state } => {
            let spec: FileSpec = load(spec).await?;
            let state: FileState = load(state).await?;
            let outcome = cli.reconciler()?.update(&spec, &state).await?;
            print(&outcome)?;
        }
        Commands::Delete { spec, state } => {
            let spec: FileSpec = load(spec).await?;
            let state: FileState = load(state).await?;
            let outcome = cli.reconciler()?.delete(&spec, &state).await?;
            print(&outcome)?;
        }
        Commands::Import { id } => {
            let state = FileReconciler::import(id)?;
            print(&state)?;
        }
    }

    Ok(())
}
