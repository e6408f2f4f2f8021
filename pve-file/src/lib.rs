//! pve-file: file artifacts on Proxmox VE datastores
//!
//! Reconciles a single file (ISO image, container template, snippet, backup or
//! disk image) against a datastore: resolves the source, uploads it through
//! the right transport, detects changes of the external source and reports the
//! observed state back to the calling infrastructure tool.

pub mod audit;
pub mod backend;
pub mod config;
pub mod content;
pub mod diag;
pub mod drift;
pub mod error;
pub mod pve;
pub mod reconciler;
pub mod source;
pub mod ssh;
pub mod upload;
pub mod volume_id;

pub use backend::StorageBackend;
pub use config::ProviderConfig;
pub use content::ContentType;
pub use diag::{Diagnostics, Outcome};
pub use error::{ErrorKind, FileError, Result};
pub use reconciler::{FileReconciler, FileSpec, FileState};
pub use volume_id::VolumeId;
