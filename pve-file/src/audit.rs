//! File audit logging
//!
//! Domain-specific audit events, emitted on the `audit` tracing target so they
//! can be routed separately from operational logs.

use std::sync::Arc;

use tracing::{error, info};

/// File audit logger with domain-specific methods
pub struct FileAuditLogger {
    component: String,
    enabled: bool,
}

impl FileAuditLogger {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            enabled: true,
        }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self {
            component: String::new(),
            enabled: false,
        }
    }

    fn audit(&self, message: String, objects: &[&str]) {
        if self.enabled {
            info!(target: "audit", component = %self.component, objects = ?objects, "{}", message);
        }
    }

    pub fn file_uploaded(&self, node: &str, volume_id: &str, transport: &str) {
        self.audit(
            format!("File '{}' uploaded via {}", volume_id, transport),
            &[node, volume_id],
        );
    }

    pub fn file_overwritten(&self, node: &str, volume_id: &str) {
        self.audit(
            format!("Existing file '{}' overwritten", volume_id),
            &[node, volume_id],
        );
    }

    pub fn file_deleted(&self, node: &str, volume_id: &str) {
        self.audit(format!("File '{}' deleted", volume_id), &[node, volume_id]);
    }

    pub fn upload_rolled_back(&self, node: &str, volume_id: &str) {
        self.audit(
            format!("File '{}' removed after failed create", volume_id),
            &[node, volume_id],
        );
    }

    pub fn upload_failed(&self, node: &str, file_name: &str, reason: &str) {
        if self.enabled {
            error!(
                target: "audit",
                component = %self.component,
                objects = ?[node, file_name],
                "Upload of '{}' failed: {}",
                file_name,
                reason
            );
        }
    }
}

/// Create a shared file audit logger
pub fn create_audit_logger(component: &str) -> Arc<FileAuditLogger> {
    Arc::new(FileAuditLogger::new(component))
}
