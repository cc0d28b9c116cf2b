//! Audit logging
//!
//! Domain events that operators care about, emitted as structured tracing
//! events on the `chimera::audit` target so they can be routed separately.

use tracing::{info, warn};

use crate::model::DriftRecord;
use crate::reconciler::plan::ActionKind;

/// Audit logger with domain-specific methods
#[derive(Debug, Clone)]
pub struct AuditLogger {
    node: String,
    enabled: bool,
}

impl AuditLogger {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            enabled: true,
        }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self {
            node: String::new(),
            enabled: false,
        }
    }

    // === Drift Events ===

    pub fn drift_detected(&self, record: &DriftRecord) {
        if !self.enabled {
            return;
        }
        warn!(
            target: "chimera::audit",
            node = %self.node,
            container = %record.name,
            reason = %record.reason,
            permanent = record.permanent,
            "Drift detected: {}",
            record.detail
        );
    }

    pub fn drift_resolved(&self, record: &DriftRecord) {
        if !self.enabled {
            return;
        }
        info!(
            target: "chimera::audit",
            node = %self.node,
            container = %record.name,
            reason = %record.reason,
            "Drift resolved"
        );
    }

    // === Action Events ===

    pub fn action_succeeded(&self, kind: ActionKind, name: &str, attempts: u32) {
        if !self.enabled {
            return;
        }
        info!(
            target: "chimera::audit",
            node = %self.node,
            container = name,
            action = %kind,
            attempts,
            "Action succeeded"
        );
    }

    pub fn action_failed(&self, kind: ActionKind, name: &str, attempts: u32, error: &str) {
        if !self.enabled {
            return;
        }
        warn!(
            target: "chimera::audit",
            node = %self.node,
            container = name,
            action = %kind,
            attempts,
            "Action failed: {}",
            error
        );
    }

    // === Control-Plane Events ===

    pub fn request_denied(&self, uid: u32, verb: &str) {
        if !self.enabled {
            return;
        }
        warn!(
            target: "chimera::audit",
            node = %self.node,
            uid,
            command = verb,
            "Request denied"
        );
    }

    pub fn config_reloaded(&self, generation: u64, containers: usize) {
        if !self.enabled {
            return;
        }
        info!(
            target: "chimera::audit",
            node = %self.node,
            generation,
            containers,
            "Desired state reloaded"
        );
    }

    pub fn image_pulled(&self, image: &str) {
        if !self.enabled {
            return;
        }
        info!(target: "chimera::audit", node = %self.node, image, "Image pulled");
    }

    pub fn image_pull_failed(&self, image: &str, error: &str) {
        if !self.enabled {
            return;
        }
        warn!(
            target: "chimera::audit",
            node = %self.node,
            image,
            "Image pull failed: {}",
            error
        );
    }
}
