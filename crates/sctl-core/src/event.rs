//! # Reconciliation Events
//!
//! Payload relayed to the external event receiver after every task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{ObjectRef, Revision};
use crate::kind::ResourceKind;

/// Name reported as the originating controller.
pub const REPORTING_CONTROLLER: &str = "source-controller";

/// Result of one reconciliation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// A new artifact was stored and published.
    Succeeded,
    /// Upstream revision unchanged; nothing written.
    Unchanged,
    /// A stage failed.
    Failed,
    /// The owner was deleted; the task was abandoned.
    Cancelled,
}

impl Outcome {
    /// Label used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome record posted to the event receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileEvent {
    /// Kind of the reconciled resource.
    pub resource_kind: ResourceKind,
    /// Name of the reconciled resource.
    pub name: String,
    /// Namespace of the reconciled resource.
    pub namespace: String,
    /// What happened.
    pub outcome: Outcome,
    /// Human-readable detail.
    pub message: String,
    /// When the task finished.
    pub timestamp: DateTime<Utc>,
    /// Controller that produced the event.
    pub reporting_controller: String,
    /// Revision involved, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

impl ReconcileEvent {
    /// Build an event for `object`.
    pub fn new(object: &ObjectRef, outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            resource_kind: object.kind(),
            name: object.name().to_string(),
            namespace: object.namespace().to_string(),
            outcome,
            message: message.into(),
            timestamp: Utc::now(),
            reporting_controller: REPORTING_CONTROLLER.to_string(),
            revision: None,
        }
    }

    /// Attach the revision involved.
    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_shape() {
        let id = ObjectRef::new(ResourceKind::HelmRepository, "flux-system", "stable").unwrap();
        let event = ReconcileEvent::new(&id, Outcome::Succeeded, "stored index")
            .with_revision(Revision::new("abc123").unwrap());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["resourceKind"], "HelmRepository");
        assert_eq!(json["name"], "stable");
        assert_eq!(json["namespace"], "flux-system");
        assert_eq!(json["outcome"], "succeeded");
        assert_eq!(json["reportingController"], "source-controller");
        assert_eq!(json["revision"], "abc123");
        assert!(json["timestamp"].is_string());
    }
}
