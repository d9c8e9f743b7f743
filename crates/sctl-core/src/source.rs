//! # Source Objects and Status
//!
//! The declarative resources that drive reconciliation and the status the
//! coordinators write back for them. Persistence and watching of these
//! objects belong to the source store; this module only defines the shapes.
//!
//! Published status carries a `Ready` condition next to the artifact
//! reference, so consumers can tell "no artifact yet" from "last attempt
//! failed".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;
use crate::error::ErrorKind;
use crate::identity::{ObjectRef, Revision};

/// Default resync interval when a spec does not declare one.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Desired state of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Upstream location (repository URL, index base URL).
    pub url: String,
    /// Branch, tag, semver range, or chart version to track.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Chart name, for `HelmChart` sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    /// Resync interval in seconds.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

impl SourceSpec {
    /// Resync interval as a [`std::time::Duration`].
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs.max(1))
    }
}

/// A declared source resource with its current status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceObject {
    /// Identity of the object.
    pub id: ObjectRef,
    /// Desired state.
    pub spec: SourceSpec,
    /// Incremented on every spec change.
    #[serde(default)]
    pub generation: u64,
    /// Set once deletion has been requested.
    #[serde(default)]
    pub deletion_requested: bool,
    /// Last published status.
    #[serde(default)]
    pub status: SourceStatus,
}

impl SourceObject {
    /// A fresh object at generation 1 with empty status.
    pub fn new(id: ObjectRef, spec: SourceSpec) -> Self {
        Self {
            id,
            spec,
            generation: 1,
            deletion_requested: false,
            status: SourceStatus::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Published reference to the current artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactStatus {
    /// Externally reachable URL of the artifact.
    pub url: String,
    /// SHA-256 of the artifact content.
    pub checksum: ContentDigest,
    /// Revision the artifact represents.
    pub revision: Revision,
    /// When this reference was last changed.
    pub last_updated: DateTime<Utc>,
}

/// Truth value of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// Not yet determined.
    Unknown,
}

/// Machine-readable reason attached to the `Ready` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionReason {
    /// The artifact is stored and published.
    Succeeded,
    /// The upstream fetch failed.
    FetchFailed,
    /// A storage or status write failed.
    StorageOperationFailed,
    /// The artifact exceeded the configured size limit.
    ArtifactTooLarge,
    /// The spec could not be interpreted.
    InvalidSpec,
}

impl ConditionReason {
    /// Reason to report for a failure of the given kind.
    pub fn for_error(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Fetch => Self::FetchFailed,
            ErrorKind::SizeExceeded => Self::ArtifactTooLarge,
            ErrorKind::Validation | ErrorKind::Configuration => Self::InvalidSpec,
            ErrorKind::Io | ErrorKind::NotFound | ErrorKind::Publish | ErrorKind::Cancelled => {
                Self::StorageOperationFailed
            }
        }
    }
}

impl std::fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "Succeeded",
            Self::FetchFailed => "FetchFailed",
            Self::StorageOperationFailed => "StorageOperationFailed",
            Self::ArtifactTooLarge => "ArtifactTooLarge",
            Self::InvalidSpec => "InvalidSpec",
        };
        f.write_str(s)
    }
}

/// A status condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Ready`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Truth value.
    pub status: ConditionStatus,
    /// Machine-readable reason.
    pub reason: ConditionReason,
    /// Human-readable detail.
    pub message: String,
    /// When `status` last changed.
    pub last_transition_time: DateTime<Utc>,
}

/// A revision that failed permanently and is not retried until the
/// spec changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedRevision {
    /// The rejected upstream revision.
    pub revision: Revision,
    /// Spec generation the rejection applies to.
    pub generation: u64,
}

/// Name of the readiness condition.
pub const READY_CONDITION: &str = "Ready";

/// Observed state of a source, as published by its coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    /// Reference to the current artifact, once one has been produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactStatus>,
    /// Status conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Generation the status was computed for.
    #[serde(default)]
    pub observed_generation: u64,
    /// Last revision rejected as too large.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<RejectedRevision>,
}

impl SourceStatus {
    /// The `Ready` condition, if present.
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == READY_CONDITION)
    }

    /// Whether the `Ready` condition is `True`.
    pub fn is_ready(&self) -> bool {
        self.ready_condition()
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Revision of the published artifact, if any.
    pub fn last_revision(&self) -> Option<&Revision> {
        self.artifact.as_ref().map(|a| &a.revision)
    }

    /// The rejected revision, if the rejection still applies at
    /// `generation`.
    pub fn rejected_at(&self, generation: u64) -> Option<&Revision> {
        self.rejected
            .as_ref()
            .filter(|r| r.generation == generation)
            .map(|r| &r.revision)
    }

    /// Set the `Ready` condition.
    ///
    /// The transition time only moves when the status value flips.
    pub fn set_ready(
        &mut self,
        status: ConditionStatus,
        reason: ConditionReason,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let message = message.into();
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == READY_CONDITION)
        {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason;
            existing.message = message;
            return;
        }
        self.conditions.push(Condition {
            type_: READY_CONDITION.to_string(),
            status,
            reason,
            message,
            last_transition_time: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn set_ready_keeps_transition_time_when_status_unchanged() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);
        let mut status = SourceStatus::default();
        status.set_ready(ConditionStatus::False, ConditionReason::FetchFailed, "boom", t0);
        status.set_ready(ConditionStatus::False, ConditionReason::FetchFailed, "boom again", t1);
        let ready = status.ready_condition().unwrap();
        assert_eq!(ready.last_transition_time, t0);
        assert_eq!(ready.message, "boom again");
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn set_ready_moves_transition_time_on_flip() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);
        let mut status = SourceStatus::default();
        status.set_ready(ConditionStatus::False, ConditionReason::FetchFailed, "boom", t0);
        status.set_ready(ConditionStatus::True, ConditionReason::Succeeded, "stored", t1);
        assert!(status.is_ready());
        assert_eq!(status.ready_condition().unwrap().last_transition_time, t1);
    }

    #[test]
    fn reason_for_error_kind() {
        assert_eq!(ConditionReason::for_error(ErrorKind::Fetch), ConditionReason::FetchFailed);
        assert_eq!(
            ConditionReason::for_error(ErrorKind::SizeExceeded),
            ConditionReason::ArtifactTooLarge
        );
        assert_eq!(
            ConditionReason::for_error(ErrorKind::Io),
            ConditionReason::StorageOperationFailed
        );
    }

    #[test]
    fn spec_interval_defaults_when_absent() {
        let spec: SourceSpec =
            serde_json::from_str(r#"{"url":"https://charts.example.com"}"#).unwrap();
        assert_eq!(spec.interval_secs, DEFAULT_INTERVAL_SECS);
        assert_eq!(spec.interval(), std::time::Duration::from_secs(60));
    }

    #[test]
    fn rejection_expires_with_generation() {
        let mut status = SourceStatus::default();
        assert!(status.rejected_at(1).is_none());
        status.rejected = Some(RejectedRevision {
            revision: Revision::new("6.5.0").unwrap(),
            generation: 2,
        });
        assert_eq!(status.rejected_at(2).map(Revision::as_str), Some("6.5.0"));
        assert!(status.rejected_at(3).is_none());
    }

    #[test]
    fn condition_serializes_type_field() {
        let mut status = SourceStatus::default();
        status.set_ready(ConditionStatus::True, ConditionReason::Succeeded, "ok", Utc::now());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["conditions"][0]["type"], "Ready");
        assert_eq!(json["conditions"][0]["reason"], "Succeeded");
        assert!(json.get("artifact").is_none());
    }
}
