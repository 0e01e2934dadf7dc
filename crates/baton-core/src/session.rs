use crate::task::{ArtifactRef, ProtocolBinding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One immutable version of a session record.
///
/// Sessions are never mutated in place: each significant change writes a new
/// version whose `version` is exactly one more than the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionVersion {
    /// Session id shared by every version.
    pub session_id: Uuid,
    /// 1-based, strictly increasing per session.
    pub version: u64,
    /// Protocol the chain of work originated in.
    pub origin: ProtocolBinding,
    /// Protocol on the far side of the gateway, when crossed.
    #[serde(default)]
    pub destination: Option<ProtocolBinding>,
    /// Parent session for re-planned or spawned work.
    #[serde(default)]
    pub parent: Option<Uuid>,
    /// Tasks created inside this session, in creation order.
    #[serde(default)]
    pub task_ids: Vec<Uuid>,
    /// Artifact references collected so far, in production order.
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    /// Progress markers.
    #[serde(default)]
    pub markers: BTreeMap<String, serde_json::Value>,
    /// Task id assigned by the external protocol, once known.
    #[serde(default)]
    pub external_task_id: Option<String>,
    /// When this version was written.
    pub recorded_at: DateTime<Utc>,
}

impl SessionVersion {
    /// First version of a new session.
    pub fn initial(origin: ProtocolBinding, parent: Option<Uuid>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            version: 1,
            origin,
            destination: None,
            parent,
            task_ids: Vec::new(),
            artifacts: Vec::new(),
            markers: BTreeMap::new(),
            external_task_id: None,
            recorded_at: Utc::now(),
        }
    }

    /// Copy of this version with the version number bumped, ready to be
    /// modified and appended.
    pub fn next(&self) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.recorded_at = Utc::now();
        next
    }

    /// Sets a progress marker.
    pub fn with_marker(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.markers.insert(key.into(), value);
        self
    }
}

/// Direction of a protocol handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationDirection {
    /// Internal dispatch translated into an external task.
    InternalToExternal,
    /// External task translated into an internal dispatch.
    ExternalToInternal,
}

impl std::fmt::Display for TranslationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslationDirection::InternalToExternal => write!(f, "internal_to_external"),
            TranslationDirection::ExternalToInternal => write!(f, "external_to_internal"),
        }
    }
}

/// Links the origin and destination representations of one handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRecord {
    /// Record id.
    pub id: Uuid,
    /// Session the handoff belongs to.
    pub session_id: Uuid,
    /// Task that crossed the gateway.
    pub task_id: Uuid,
    /// Handoff direction.
    pub direction: TranslationDirection,
    /// sha256 of the canonical source representation.
    pub source_digest: String,
    /// sha256 of the canonical destination representation.
    pub destination_digest: String,
    /// Destination representation as sent.
    pub destination_payload: serde_json::Value,
    /// When the handoff was recorded.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_version_increments() {
        let v1 = SessionVersion::initial(ProtocolBinding::Internal, None);
        let v2 = v1.next().with_marker("stage", serde_json::json!("dispatched"));
        assert_eq!(v2.session_id, v1.session_id);
        assert_eq!(v2.version, 2);
        assert_eq!(v1.markers.len(), 0);
        assert_eq!(v2.markers["stage"], "dispatched");
    }
}
