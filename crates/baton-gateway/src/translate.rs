//! Pure translation between the internal dispatch schema and the external
//! agent protocol.
//!
//! Nothing here touches the ledger or the network. Identical inputs always
//! produce byte-identical canonical output, so translations can be digested
//! and compared across retries.

use crate::schema::{
    ExternalArtifact, ExternalState, ExternalStatus, ExternalTaskRequest, ExternalTaskResult,
};
use baton_core::{
    content_hash, ArtifactRef, BatonError, BatonResult, ProtocolBinding, Task, TaskState,
};
use serde::Serialize;
use uuid::Uuid;

/// Canonical JSON bytes: object keys sorted, no insignificant whitespace.
pub fn canonical_bytes<T: Serialize>(value: &T) -> BatonResult<Vec<u8>> {
    // `serde_json::Value` objects are ordered maps, so going through a Value
    // fixes the key order regardless of struct field order.
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// sha256 of the canonical bytes.
pub fn digest<T: Serialize>(value: &T) -> BatonResult<String> {
    Ok(content_hash(&canonical_bytes(value)?))
}

/// Internal task to external creation request. The external id is the task
/// id, so re-sending the same task is idempotent on the far side.
pub fn to_external(task: &Task) -> ExternalTaskRequest {
    ExternalTaskRequest {
        id: task.id.to_string(),
        task_type: task.task_type.clone(),
        parameters: task.parameters.clone(),
        priority: task.priority,
        timeout: task.ttl().num_seconds().max(1) as u64,
    }
}

/// External creation request to an internal task addressed to `to_agent`.
pub fn to_internal(
    request: &ExternalTaskRequest,
    from_agent: &str,
    to_agent: &str,
    session_id: Uuid,
) -> BatonResult<Task> {
    if request.id.trim().is_empty() {
        return Err(BatonError::Protocol("external task id is empty".into()));
    }
    if request.task_type.trim().is_empty() {
        return Err(BatonError::Protocol(format!(
            "external task {} has no type",
            request.id
        )));
    }
    if request.timeout == 0 {
        return Err(BatonError::Protocol(format!(
            "external task {} has a zero timeout",
            request.id
        )));
    }
    let ttl = chrono::Duration::seconds(i64::try_from(request.timeout).map_err(|_| {
        BatonError::Protocol(format!("external task {} timeout out of range", request.id))
    })?);

    let mut task = Task::new(
        session_id,
        from_agent,
        to_agent,
        &request.task_type,
        ProtocolBinding::Internal,
        ttl,
    )
    .with_parameters(request.parameters.clone())
    .with_priority(request.priority);
    task.external_id = Some(request.id.clone());
    Ok(task)
}

/// Internal artifact reference to the external form. The hash is carried
/// unchanged.
pub fn artifact_to_external(artifact: &ArtifactRef) -> ExternalArtifact {
    ExternalArtifact {
        id: artifact.id.to_string(),
        task_id: artifact.task_id.to_string(),
        kind: artifact.kind.clone(),
        location: artifact.location.clone(),
        content_hash: artifact.content_hash.clone(),
        size: artifact.size,
        created_at: artifact.created_at,
    }
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// External artifact reference to the internal form, attributed to
/// `task_id`. A malformed hash or an empty location is an integrity error.
///
/// External ids are opaque strings. One that is not a UUID maps to a v5
/// UUID derived from it, so the same external artifact always gets the same
/// internal id.
pub fn artifact_from_external(artifact: &ExternalArtifact, task_id: Uuid) -> BatonResult<ArtifactRef> {
    if !is_sha256_hex(&artifact.content_hash) {
        return Err(BatonError::Integrity(format!(
            "artifact {} has malformed content hash '{}'",
            artifact.id, artifact.content_hash
        )));
    }
    let id = Uuid::parse_str(&artifact.id)
        .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, artifact.id.as_bytes()));
    if artifact.location.trim().is_empty() {
        return Err(BatonError::Integrity(format!(
            "artifact {} has no location",
            artifact.id
        )));
    }
    Ok(ArtifactRef {
        id,
        task_id,
        kind: artifact.kind.clone(),
        location: artifact.location.clone(),
        content_hash: artifact.content_hash.clone(),
        size: artifact.size,
        created_at: artifact.created_at,
    })
}

/// Ledger state implied by an external state.
pub fn state_from_external(state: ExternalState) -> TaskState {
    match state {
        ExternalState::Submitted => TaskState::Accepted,
        ExternalState::Working => TaskState::InProgress,
        ExternalState::Completed => TaskState::Completed,
        ExternalState::Failed | ExternalState::Rejected => TaskState::Failed,
        ExternalState::Cancelled => TaskState::Cancelled,
    }
}

/// External state reported for a ledger state.
pub fn state_to_external(state: TaskState) -> ExternalState {
    match state {
        TaskState::Pending | TaskState::Accepted => ExternalState::Submitted,
        TaskState::InProgress => ExternalState::Working,
        TaskState::Completed => ExternalState::Completed,
        TaskState::Failed => ExternalState::Failed,
        TaskState::Cancelled => ExternalState::Cancelled,
    }
}

/// External status document for a task. The id is the task's external id
/// when it has one.
pub fn status_for(task: &Task) -> ExternalStatus {
    ExternalStatus {
        id: external_id_of(task),
        state: state_to_external(task.state),
        progress: match task.state {
            TaskState::Completed => Some(1.0),
            TaskState::Pending | TaskState::Accepted => Some(0.0),
            _ => None,
        },
        message: task.error.as_ref().map(|e| e.message.clone()),
    }
}

/// External result document for a task.
pub fn result_for(task: &Task) -> ExternalTaskResult {
    ExternalTaskResult {
        id: external_id_of(task),
        state: state_to_external(task.state),
        result: task.result.clone(),
        error: task.error.as_ref().map(|e| e.message.clone()),
        artifacts: task.artifacts.iter().map(artifact_to_external).collect(),
    }
}

fn external_id_of(task: &Task) -> String {
    task.external_id
        .clone()
        .unwrap_or_else(|| task.id.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::InternalEnvelope;
    use baton_core::Priority;

    fn task() -> Task {
        Task::new(
            Uuid::new_v4(),
            "coordinator",
            "reviewer",
            "review",
            ProtocolBinding::External,
            chrono::Duration::minutes(10),
        )
        .with_parameters(serde_json::json!({"z": 1, "a": {"y": 2, "b": 3}}))
        .with_priority(Priority::High)
    }

    #[test]
    fn test_to_external_uses_task_id_and_ttl() {
        let t = task();
        let req = to_external(&t);
        assert_eq!(req.id, t.id.to_string());
        assert_eq!(req.timeout, 600);
        assert_eq!(req.priority, Priority::High);
    }

    #[test]
    fn test_canonical_bytes_are_stable() {
        let t = task();
        let a = canonical_bytes(&to_external(&t)).unwrap();
        let b = canonical_bytes(&to_external(&t)).unwrap();
        assert_eq!(a, b);
        let text = String::from_utf8(a).unwrap();
        assert!(text.find("\"a\"").unwrap() < text.find("\"z\"").unwrap());
        assert_eq!(
            digest(&InternalEnvelope::from(&t)).unwrap(),
            digest(&InternalEnvelope::from(&t)).unwrap()
        );
    }

    #[test]
    fn test_round_trip_preserves_type_parameters_priority() {
        let t = task();
        let req = to_external(&t);
        let back = to_internal(&req, "external-peer", "coder", Uuid::new_v4()).unwrap();
        assert_eq!(back.task_type, t.task_type);
        assert_eq!(back.parameters, t.parameters);
        assert_eq!(back.priority, t.priority);
        assert_eq!(back.ttl(), t.ttl());
        assert_eq!(back.external_id.as_deref(), Some(req.id.as_str()));
    }

    #[test]
    fn test_to_internal_rejects_malformed() {
        let mut req = to_external(&task());
        req.timeout = 0;
        assert!(matches!(
            to_internal(&req, "a", "b", Uuid::new_v4()),
            Err(BatonError::Protocol(_))
        ));
        req.timeout = 5;
        req.task_type = " ".into();
        assert!(to_internal(&req, "a", "b", Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_artifact_hash_preserved_and_validated() {
        let t = task();
        let artifact = ArtifactRef::for_content(t.id, "code", "mem://a", b"fn x() {}");
        let ext = artifact_to_external(&artifact);
        let back = artifact_from_external(&ext, t.id).unwrap();
        assert_eq!(back, artifact);

        let mut bad = ext.clone();
        bad.content_hash = "XYZ".into();
        assert!(matches!(
            artifact_from_external(&bad, t.id),
            Err(BatonError::Integrity(_))
        ));
        let mut no_location = ext;
        no_location.location = " ".into();
        assert!(artifact_from_external(&no_location, t.id).is_err());
    }

    #[test]
    fn test_opaque_artifact_id_maps_to_stable_uuid() {
        let t = task();
        let mut ext = artifact_to_external(&ArtifactRef::for_content(
            t.id,
            "report",
            "s3://bucket/report.md",
            b"# findings",
        ));
        ext.id = "report-7f3a".into();

        let first = artifact_from_external(&ext, t.id).unwrap();
        let second = artifact_from_external(&ext, t.id).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.id.get_version_num(), 5);
        assert_eq!(first.location, "s3://bucket/report.md");

        ext.id = "report-7f3b".into();
        assert_ne!(artifact_from_external(&ext, t.id).unwrap().id, first.id);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(state_from_external(ExternalState::Working), TaskState::InProgress);
        assert_eq!(state_from_external(ExternalState::Rejected), TaskState::Failed);
        assert_eq!(state_to_external(TaskState::Accepted), ExternalState::Submitted);
        let mut t = task();
        t.state = TaskState::Completed;
        assert_eq!(status_for(&t).progress, Some(1.0));
    }
}
