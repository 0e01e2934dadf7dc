use async_trait::async_trait;
use baton_core::{
    BatonError, BatonResult, ProtocolBinding, SessionVersion, TranslationDirection,
    TranslationRecord,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Versioned, append-only storage for session records and the translation
/// records that link both sides of every gateway handoff.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates a session and stores its first version.
    async fn open(
        &self,
        origin: ProtocolBinding,
        parent: Option<Uuid>,
    ) -> BatonResult<SessionVersion>;

    /// Appends a superseding version. Its `version` must be exactly one more
    /// than the latest stored version.
    async fn append(&self, next: SessionVersion) -> BatonResult<()>;

    /// Latest version of a session.
    async fn latest(&self, session_id: Uuid) -> BatonResult<SessionVersion>;

    /// All versions of a session, oldest first.
    async fn history(&self, session_id: Uuid) -> BatonResult<Vec<SessionVersion>>;

    /// Stores a translation record. If one already exists for the same task
    /// and direction, that record is returned and nothing is written.
    async fn record_translation(&self, record: TranslationRecord)
        -> BatonResult<TranslationRecord>;

    /// Translation records of a task.
    async fn translations(&self, task_id: Uuid) -> BatonResult<Vec<TranslationRecord>>;

    /// Removes sessions whose latest version is older than `older_than`,
    /// together with their translation records. Returns sessions removed.
    async fn prune(&self, older_than: DateTime<Utc>) -> BatonResult<usize>;
}

fn check_next(latest: Option<u64>, next: &SessionVersion) -> BatonResult<()> {
    let expected = latest.map_or(1, |v| v + 1);
    if next.version != expected {
        return Err(BatonError::SessionConflict(format!(
            "session {} expected version {expected}, got {}",
            next.session_id, next.version
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// InMemorySessionStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<Uuid, Vec<SessionVersion>>,
    translations: HashMap<(Uuid, TranslationDirection), TranslationRecord>,
}

/// Session store kept entirely in memory.
#[derive(Default)]
pub struct InMemorySessionStore {
    state: RwLock<MemoryState>,
}

impl InMemorySessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn open(
        &self,
        origin: ProtocolBinding,
        parent: Option<Uuid>,
    ) -> BatonResult<SessionVersion> {
        let initial = SessionVersion::initial(origin, parent);
        self.append(initial.clone()).await?;
        Ok(initial)
    }

    async fn append(&self, next: SessionVersion) -> BatonResult<()> {
        let mut state = self.state.write();
        let latest = state
            .sessions
            .get(&next.session_id)
            .and_then(|v| v.last())
            .map(|v| v.version);
        check_next(latest, &next)?;
        state.sessions.entry(next.session_id).or_default().push(next);
        Ok(())
    }

    async fn latest(&self, session_id: Uuid) -> BatonResult<SessionVersion> {
        self.state
            .read()
            .sessions
            .get(&session_id)
            .and_then(|v| v.last().cloned())
            .ok_or(BatonError::SessionNotFound(session_id))
    }

    async fn history(&self, session_id: Uuid) -> BatonResult<Vec<SessionVersion>> {
        self.state
            .read()
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or(BatonError::SessionNotFound(session_id))
    }

    async fn record_translation(
        &self,
        record: TranslationRecord,
    ) -> BatonResult<TranslationRecord> {
        let mut state = self.state.write();
        let stored = state
            .translations
            .entry((record.task_id, record.direction))
            .or_insert(record);
        Ok(stored.clone())
    }

    async fn translations(&self, task_id: Uuid) -> BatonResult<Vec<TranslationRecord>> {
        let state = self.state.read();
        let mut records: Vec<TranslationRecord> = state
            .translations
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> BatonResult<usize> {
        let mut state = self.state.write();
        let stale: Vec<Uuid> = state
            .sessions
            .iter()
            .filter(|(_, versions)| versions.last().map_or(true, |v| v.recorded_at < older_than))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            state.sessions.remove(id);
        }
        state
            .translations
            .retain(|_, record| !stale.contains(&record.session_id));
        Ok(stale.len())
    }
}

// ---------------------------------------------------------------------------
// JsonlSessionStore
// ---------------------------------------------------------------------------

/// File-backed session store.
///
/// Each session is one `<id>.session.jsonl` file with a version per line;
/// translation records share a single `translations.jsonl`.
pub struct JsonlSessionStore {
    dir: PathBuf,
    /// Serialises appends and caches the latest version per session.
    latest: Mutex<HashMap<Uuid, u64>>,
    translations: Mutex<HashMap<(Uuid, TranslationDirection), TranslationRecord>>,
}

impl JsonlSessionStore {
    /// Opens (or creates) a store rooted at `dir`.
    pub async fn new(dir: PathBuf) -> BatonResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let store = Self {
            dir,
            latest: Mutex::new(HashMap::new()),
            translations: Mutex::new(HashMap::new()),
        };
        let existing = store.read_translations().await?;
        let count = existing.len();
        *store.translations.lock().await = existing
            .into_iter()
            .map(|r| ((r.task_id, r.direction), r))
            .collect();
        debug!(dir = %store.dir.display(), translations = count, "SessionStore: opened");
        Ok(store)
    }

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.session.jsonl"))
    }

    fn translations_path(&self) -> PathBuf {
        self.dir.join("translations.jsonl")
    }

    async fn append_line<T: serde::Serialize>(path: &Path, value: &T) -> BatonResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> BatonResult<Vec<T>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(path).await?;
        let items = data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<T>, _>>()?;
        Ok(items)
    }

    async fn read_versions(&self, id: Uuid) -> BatonResult<Vec<SessionVersion>> {
        Self::read_lines(&self.session_path(id)).await
    }

    async fn read_translations(&self) -> BatonResult<Vec<TranslationRecord>> {
        Self::read_lines(&self.translations_path()).await
    }
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    async fn open(
        &self,
        origin: ProtocolBinding,
        parent: Option<Uuid>,
    ) -> BatonResult<SessionVersion> {
        let initial = SessionVersion::initial(origin, parent);
        self.append(initial.clone()).await?;
        Ok(initial)
    }

    async fn append(&self, next: SessionVersion) -> BatonResult<()> {
        let mut latest = self.latest.lock().await;
        let current = match latest.get(&next.session_id) {
            Some(v) => Some(*v),
            None => self.read_versions(next.session_id).await?.last().map(|v| v.version),
        };
        check_next(current, &next)?;
        Self::append_line(&self.session_path(next.session_id), &next).await?;
        latest.insert(next.session_id, next.version);
        Ok(())
    }

    async fn latest(&self, session_id: Uuid) -> BatonResult<SessionVersion> {
        self.read_versions(session_id)
            .await?
            .pop()
            .ok_or(BatonError::SessionNotFound(session_id))
    }

    async fn history(&self, session_id: Uuid) -> BatonResult<Vec<SessionVersion>> {
        let versions = self.read_versions(session_id).await?;
        if versions.is_empty() {
            return Err(BatonError::SessionNotFound(session_id));
        }
        Ok(versions)
    }

    async fn record_translation(
        &self,
        record: TranslationRecord,
    ) -> BatonResult<TranslationRecord> {
        let mut translations = self.translations.lock().await;
        let key = (record.task_id, record.direction);
        if let Some(existing) = translations.get(&key) {
            return Ok(existing.clone());
        }
        Self::append_line(&self.translations_path(), &record).await?;
        translations.insert(key, record.clone());
        Ok(record)
    }

    async fn translations(&self, task_id: Uuid) -> BatonResult<Vec<TranslationRecord>> {
        let translations = self.translations.lock().await;
        let mut records: Vec<TranslationRecord> = translations
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> BatonResult<usize> {
        let mut latest = self.latest.lock().await;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut stale = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".session.jsonl"))
                .and_then(|stem| Uuid::parse_str(stem).ok())
            else {
                continue;
            };
            let versions = self.read_versions(id).await?;
            if versions.last().map_or(true, |v| v.recorded_at < older_than) {
                tokio::fs::remove_file(entry.path()).await?;
                latest.remove(&id);
                stale.push(id);
            }
        }

        if !stale.is_empty() {
            let mut translations = self.translations.lock().await;
            translations.retain(|_, r| !stale.contains(&r.session_id));
            let mut body = String::new();
            for record in translations.values() {
                body.push_str(&serde_json::to_string(record)?);
                body.push('\n');
            }
            tokio::fs::write(self.translations_path(), body).await?;
            info!(pruned = stale.len(), "SessionStore: stale sessions pruned");
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn translation(session_id: Uuid, task_id: Uuid, tag: &str) -> TranslationRecord {
        TranslationRecord {
            id: Uuid::new_v4(),
            session_id,
            task_id,
            direction: TranslationDirection::InternalToExternal,
            source_digest: format!("src-{tag}"),
            destination_digest: format!("dst-{tag}"),
            destination_payload: serde_json::json!({"tag": tag}),
            created_at: Utc::now(),
        }
    }

    async fn exercise(store: &dyn SessionStore) {
        let v1 = store.open(ProtocolBinding::Internal, None).await.unwrap();
        let v2 = v1.next().with_marker("stage", serde_json::json!("dispatched"));
        store.append(v2.clone()).await.unwrap();

        let stale = v1.next();
        let err = store.append(stale).await.unwrap_err();
        assert!(matches!(err, BatonError::SessionConflict(_)));

        let skip = v2.next().next();
        assert!(store.append(skip).await.is_err());

        let latest = store.latest(v1.session_id).await.unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.markers["stage"], "dispatched");
        assert_eq!(store.history(v1.session_id).await.unwrap().len(), 2);

        let task_id = Uuid::new_v4();
        let first = store
            .record_translation(translation(v1.session_id, task_id, "a"))
            .await
            .unwrap();
        let second = store
            .record_translation(translation(v1.session_id, task_id, "b"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.source_digest, "src-a");
        assert_eq!(store.translations(task_id).await.unwrap().len(), 1);

        assert!(matches!(
            store.latest(Uuid::new_v4()).await,
            Err(BatonError::SessionNotFound(_))
        ));

        assert_eq!(store.prune(Utc::now() - chrono::Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(store.prune(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
        assert!(store.latest(v1.session_id).await.is_err());
        assert!(store.translations(task_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise(&InMemorySessionStore::new()).await;
    }

    #[tokio::test]
    async fn test_jsonl_store() {
        let tmp = TempDir::new().unwrap();
        let store = JsonlSessionStore::new(tmp.path().to_path_buf()).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_jsonl_store_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let task_id = Uuid::new_v4();
        let session_id = {
            let store = JsonlSessionStore::new(tmp.path().to_path_buf()).await.unwrap();
            let v1 = store.open(ProtocolBinding::External, None).await.unwrap();
            store
                .record_translation(translation(v1.session_id, task_id, "a"))
                .await
                .unwrap();
            v1.session_id
        };

        let store = JsonlSessionStore::new(tmp.path().to_path_buf()).await.unwrap();
        let v1 = store.latest(session_id).await.unwrap();
        assert_eq!(v1.origin, ProtocolBinding::External);
        store.append(v1.next()).await.unwrap();
        assert!(store.append(v1.next()).await.is_err());
        let again = store
            .record_translation(translation(session_id, task_id, "b"))
            .await
            .unwrap();
        assert_eq!(again.source_digest, "src-a");
    }
}
