use async_trait::async_trait;
use baton_core::{content_hash, ArtifactRef, BatonError, BatonResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

const MEMORY_SCHEME: &str = "mem://";
const INDEX_FILE: &str = "index.jsonl";

/// Storage for artifact content. Tasks only ever carry [`ArtifactRef`]
/// pointers; the bytes live here.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `content` as `name` for `task_id` and returns its reference.
    async fn put(
        &self,
        task_id: Uuid,
        kind: &str,
        name: &str,
        content: &[u8],
    ) -> BatonResult<ArtifactRef>;

    /// Loads the content behind `artifact`, checking it against the recorded
    /// hash.
    async fn fetch(&self, artifact: &ArtifactRef) -> BatonResult<Vec<u8>>;

    /// References stored for a task, in storage order.
    async fn list_for_task(&self, task_id: Uuid) -> BatonResult<Vec<ArtifactRef>>;
}

/// File name of an artifact: the last segment of its location.
pub fn artifact_name(artifact: &ArtifactRef) -> &str {
    artifact
        .location
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(artifact.location.as_str())
}

fn check_name(name: &str) -> BatonResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name == INDEX_FILE
    {
        return Err(BatonError::Protocol(format!(
            "invalid artifact name '{name}'"
        )));
    }
    Ok(())
}

fn verify(artifact: &ArtifactRef, content: Vec<u8>) -> BatonResult<Vec<u8>> {
    let actual = content_hash(&content);
    if actual != artifact.content_hash {
        return Err(BatonError::Integrity(format!(
            "artifact {} at {}: expected sha256 {}, found {actual}",
            artifact.id, artifact.location, artifact.content_hash
        )));
    }
    Ok(content)
}

/// In-memory artifact store for tests and short-lived runs.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    // location -> (reference, content)
    entries: RwLock<HashMap<String, (ArtifactRef, Vec<u8>)>>,
    order: RwLock<Vec<String>>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces stored bytes without updating the reference. Test hook for
    /// integrity failures.
    pub fn tamper(&self, location: &str, content: &[u8]) -> bool {
        match self.entries.write().get_mut(location) {
            Some(entry) => {
                entry.1 = content.to_vec();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(
        &self,
        task_id: Uuid,
        kind: &str,
        name: &str,
        content: &[u8],
    ) -> BatonResult<ArtifactRef> {
        check_name(name)?;
        let location = format!("{MEMORY_SCHEME}{task_id}/{name}");
        let artifact = ArtifactRef::for_content(task_id, kind, &location, content);
        let previous = self
            .entries
            .write()
            .insert(location.clone(), (artifact.clone(), content.to_vec()));
        if previous.is_none() {
            self.order.write().push(location);
        }
        Ok(artifact)
    }

    async fn fetch(&self, artifact: &ArtifactRef) -> BatonResult<Vec<u8>> {
        let content = self
            .entries
            .read()
            .get(&artifact.location)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| {
                BatonError::Integrity(format!("artifact not found at {}", artifact.location))
            })?;
        verify(artifact, content)
    }

    async fn list_for_task(&self, task_id: Uuid) -> BatonResult<Vec<ArtifactRef>> {
        let entries = self.entries.read();
        Ok(self
            .order
            .read()
            .iter()
            .filter_map(|loc| entries.get(loc))
            .filter(|(a, _)| a.task_id == task_id)
            .map(|(a, _)| a.clone())
            .collect())
    }
}

/// Filesystem artifact store: `<root>/<task_id>/<name>` plus a per-task
/// `index.jsonl` of references.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Opens (and creates) a store rooted at `root`.
    pub async fn new(root: impl Into<PathBuf>) -> BatonResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let root = tokio::fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_dir(&self, task_id: Uuid) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    fn resolve(&self, artifact: &ArtifactRef) -> BatonResult<PathBuf> {
        let name = artifact_name(artifact);
        check_name(name)?;
        let path = self.task_dir(artifact.task_id).join(name);
        if Path::new(&artifact.location) != path {
            return Err(BatonError::Integrity(format!(
                "artifact {} is not stored under {}",
                artifact.id,
                self.root.display()
            )));
        }
        Ok(path)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        task_id: Uuid,
        kind: &str,
        name: &str,
        content: &[u8],
    ) -> BatonResult<ArtifactRef> {
        check_name(name)?;
        let dir = self.task_dir(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        tokio::fs::write(&path, content).await?;

        let artifact =
            ArtifactRef::for_content(task_id, kind, path.to_string_lossy().as_ref(), content);
        let mut line = serde_json::to_string(&artifact)?;
        line.push('\n');
        let mut index = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(INDEX_FILE))
            .await?;
        index.write_all(line.as_bytes()).await?;
        index.flush().await?;

        debug!(task_id = %task_id, name = %name, size = content.len(), "ArtifactStore: stored");
        Ok(artifact)
    }

    async fn fetch(&self, artifact: &ArtifactRef) -> BatonResult<Vec<u8>> {
        let path = self.resolve(artifact)?;
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BatonError::Integrity(format!(
                    "artifact not found at {}",
                    artifact.location
                )))
            }
            Err(e) => return Err(e.into()),
        };
        verify(artifact, content)
    }

    async fn list_for_task(&self, task_id: Uuid) -> BatonResult<Vec<ArtifactRef>> {
        let index = self.task_dir(task_id).join(INDEX_FILE);
        if !tokio::fs::try_exists(&index).await? {
            return Ok(Vec::new());
        }
        let text = tokio::fs::read_to_string(&index).await?;
        // Later entries for the same location supersede earlier ones.
        let mut refs: Vec<ArtifactRef> = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let artifact: ArtifactRef = serde_json::from_str(line)?;
            refs.retain(|a| a.location != artifact.location);
            refs.push(artifact);
        }
        Ok(refs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn ArtifactStore) {
        let task = Uuid::new_v4();
        let a = store.put(task, "script", "run.sh", b"echo ok").await.unwrap();
        assert_eq!(a.content_hash, content_hash(b"echo ok"));
        assert_eq!(a.size, 7);
        assert_eq!(artifact_name(&a), "run.sh");
        assert_eq!(store.fetch(&a).await.unwrap(), b"echo ok");

        store.put(task, "doc", "notes.md", b"# notes").await.unwrap();
        store.put(Uuid::new_v4(), "doc", "other.md", b"x").await.unwrap();
        let listed = store.list_for_task(task).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a.id);

        let mut forged = a.clone();
        forged.content_hash = content_hash(b"something else");
        assert!(matches!(
            store.fetch(&forged).await,
            Err(BatonError::Integrity(_))
        ));

        assert!(store.put(task, "doc", "../escape", b"x").await.is_err());
        assert!(store.put(task, "doc", "", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryArtifactStore::new();
        exercise(&store).await;

        let task = Uuid::new_v4();
        let a = store.put(task, "code", "lib.rs", b"fn a() {}").await.unwrap();
        assert!(store.tamper(&a.location, b"fn b() {}"));
        assert!(matches!(store.fetch(&a).await, Err(BatonError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).await.unwrap();
        exercise(&store).await;

        let task = Uuid::new_v4();
        let first = store.put(task, "code", "lib.rs", b"v1").await.unwrap();
        let second = store.put(task, "code", "lib.rs", b"v2").await.unwrap();
        let listed = store.list_for_task(task).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, second.id);
        assert!(store.fetch(&first).await.is_err());

        let mut outside = second.clone();
        outside.location = "/etc/passwd".into();
        assert!(matches!(
            store.fetch(&outside).await,
            Err(BatonError::Integrity(_))
        ));
    }
}
