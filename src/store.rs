//! Durable task state: a small key-value store the orchestrator writes through on every
//! change so a restarted process can pick the task back up.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stored value for {key} is unreadable: {source}")]
    Decode {
        key: StoreKey,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreKey {
    TaskId,
    Description,
    Status,
    Iterations,
    Paused,
    LastOrigin,
    LastResult,
    ProcessingStatus,
    /// Set by a control surface to declare the session finished.
    SessionStatus,
}

impl StoreKey {
    pub const ALL: [StoreKey; 9] = [
        StoreKey::TaskId,
        StoreKey::Description,
        StoreKey::Status,
        StoreKey::Iterations,
        StoreKey::Paused,
        StoreKey::LastOrigin,
        StoreKey::LastResult,
        StoreKey::ProcessingStatus,
        StoreKey::SessionStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKey::TaskId => "task_id",
            StoreKey::Description => "task_description",
            StoreKey::Status => "task_status",
            StoreKey::Iterations => "iterations",
            StoreKey::Paused => "is_paused",
            StoreKey::LastOrigin => "last_origin",
            StoreKey::LastResult => "last_result",
            StoreKey::ProcessingStatus => "processing_status",
            StoreKey::SessionStatus => "session_status",
        }
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, key: StoreKey) -> Result<Option<Value>, StoreError>;
    async fn set(&self, key: StoreKey, value: Value) -> Result<(), StoreError>;
    async fn remove(&self, key: StoreKey) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
}

/// Typed read of a single key. A value that no longer decodes only fails this key.
pub async fn load<T: DeserializeOwned>(
    store: &dyn TaskStore,
    key: StoreKey,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StoreError::Decode { key, source }),
        None => Ok(None),
    }
}

pub async fn save<T: Serialize + ?Sized + Sync>(
    store: &dyn TaskStore,
    key: StoreKey,
    value: &T,
) -> Result<(), StoreError> {
    store.set(key, serde_json::to_value(value)?).await
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<StoreKey, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get(&self, key: StoreKey) -> Result<Option<Value>, StoreError> {
        Ok(self.values.lock().await.get(&key).cloned())
    }

    async fn set(&self, key: StoreKey, value: Value) -> Result<(), StoreError> {
        self.values.lock().await.insert(key, value);
        Ok(())
    }

    async fn remove(&self, key: StoreKey) -> Result<(), StoreError> {
        self.values.lock().await.remove(&key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.values.lock().await.clear();
        Ok(())
    }
}

/// One pretty-printed JSON object on disk, rewritten after every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<serde_json::Map<String, Value>>,
}

impl JsonFileStore {
    /// Open the store, starting empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => serde_json::Map::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state file yet");
                serde_json::Map::new()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// `<data dir>/navigator-agent/state.json`, or the working directory when the platform
    /// has no data dir.
    pub fn default_path() -> PathBuf {
        match dirs::data_dir() {
            Some(dir) => dir.join("navigator-agent").join(STATE_FILE),
            None => {
                warn!("no platform data directory; keeping state in the working directory");
                PathBuf::from(STATE_FILE)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scratch_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Write `next` to a scratch file and rename it over the state file. The previous file
    /// stays intact until the rename.
    async fn flush(&self, next: &serde_json::Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error(parent))?;
        }
        let bytes = serde_json::to_vec_pretty(next)?;
        let scratch = self.scratch_path();
        tokio::fs::write(&scratch, bytes).await.map_err(io_error(&scratch))?;
        if let Err(source) = tokio::fs::rename(&scratch, &self.path).await {
            let _ = tokio::fs::remove_file(&scratch).await;
            return Err(io_error(&self.path)(source));
        }
        Ok(())
    }

    /// Memory only takes `next` once it is on disk, so a failed write leaves both unchanged.
    async fn commit(
        &self,
        values: &mut serde_json::Map<String, Value>,
        next: serde_json::Map<String, Value>,
    ) -> Result<(), StoreError> {
        self.flush(&next).await?;
        *values = next;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonFileStore {
    async fn get(&self, key: StoreKey) -> Result<Option<Value>, StoreError> {
        Ok(self.values.lock().await.get(key.as_str()).cloned())
    }

    async fn set(&self, key: StoreKey, value: Value) -> Result<(), StoreError> {
        let mut values = self.values.lock().await;
        let mut next = values.clone();
        next.insert(key.as_str().to_string(), value);
        self.commit(&mut values, next).await
    }

    async fn remove(&self, key: StoreKey) -> Result<(), StoreError> {
        let mut values = self.values.lock().await;
        if !values.contains_key(key.as_str()) {
            return Ok(());
        }
        let mut next = values.clone();
        next.remove(key.as_str());
        self.commit(&mut values, next).await
    }

    /// Drops every engine key. Entries the engine does not own are left in the file.
    async fn clear(&self) -> Result<(), StoreError> {
        let mut values = self.values.lock().await;
        let mut next = values.clone();
        for key in StoreKey::ALL {
            next.remove(key.as_str());
        }
        self.commit(&mut values, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_typed_round_trip() {
        let store = MemoryStore::new();
        save(&store, StoreKey::Status, &TaskStatus::Paused).await.unwrap();
        save(&store, StoreKey::Iterations, &4u32).await.unwrap();

        let status: Option<TaskStatus> = load(&store, StoreKey::Status).await.unwrap();
        assert_eq!(status, Some(TaskStatus::Paused));
        let missing: Option<String> = load(&store, StoreKey::TaskId).await.unwrap();
        assert_eq!(missing, None);

        store.clear().await.unwrap();
        assert_eq!(store.get(StoreKey::Iterations).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bad_value_only_fails_its_key() {
        let store = MemoryStore::new();
        store.set(StoreKey::Iterations, json!("many")).await.unwrap();
        store.set(StoreKey::Paused, json!(true)).await.unwrap();

        let err = load::<u32>(&store, StoreKey::Iterations).await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { key: StoreKey::Iterations, .. }));
        assert_eq!(load::<bool>(&store, StoreKey::Paused).await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(STATE_FILE);

        let store = JsonFileStore::open(&path).await.unwrap();
        save(&store, StoreKey::TaskId, "task-9").await.unwrap();
        save(&store, StoreKey::Paused, &true).await.unwrap();
        store.remove(StoreKey::Paused).await.unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(
            load::<String>(&reopened, StoreKey::TaskId).await.unwrap().as_deref(),
            Some("task-9")
        );
        assert_eq!(reopened.get(StoreKey::Paused).await.unwrap(), None);

        let on_disk: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, json!({"task_id": "task-9"}));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);
        let store = JsonFileStore::open(&path).await.unwrap();
        save(&store, StoreKey::TaskId, "task-1").await.unwrap();

        // a directory squatting on the scratch file makes the next write fail, even as root
        let scratch = dir.path().join("state.json.tmp");
        std::fs::create_dir(&scratch).unwrap();
        let err = save(&store, StoreKey::TaskId, "task-2").await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(store.remove(StoreKey::TaskId).await.is_err());
        assert!(store.clear().await.is_err());

        assert_eq!(
            load::<String>(&store, StoreKey::TaskId).await.unwrap().as_deref(),
            Some("task-1")
        );
        let on_disk: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, json!({"task_id": "task-1"}));

        std::fs::remove_dir(&scratch).unwrap();
        save(&store, StoreKey::TaskId, "task-2").await.unwrap();
        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(
            load::<String>(&reopened, StoreKey::TaskId).await.unwrap().as_deref(),
            Some("task-2")
        );
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_clear_keeps_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);
        std::fs::write(&path, r#"{"theme": "dark", "task_id": "task-3", "iterations": 2}"#).unwrap();

        let store = JsonFileStore::open(&path).await.unwrap();
        store.clear().await.unwrap();
        for key in StoreKey::ALL {
            assert_eq!(store.get(key).await.unwrap(), None, "{key}");
        }
        let on_disk: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, json!({"theme": "dark"}));
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(file.path()).await,
            Err(StoreError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_file_opens_empty() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = JsonFileStore::open(file.path()).await.unwrap();
        assert_eq!(store.get(StoreKey::TaskId).await.unwrap(), None);
    }
}
