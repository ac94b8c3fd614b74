//! Saga persistence.
//!
//! A saga record is saved before any command it dispatches is sent, so a
//! restart can always find the saga an incoming status event belongs to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Requester, SagaId, TaskId, TaskRequest};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A dispatched task whose status event has not arrived yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTask {
    pub command_type: String,
    pub agent: Option<String>,
    pub payload: Value,
}

impl From<TaskRequest> for PendingTask {
    fn from(task: TaskRequest) -> Self {
        Self {
            command_type: task.command_type,
            agent: task.agent,
            payload: task.payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_id: SagaId,
    pub saga_type: String,
    /// Debug rendering of the typed state, for operators.
    pub state: String,
    pub data: Value,
    pub requester: Requester,
    #[serde(default)]
    pub pending: BTreeMap<TaskId, PendingTask>,
    /// Every task id ever dispatched by this saga.
    #[serde(default)]
    pub correlations: BTreeSet<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    pub fn new(saga_id: SagaId, saga_type: &str, requester: Requester) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            saga_type: saga_type.to_string(),
            state: String::new(),
            data: Value::Null,
            requester,
            pending: BTreeMap::new(),
            correlations: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn correlates(&self, task_id: TaskId) -> bool {
        self.correlations.contains(&task_id)
    }
}

/// Durable saga records. Lookups are served from memory; writes may touch
/// disk and are async.
#[async_trait]
pub trait SagaStore: Send + Sync {
    fn load(&self, saga_id: SagaId) -> Result<Option<SagaRecord>, StoreError>;
    async fn save(&self, record: &SagaRecord) -> Result<(), StoreError>;
    /// Removing an absent saga is not an error.
    async fn remove(&self, saga_id: SagaId) -> Result<(), StoreError>;
    fn find_by_task(&self, task_id: TaskId) -> Result<Option<SagaRecord>, StoreError>;
    fn find_by_requester(&self, requester: &Requester) -> Result<Option<SagaRecord>, StoreError>;
    fn list(&self) -> Result<Vec<SagaRecord>, StoreError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn find_task(records: &BTreeMap<SagaId, SagaRecord>, task_id: TaskId) -> Option<SagaRecord> {
    records.values().find(|r| r.correlates(task_id)).cloned()
}

fn find_requester(
    records: &BTreeMap<SagaId, SagaRecord>,
    requester: &Requester,
) -> Option<SagaRecord> {
    records
        .values()
        .find(|r| &r.requester == requester)
        .cloned()
}

/// Volatile store, for tests and single-shot runs.
#[derive(Default)]
pub struct MemorySagaStore {
    records: Mutex<BTreeMap<SagaId, SagaRecord>>,
}

impl MemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStore for MemorySagaStore {
    fn load(&self, saga_id: SagaId) -> Result<Option<SagaRecord>, StoreError> {
        Ok(lock(&self.records).get(&saga_id).cloned())
    }

    async fn save(&self, record: &SagaRecord) -> Result<(), StoreError> {
        lock(&self.records).insert(record.saga_id, record.clone());
        Ok(())
    }

    async fn remove(&self, saga_id: SagaId) -> Result<(), StoreError> {
        lock(&self.records).remove(&saga_id);
        Ok(())
    }

    fn find_by_task(&self, task_id: TaskId) -> Result<Option<SagaRecord>, StoreError> {
        Ok(find_task(&lock(&self.records), task_id))
    }

    fn find_by_requester(&self, requester: &Requester) -> Result<Option<SagaRecord>, StoreError> {
        Ok(find_requester(&lock(&self.records), requester))
    }

    fn list(&self) -> Result<Vec<SagaRecord>, StoreError> {
        Ok(lock(&self.records).values().cloned().collect())
    }
}

/// One JSON file per saga under a directory. Everything is read once at open
/// and served from memory afterwards; writes go through to disk first.
pub struct FileSagaStore {
    dir: PathBuf,
    records: Mutex<BTreeMap<SagaId, SagaRecord>>,
    /// Orders file writes; the memory map is only updated once a write landed.
    writer: tokio::sync::Mutex<()>,
}

impl FileSagaStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let mut records = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read_to_string(&path)?;
            match serde_json::from_str::<SagaRecord>(&data) {
                Ok(record) => {
                    records.insert(record.saga_id, record);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable saga record");
                }
            }
        }
        info!(dir = %dir.display(), sagas = records.len(), "saga store opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            records: Mutex::new(records),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    fn path_for(&self, saga_id: Uuid) -> PathBuf {
        self.dir.join(format!("{saga_id}.json"))
    }

    async fn persist(&self, record: &SagaRecord) -> Result<(), StoreError> {
        let path = self.path_for(record.saga_id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(saga_id = %record.saga_id, state = %record.state, "saga record written");
        Ok(())
    }
}

#[async_trait]
impl SagaStore for FileSagaStore {
    fn load(&self, saga_id: SagaId) -> Result<Option<SagaRecord>, StoreError> {
        Ok(lock(&self.records).get(&saga_id).cloned())
    }

    async fn save(&self, record: &SagaRecord) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        self.persist(record).await?;
        lock(&self.records).insert(record.saga_id, record.clone());
        Ok(())
    }

    async fn remove(&self, saga_id: SagaId) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        match tokio::fs::remove_file(self.path_for(saga_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        lock(&self.records).remove(&saga_id);
        Ok(())
    }

    fn find_by_task(&self, task_id: TaskId) -> Result<Option<SagaRecord>, StoreError> {
        Ok(find_task(&lock(&self.records), task_id))
    }

    fn find_by_requester(&self, requester: &Requester) -> Result<Option<SagaRecord>, StoreError> {
        Ok(find_requester(&lock(&self.records), requester))
    }

    fn list(&self) -> Result<Vec<SagaRecord>, StoreError> {
        Ok(lock(&self.records).values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record_with_task(task_id: TaskId) -> SagaRecord {
        let mut record = SagaRecord::new(
            Uuid::new_v4(),
            "CreateCatlet",
            Requester::Operation {
                operation_id: Uuid::new_v4(),
            },
        );
        record.state = "Placed".to_string();
        record.data = json!({"Placed": {"agent": "hv-1"}});
        record.pending.insert(
            task_id,
            PendingTask {
                command_type: "CreateCatletVm".to_string(),
                agent: Some("hv-1".to_string()),
                payload: json!({}),
            },
        );
        record.correlations.insert(task_id);
        record
    }

    #[tokio::test]
    async fn test_memory_store_lookup() {
        let store = MemorySagaStore::new();
        let task = Uuid::new_v4();
        let record = record_with_task(task);
        store.save(&record).await.unwrap();

        assert_eq!(store.load(record.saga_id).unwrap(), Some(record.clone()));
        assert_eq!(
            store.find_by_task(task).unwrap().map(|r| r.saga_id),
            Some(record.saga_id)
        );
        assert!(store.find_by_task(Uuid::new_v4()).unwrap().is_none());
        assert!(store
            .find_by_requester(&record.requester)
            .unwrap()
            .is_some());

        store.remove(record.saga_id).await.unwrap();
        store.remove(record.saga_id).await.unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let task = Uuid::new_v4();
        let record = record_with_task(task);
        {
            let store = FileSagaStore::open(dir.path()).unwrap();
            store.save(&record).await.unwrap();
        }

        let reopened = FileSagaStore::open(dir.path()).unwrap();
        let loaded = reopened.find_by_task(task).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.pending[&task].command_type, "CreateCatletVm");

        reopened.remove(record.saga_id).await.unwrap();
        let again = FileSagaStore::open(dir.path()).unwrap();
        assert!(again.list().unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_file_store_interleaved_saves() {
        let dir = tempdir().unwrap();
        let store = FileSagaStore::open(dir.path()).unwrap();
        let records: Vec<SagaRecord> = (0..3).map(|_| record_with_task(Uuid::new_v4())).collect();

        tokio::join!(
            async { store.save(&records[0]).await.unwrap() },
            async { store.save(&records[1]).await.unwrap() },
            async { store.save(&records[2]).await.unwrap() },
        );

        let reopened = FileSagaStore::open(dir.path()).unwrap();
        assert_eq!(reopened.list().unwrap().len(), 3);
        for record in &records {
            assert_eq!(reopened.load(record.saga_id).unwrap().as_ref(), Some(record));
        }
    }

    #[test]
    fn test_file_store_skips_garbage() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = FileSagaStore::open(dir.path()).unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
