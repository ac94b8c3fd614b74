//! Inventory of catlets, genes and operation outcomes.
//!
//! Sagas only record final outcomes here through simple add/update/remove
//! calls; nothing in resolution or breeding reads from it. Reads are served
//! from memory. A [`LocalInventory`] opened on a directory writes every change
//! through to `inventory.json` before it becomes visible, so operation
//! outcomes and catlet records survive a restart alongside the saga store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::catlet_config::CatletConfig;
use crate::error::SagaFailure;
use crate::genes::UniqueGeneIdentifier;

pub type OperationId = Uuid;

const INVENTORY_FILE: &str = "inventory.json";

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub id: Uuid,
    pub name: String,
    pub agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatletRecord {
    pub id: Uuid,
    pub name: String,
    pub project: String,
    pub agent: String,
    pub vm_id: String,
    /// Effective (bred) config
    pub config: CatletConfig,
    pub genes: Vec<UniqueGeneIdentifier>,
    pub disks: Vec<DiskRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneRecord {
    pub gene: UniqueGeneIdentifier,
    pub agent: String,
    pub size: Option<u64>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed { result: serde_json::Value },
    Failed { failure: SagaFailure },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub status: OperationStatus,
    pub updated_at: DateTime<Utc>,
}

/// A catlet name claimed by a create that has not saved its record yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameReservation {
    pub project: String,
    pub name: String,
    pub catlet_id: Uuid,
}

/// Persisted state collaborator.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Store a catlet. Any name reservation held by the same id is dropped.
    async fn save_catlet(&self, record: CatletRecord) -> Result<(), InventoryError>;
    fn get_catlet(&self, id: Uuid) -> Option<CatletRecord>;
    fn find_catlet(&self, project: &str, name: &str) -> Option<CatletRecord>;
    async fn remove_catlet(&self, id: Uuid) -> Result<Option<CatletRecord>, InventoryError>;
    fn catlet_count(&self, agent: &str) -> usize;

    /// Claim `name` in `project` for `catlet_id`. `Ok(false)` when another
    /// catlet holds or has reserved the name.
    async fn reserve_catlet_name(
        &self,
        project: &str,
        name: &str,
        catlet_id: Uuid,
    ) -> Result<bool, InventoryError>;
    /// Give up a reservation held by `catlet_id`; anything else is left alone.
    async fn release_catlet_name(
        &self,
        project: &str,
        name: &str,
        catlet_id: Uuid,
    ) -> Result<(), InventoryError>;

    async fn add_gene(&self, record: GeneRecord) -> Result<(), InventoryError>;
    async fn remove_gene(
        &self,
        agent: &str,
        gene: &UniqueGeneIdentifier,
    ) -> Result<(), InventoryError>;
    fn genes(&self, agent: &str) -> Vec<GeneRecord>;
    /// Genes on `agent` that no catlet on that agent references.
    fn unused_genes(&self, agent: &str) -> Vec<UniqueGeneIdentifier>;

    async fn queue_disk_cleanup(&self, disks: Vec<DiskRecord>) -> Result<(), InventoryError>;
    fn pending_disk_cleanup(&self) -> Vec<DiskRecord>;

    async fn set_operation(
        &self,
        id: OperationId,
        status: OperationStatus,
    ) -> Result<(), InventoryError>;
    fn operation(&self, id: OperationId) -> Option<OperationRecord>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InventoryState {
    #[serde(default)]
    catlets: BTreeMap<Uuid, CatletRecord>,
    #[serde(default)]
    reservations: Vec<NameReservation>,
    #[serde(default)]
    genes: Vec<GeneRecord>,
    #[serde(default)]
    disk_cleanup: Vec<DiskRecord>,
    #[serde(default)]
    operations: BTreeMap<OperationId, OperationRecord>,
}

impl InventoryState {
    fn name_taken(&self, project: &str, name: &str, catlet_id: Uuid) -> bool {
        let by_catlet = self
            .catlets
            .values()
            .any(|c| c.project == project && c.name == name && c.id != catlet_id);
        let by_reservation = self
            .reservations
            .iter()
            .any(|r| r.project == project && r.name == name && r.catlet_id != catlet_id);
        by_catlet || by_reservation
    }
}

/// Inventory held in memory, optionally written through to a directory.
pub struct LocalInventory {
    state: Mutex<InventoryState>,
    file: Option<PathBuf>,
    /// Orders writers so the file always holds the latest state.
    writer: tokio::sync::Mutex<()>,
}

impl Default for LocalInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalInventory {
    /// Volatile inventory, for tests and single-shot runs.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InventoryState::default()),
            file: None,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Durable inventory under `dir`, loading whatever a previous run left.
    pub fn open(dir: &Path) -> Result<Self, InventoryError> {
        std::fs::create_dir_all(dir)?;
        let file = dir.join(INVENTORY_FILE);
        let state = match std::fs::read(&file) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => InventoryState::default(),
            Err(e) => return Err(e.into()),
        };
        info!(
            path = %file.display(),
            catlets = state.catlets.len(),
            operations = state.operations.len(),
            "inventory opened"
        );
        Ok(Self {
            state: Mutex::new(state),
            file: Some(file),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    fn state(&self) -> MutexGuard<'_, InventoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change`, persisting the result first when file backed.
    async fn update<R>(
        &self,
        change: impl FnOnce(&mut InventoryState) -> R,
    ) -> Result<R, InventoryError> {
        let Some(path) = &self.file else {
            return Ok(change(&mut self.state()));
        };
        let _writer = self.writer.lock().await;
        let mut next = InventoryState::clone(&self.state());
        let result = change(&mut next);

        let data = serde_json::to_vec_pretty(&next)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "inventory written");

        *self.state() = next;
        Ok(result)
    }
}

#[async_trait]
impl Inventory for LocalInventory {
    async fn save_catlet(&self, record: CatletRecord) -> Result<(), InventoryError> {
        self.update(|state| {
            state.reservations.retain(|r| r.catlet_id != record.id);
            state.catlets.insert(record.id, record);
        })
        .await
    }

    fn get_catlet(&self, id: Uuid) -> Option<CatletRecord> {
        self.state().catlets.get(&id).cloned()
    }

    fn find_catlet(&self, project: &str, name: &str) -> Option<CatletRecord> {
        self.state()
            .catlets
            .values()
            .find(|c| c.project == project && c.name == name)
            .cloned()
    }

    async fn remove_catlet(&self, id: Uuid) -> Result<Option<CatletRecord>, InventoryError> {
        self.update(|state| state.catlets.remove(&id)).await
    }

    fn catlet_count(&self, agent: &str) -> usize {
        self.state()
            .catlets
            .values()
            .filter(|c| c.agent == agent)
            .count()
    }

    async fn reserve_catlet_name(
        &self,
        project: &str,
        name: &str,
        catlet_id: Uuid,
    ) -> Result<bool, InventoryError> {
        // Check and claim happen in one update.
        self.update(|state| {
            if state.name_taken(project, name, catlet_id) {
                return false;
            }
            let held = state
                .reservations
                .iter()
                .any(|r| r.project == project && r.name == name && r.catlet_id == catlet_id);
            if !held {
                state.reservations.push(NameReservation {
                    project: project.to_string(),
                    name: name.to_string(),
                    catlet_id,
                });
            }
            true
        })
        .await
    }

    async fn release_catlet_name(
        &self,
        project: &str,
        name: &str,
        catlet_id: Uuid,
    ) -> Result<(), InventoryError> {
        self.update(|state| {
            state
                .reservations
                .retain(|r| !(r.project == project && r.name == name && r.catlet_id == catlet_id));
        })
        .await
    }

    async fn add_gene(&self, record: GeneRecord) -> Result<(), InventoryError> {
        self.update(|state| {
            match state
                .genes
                .iter_mut()
                .find(|g| g.agent == record.agent && g.gene == record.gene)
            {
                Some(existing) => *existing = record,
                None => state.genes.push(record),
            }
        })
        .await
    }

    async fn remove_gene(
        &self,
        agent: &str,
        gene: &UniqueGeneIdentifier,
    ) -> Result<(), InventoryError> {
        self.update(|state| {
            state
                .genes
                .retain(|g| !(g.agent == agent && &g.gene == gene));
        })
        .await
    }

    fn genes(&self, agent: &str) -> Vec<GeneRecord> {
        self.state()
            .genes
            .iter()
            .filter(|g| g.agent == agent)
            .cloned()
            .collect()
    }

    fn unused_genes(&self, agent: &str) -> Vec<UniqueGeneIdentifier> {
        let state = self.state();
        state
            .genes
            .iter()
            .filter(|g| g.agent == agent)
            .filter(|g| {
                !state
                    .catlets
                    .values()
                    .any(|c| c.agent == agent && c.genes.contains(&g.gene))
            })
            .map(|g| g.gene.clone())
            .collect()
    }

    async fn queue_disk_cleanup(&self, disks: Vec<DiskRecord>) -> Result<(), InventoryError> {
        self.update(|state| {
            for disk in disks {
                if !state.disk_cleanup.iter().any(|d| d.id == disk.id) {
                    state.disk_cleanup.push(disk);
                }
            }
        })
        .await
    }

    fn pending_disk_cleanup(&self) -> Vec<DiskRecord> {
        self.state().disk_cleanup.clone()
    }

    async fn set_operation(
        &self,
        id: OperationId,
        status: OperationStatus,
    ) -> Result<(), InventoryError> {
        self.update(|state| {
            state.operations.insert(
                id,
                OperationRecord {
                    id,
                    status,
                    updated_at: Utc::now(),
                },
            );
        })
        .await
    }

    fn operation(&self, id: OperationId) -> Option<OperationRecord> {
        self.state().operations.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genes::Architecture;
    use tempfile::tempdir;

    fn gene(set: &str) -> UniqueGeneIdentifier {
        UniqueGeneIdentifier::catlet(set.parse().unwrap(), Architecture::Any)
    }

    fn gene_record(gene: &UniqueGeneIdentifier) -> GeneRecord {
        GeneRecord {
            gene: gene.clone(),
            agent: "hv-1".to_string(),
            size: None,
            last_seen: Utc::now(),
        }
    }

    fn catlet(name: &str, agent: &str, genes: Vec<UniqueGeneIdentifier>) -> CatletRecord {
        CatletRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            project: "default".to_string(),
            agent: agent.to_string(),
            vm_id: format!("vm-{name}"),
            config: CatletConfig::default(),
            genes,
            disks: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_catlet_lookup() {
        let inventory = LocalInventory::new();
        let record = catlet("web", "hv-1", vec![]);
        let id = record.id;
        inventory.save_catlet(record).await.unwrap();

        assert!(inventory.get_catlet(id).is_some());
        assert_eq!(inventory.find_catlet("default", "web").unwrap().id, id);
        assert!(inventory.find_catlet("other", "web").is_none());
        assert_eq!(inventory.catlet_count("hv-1"), 1);
        assert_eq!(inventory.catlet_count("hv-2"), 0);

        assert!(inventory.remove_catlet(id).await.unwrap().is_some());
        assert!(inventory.get_catlet(id).is_none());
    }

    #[tokio::test]
    async fn test_unused_genes() {
        let inventory = LocalInventory::new();
        let used = gene("acme/base/1.0");
        let unused = gene("acme/old/0.9");
        for g in [&used, &unused] {
            inventory.add_gene(gene_record(g)).await.unwrap();
        }
        inventory
            .save_catlet(catlet("web", "hv-1", vec![used.clone()]))
            .await
            .unwrap();

        assert_eq!(inventory.unused_genes("hv-1"), vec![unused.clone()]);
        inventory.remove_gene("hv-1", &unused).await.unwrap();
        assert!(inventory.unused_genes("hv-1").is_empty());
        assert_eq!(inventory.genes("hv-1").len(), 1);
    }

    #[tokio::test]
    async fn test_disk_cleanup_queue_deduplicates() {
        let inventory = LocalInventory::new();
        let disk = DiskRecord {
            id: Uuid::new_v4(),
            name: "sda".to_string(),
            agent: "hv-1".to_string(),
        };
        inventory.queue_disk_cleanup(vec![disk.clone()]).await.unwrap();
        inventory.queue_disk_cleanup(vec![disk.clone()]).await.unwrap();
        assert_eq!(inventory.pending_disk_cleanup(), vec![disk]);
    }

    #[tokio::test]
    async fn test_operation_status() {
        let inventory = LocalInventory::new();
        let id = Uuid::new_v4();
        inventory
            .set_operation(id, OperationStatus::Running)
            .await
            .unwrap();
        assert_eq!(inventory.operation(id).unwrap().status, OperationStatus::Running);

        inventory
            .set_operation(
                id,
                OperationStatus::Completed {
                    result: serde_json::json!({"ok": true}),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            inventory.operation(id).unwrap().status,
            OperationStatus::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_name_reservation() {
        let inventory = LocalInventory::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(inventory.reserve_catlet_name("default", "web", first).await.unwrap());
        assert!(inventory.reserve_catlet_name("default", "web", first).await.unwrap());
        assert!(!inventory.reserve_catlet_name("default", "web", second).await.unwrap());
        assert!(inventory.reserve_catlet_name("other", "web", second).await.unwrap());

        // Releasing someone else's reservation does nothing.
        inventory.release_catlet_name("default", "web", second).await.unwrap();
        assert!(!inventory.reserve_catlet_name("default", "web", second).await.unwrap());

        inventory.release_catlet_name("default", "web", first).await.unwrap();
        assert!(inventory.reserve_catlet_name("default", "web", second).await.unwrap());
    }

    #[tokio::test]
    async fn test_saved_catlet_holds_its_name() {
        let inventory = LocalInventory::new();
        let record = catlet("web", "hv-1", vec![]);
        assert!(inventory.reserve_catlet_name("default", "web", record.id).await.unwrap());
        inventory.save_catlet(record.clone()).await.unwrap();

        assert!(!inventory
            .reserve_catlet_name("default", "web", Uuid::new_v4())
            .await
            .unwrap());
        inventory.remove_catlet(record.id).await.unwrap();
        assert!(inventory
            .reserve_catlet_name("default", "web", Uuid::new_v4())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_file_inventory_survives_reopen() {
        let dir = tempdir().unwrap();
        let record = catlet("web", "hv-1", vec![gene("acme/base/1.0")]);
        let operation = Uuid::new_v4();
        let disk = DiskRecord {
            id: Uuid::new_v4(),
            name: "sdb".to_string(),
            agent: "hv-1".to_string(),
        };
        {
            let inventory = LocalInventory::open(dir.path()).unwrap();
            inventory.save_catlet(record.clone()).await.unwrap();
            inventory.add_gene(gene_record(&gene("acme/base/1.0"))).await.unwrap();
            inventory
                .set_operation(operation, OperationStatus::Running)
                .await
                .unwrap();
            inventory.queue_disk_cleanup(vec![disk.clone()]).await.unwrap();
        }

        let reopened = LocalInventory::open(dir.path()).unwrap();
        assert_eq!(reopened.get_catlet(record.id), Some(record));
        assert_eq!(reopened.genes("hv-1").len(), 1);
        assert!(reopened.unused_genes("hv-1").is_empty());
        assert_eq!(
            reopened.operation(operation).map(|op| op.status),
            Some(OperationStatus::Running)
        );
        assert_eq!(reopened.pending_disk_cleanup(), vec![disk]);
    }

    #[test]
    fn test_corrupt_inventory_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(INVENTORY_FILE), "{not json").unwrap();
        assert!(LocalInventory::open(dir.path()).is_err());
    }
}
