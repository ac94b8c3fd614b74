//! Command catalogue: the type names sagas are initiated by or dispatch, and
//! their payloads.
//!
//! Commands without an agent are handled by sagas hosted in the controller;
//! agent commands go out over the transport and come back as status events
//! carrying the same command type.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catlet_config::{CatletConfig, FodderConfig, NetworkConfig, VariableConfig};
use crate::genes::{Architecture, UniqueGeneIdentifier};
use crate::inventory::DiskRecord;
use crate::specification::ResolvedSpecification;

pub const CREATE_CATLET: &str = "CreateCatlet";
pub const UPDATE_CATLET: &str = "UpdateCatlet";
pub const DEPLOY_CATLET: &str = "DeployCatlet";
pub const DESTROY_CATLET: &str = "DestroyCatlet";
pub const DESTROY_RESOURCES: &str = "DestroyResources";
pub const PLACE_CATLET: &str = "PlaceCatlet";
pub const RESOLVE_CATLET_SPECIFICATION: &str = "ResolveCatletSpecification";
pub const PREPARE_GENES: &str = "PrepareGenes";
pub const CLEANUP_GENES: &str = "CleanupGenes";

// Agent commands
pub const PREPARE_GENE: &str = "PrepareGene";
pub const CREATE_CATLET_VM: &str = "CreateCatletVm";
pub const UPDATE_CATLET_VM: &str = "UpdateCatletVm";
pub const UPDATE_CATLET_NETWORKS: &str = "UpdateCatletNetworks";
pub const UPDATE_CONFIG_DRIVE: &str = "UpdateConfigDrive";
pub const REMOVE_CATLET_VM: &str = "RemoveCatletVm";
pub const REMOVE_DISK: &str = "RemoveDisk";
pub const REMOVE_GENES: &str = "RemoveGenes";

/// Project used when a config names none.
pub const DEFAULT_PROJECT: &str = "default";

pub fn project_of(config: &CatletConfig) -> String {
    config
        .project
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_PROJECT)
        .to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCatletCommand {
    pub config: CatletConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCatletCommand {
    pub catlet_id: Uuid,
    pub config: CatletConfig,
    /// Already resolved and prepared, e.g. by the create flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specification: Option<ResolvedSpecification>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployCatletCommand {
    pub config: CatletConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyCatletCommand {
    pub catlet_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyResourcesCommand {
    pub disks: Vec<DiskRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceCatletCommand {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveSpecificationCommand {
    pub config: CatletConfig,
    #[serde(default)]
    pub architecture: Architecture,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareGenesCommand {
    pub agent: String,
    pub genes: Vec<UniqueGeneIdentifier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupGenesCommand {
    pub agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareGeneCommand {
    pub gene: UniqueGeneIdentifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCatletVmCommand {
    pub catlet_id: Uuid,
    pub config: CatletConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCatletVmCommand {
    pub vm_id: String,
    pub config: CatletConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCatletNetworksCommand {
    pub vm_id: String,
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfigDriveCommand {
    pub vm_id: String,
    pub hostname: String,
    pub fodder: Vec<FodderConfig>,
    pub variables: Vec<VariableConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveCatletVmCommand {
    pub vm_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveDiskCommand {
    pub disk: DiskRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveGenesCommand {
    pub genes: Vec<UniqueGeneIdentifier>,
}

// Results

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementResult {
    pub agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareGeneResult {
    pub gene: UniqueGeneIdentifier,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedGenes {
    pub agent: String,
    pub genes: Vec<UniqueGeneIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDisk {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCatletVmResult {
    pub vm_id: String,
    #[serde(default)]
    pub disks: Vec<VmDisk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveDiskResult {
    pub disk_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatletResult {
    pub catlet_id: Uuid,
    pub agent: String,
    pub vm_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestroyedResources {
    pub disks: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestroyCatletResult {
    pub catlet_id: Uuid,
    /// False when the catlet was already gone.
    pub removed: bool,
    pub disks: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedGenes {
    pub agent: String,
    pub genes: Vec<UniqueGeneIdentifier>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project_defaults() {
        let mut config = CatletConfig::default();
        assert_eq!(project_of(&config), "default");
        config.project = Some("  ".to_string());
        assert_eq!(project_of(&config), "default");
        config.project = Some("infra".to_string());
        assert_eq!(project_of(&config), "infra");
    }

    #[test]
    fn test_update_command_without_specification() {
        let id = Uuid::new_v4();
        let cmd: UpdateCatletCommand =
            serde_json::from_value(json!({"catlet_id": id, "config": {"name": "web"}})).unwrap();
        assert_eq!(cmd.catlet_id, id);
        assert!(cmd.specification.is_none());
        let value = serde_json::to_value(&cmd).unwrap();
        assert!(value.get("specification").is_none());
    }

    #[test]
    fn test_vm_result_disks_default_empty() {
        let result: CreateCatletVmResult = serde_json::from_value(json!({"vm_id": "vm-1"})).unwrap();
        assert!(result.disks.is_empty());
    }
}
