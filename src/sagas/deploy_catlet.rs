use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::commands::{
    project_of, CreateCatletCommand, DeployCatletCommand, UpdateCatletCommand, CREATE_CATLET,
    DEPLOY_CATLET, UPDATE_CATLET,
};
use crate::error::SagaError;
use crate::saga::{Saga, SagaContext, SagaData, Step, TaskRequest, TaskStatusEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeployCatletState {
    Routed,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeployCatletData {
    name: String,
    project: String,
    /// `CreateCatlet` or `UpdateCatlet`.
    routed_to: String,
}

impl SagaData for DeployCatletData {
    type State = DeployCatletState;

    fn state(&self) -> DeployCatletState {
        DeployCatletState::Routed
    }
}

/// Create-or-update: a config whose name already exists in its project
/// updates that catlet, otherwise a new one is created.
pub struct DeployCatletSaga;

#[async_trait]
impl Saga for DeployCatletSaga {
    const SAGA_TYPE: &'static str = "DeployCatlet";
    const INITIATED_BY: &'static str = DEPLOY_CATLET;
    const CORRELATES: &'static [&'static str] = &[CREATE_CATLET, UPDATE_CATLET];

    type Command = DeployCatletCommand;
    type Data = DeployCatletData;

    async fn initiated(
        &self,
        command: DeployCatletCommand,
        ctx: &SagaContext,
    ) -> Result<Step<DeployCatletData>, SagaError> {
        let config = command.config;
        config.validate().map_err(SagaError::InvalidConfig)?;
        let project = project_of(&config);
        let name = config.name.clone();

        let task = match ctx.inventory().find_catlet(&project, &name) {
            Some(existing) => TaskRequest::local(
                UPDATE_CATLET,
                &UpdateCatletCommand {
                    catlet_id: existing.id,
                    config,
                    specification: None,
                },
            )?,
            None => TaskRequest::local(CREATE_CATLET, &CreateCatletCommand { config })?,
        };
        info!(catlet = %name, project = %project, route = %task.command_type, "deploying catlet");
        Ok(Step::dispatch(
            DeployCatletData {
                name,
                project,
                routed_to: task.command_type.clone(),
            },
            task,
        ))
    }

    async fn handle(
        &self,
        data: DeployCatletData,
        event: &TaskStatusEvent,
        _ctx: &SagaContext,
    ) -> Result<Step<DeployCatletData>, SagaError> {
        if event.command_type != data.routed_to {
            return Err(super::unexpected_event(event));
        }
        let result: Value = event.result()?;
        Step::complete(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{
        CREATE_CATLET_VM, PREPARE_GENE, UPDATE_CATLET_NETWORKS, UPDATE_CATLET_VM,
        UPDATE_CONFIG_DRIVE,
    };
    use crate::error::ErrorKind;
    use crate::inventory::{CatletRecord, Inventory, OperationStatus};
    use crate::test_support::{Harness, MockGenePool};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    async fn converge(h: &Harness) {
        for step in [UPDATE_CATLET_VM, UPDATE_CATLET_NETWORKS, UPDATE_CONFIG_DRIVE] {
            let cmd = h.take_one(step);
            h.reply(&cmd, json!({})).await;
        }
    }

    #[tokio::test]
    async fn test_new_name_creates() {
        let h = Harness::new(MockGenePool::new(), &["hv-1"]);
        let op = h
            .submit(DEPLOY_CATLET, json!({"config": {"name": "web"}}))
            .await;

        let vm = h.take_one(CREATE_CATLET_VM);
        h.reply(&vm, json!({"vm_id": "vm-1"})).await;
        converge(&h).await;

        let OperationStatus::Completed { result } = h.status(op) else {
            panic!("deploy did not complete");
        };
        assert_eq!(result["vm_id"], "vm-1");
        assert!(h.inventory.find_catlet("default", "web").is_some());
    }

    #[tokio::test]
    async fn test_existing_name_updates() {
        let h = Harness::new(MockGenePool::new(), &["hv-1"]);
        let catlet_id = Uuid::new_v4();
        h.inventory.save_catlet(CatletRecord {
            id: catlet_id,
            name: "web".to_string(),
            project: "prod".to_string(),
            agent: "hv-2".to_string(),
            vm_id: "vm-9".to_string(),
            config: Default::default(),
            genes: Vec::new(),
            disks: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

        let op = h
            .submit(
                DEPLOY_CATLET,
                json!({"config": {"name": "web", "project": "prod", "cpu": {"count": 4}}}),
            )
            .await;
        let vm = h.take_one(UPDATE_CATLET_VM);
        assert_eq!(vm.agent, "hv-2");
        assert_eq!(vm.payload["config"]["cpu"]["count"], 4);
        h.reply(&vm, json!({})).await;
        for step in [UPDATE_CATLET_NETWORKS, UPDATE_CONFIG_DRIVE] {
            let cmd = h.take_one(step);
            h.reply(&cmd, json!({})).await;
        }

        let OperationStatus::Completed { result } = h.status(op) else {
            panic!("deploy did not complete");
        };
        assert_eq!(result["catlet_id"], json!(catlet_id));
        assert_eq!(result["vm_id"], "vm-9");
    }

    #[tokio::test]
    async fn test_nested_failure_keeps_its_kind() {
        let pool = MockGenePool::new();
        let h = Harness::new(pool, &["hv-1"]);
        let op = h
            .submit(
                DEPLOY_CATLET,
                json!({"config": {"name": "web", "parent": "acme/missing"}}),
            )
            .await;

        match h.status(op) {
            OperationStatus::Failed { failure } => {
                assert_eq!(failure.kind, ErrorKind::GeneResolutionFailed)
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(h.take().iter().all(|c| c.command != PREPARE_GENE));
    }
}
