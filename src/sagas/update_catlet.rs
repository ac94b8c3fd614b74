use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{out_of_order, unexpected_event};
use crate::catlet_config::CatletConfig;
use crate::commands::{
    CatletResult, PrepareGenesCommand, ResolveSpecificationCommand, UpdateCatletCommand,
    UpdateCatletNetworksCommand, UpdateCatletVmCommand, UpdateConfigDriveCommand, PREPARE_GENES,
    RESOLVE_CATLET_SPECIFICATION, UPDATE_CATLET, UPDATE_CATLET_NETWORKS, UPDATE_CATLET_VM,
    UPDATE_CONFIG_DRIVE,
};
use crate::error::SagaError;
use crate::saga::{Saga, SagaContext, SagaData, Step, TaskRequest, TaskStatusEvent};
use crate::specification::ResolvedSpecification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpdateCatletState {
    ConfigValidated,
    Resolved,
    GenesPrepared,
    VmUpdated,
    NetworksUpdated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTarget {
    catlet_id: Uuid,
    agent: String,
    vm_id: String,
    config: CatletConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum UpdateCatletData {
    ConfigValidated {
        target: UpdateTarget,
    },
    Resolved {
        target: UpdateTarget,
        specification: ResolvedSpecification,
    },
    GenesPrepared {
        target: UpdateTarget,
        specification: ResolvedSpecification,
    },
    VmUpdated {
        target: UpdateTarget,
        specification: ResolvedSpecification,
    },
    NetworksUpdated {
        target: UpdateTarget,
        specification: ResolvedSpecification,
    },
}

impl SagaData for UpdateCatletData {
    type State = UpdateCatletState;

    fn state(&self) -> UpdateCatletState {
        match self {
            UpdateCatletData::ConfigValidated { .. } => UpdateCatletState::ConfigValidated,
            UpdateCatletData::Resolved { .. } => UpdateCatletState::Resolved,
            UpdateCatletData::GenesPrepared { .. } => UpdateCatletState::GenesPrepared,
            UpdateCatletData::VmUpdated { .. } => UpdateCatletState::VmUpdated,
            UpdateCatletData::NetworksUpdated { .. } => UpdateCatletState::NetworksUpdated,
        }
    }
}

fn update_vm(target: &UpdateTarget, specification: &ResolvedSpecification) -> Result<TaskRequest, SagaError> {
    TaskRequest::to_agent(
        &target.agent,
        UPDATE_CATLET_VM,
        &UpdateCatletVmCommand {
            vm_id: target.vm_id.clone(),
            config: specification.config.clone(),
        },
    )
}

/// Converges an existing catlet to a new config: resolve, prepare genes, then
/// update the VM, its networks and its config drive in that order.
pub struct UpdateCatletSaga;

#[async_trait]
impl Saga for UpdateCatletSaga {
    const SAGA_TYPE: &'static str = "UpdateCatlet";
    const INITIATED_BY: &'static str = UPDATE_CATLET;
    const CORRELATES: &'static [&'static str] = &[
        RESOLVE_CATLET_SPECIFICATION,
        PREPARE_GENES,
        UPDATE_CATLET_VM,
        UPDATE_CATLET_NETWORKS,
        UPDATE_CONFIG_DRIVE,
    ];

    type Command = UpdateCatletCommand;
    type Data = UpdateCatletData;

    async fn initiated(
        &self,
        command: UpdateCatletCommand,
        ctx: &SagaContext,
    ) -> Result<Step<UpdateCatletData>, SagaError> {
        let catlet = ctx.inventory().get_catlet(command.catlet_id).ok_or_else(|| {
            SagaError::InvalidConfig(format!("catlet {} does not exist", command.catlet_id))
        })?;
        command.config.validate().map_err(SagaError::InvalidConfig)?;

        let target = UpdateTarget {
            catlet_id: catlet.id,
            agent: catlet.agent,
            vm_id: catlet.vm_id,
            config: command.config,
        };
        match command.specification {
            Some(specification) => {
                let task = update_vm(&target, &specification)?;
                Ok(Step::dispatch(
                    UpdateCatletData::GenesPrepared {
                        target,
                        specification,
                    },
                    task,
                ))
            }
            None => {
                let task = TaskRequest::local(
                    RESOLVE_CATLET_SPECIFICATION,
                    &ResolveSpecificationCommand {
                        config: target.config.clone(),
                        architecture: ctx.architecture(),
                    },
                )?;
                Ok(Step::dispatch(UpdateCatletData::ConfigValidated { target }, task))
            }
        }
    }

    async fn handle(
        &self,
        data: UpdateCatletData,
        event: &TaskStatusEvent,
        ctx: &SagaContext,
    ) -> Result<Step<UpdateCatletData>, SagaError> {
        match event.command_type.as_str() {
            RESOLVE_CATLET_SPECIFICATION => {
                if data.reached(UpdateCatletState::Resolved) {
                    return Ok(Step::Unchanged);
                }
                let UpdateCatletData::ConfigValidated { target } = data else {
                    return Err(out_of_order(event));
                };
                let specification: ResolvedSpecification = event.result()?;
                let task = TaskRequest::local(
                    PREPARE_GENES,
                    &PrepareGenesCommand {
                        agent: target.agent.clone(),
                        genes: specification.genes.clone(),
                    },
                )?;
                Ok(Step::dispatch(
                    UpdateCatletData::Resolved {
                        target,
                        specification,
                    },
                    task,
                ))
            }
            PREPARE_GENES => {
                if data.reached(UpdateCatletState::GenesPrepared) {
                    return Ok(Step::Unchanged);
                }
                let UpdateCatletData::Resolved {
                    target,
                    specification,
                } = data
                else {
                    return Err(out_of_order(event));
                };
                let task = update_vm(&target, &specification)?;
                Ok(Step::dispatch(
                    UpdateCatletData::GenesPrepared {
                        target,
                        specification,
                    },
                    task,
                ))
            }
            UPDATE_CATLET_VM => {
                if data.reached(UpdateCatletState::VmUpdated) {
                    return Ok(Step::Unchanged);
                }
                let UpdateCatletData::GenesPrepared {
                    target,
                    specification,
                } = data
                else {
                    return Err(out_of_order(event));
                };
                let task = TaskRequest::to_agent(
                    &target.agent,
                    UPDATE_CATLET_NETWORKS,
                    &UpdateCatletNetworksCommand {
                        vm_id: target.vm_id.clone(),
                        networks: specification.config.networks.clone(),
                    },
                )?;
                Ok(Step::dispatch(
                    UpdateCatletData::VmUpdated {
                        target,
                        specification,
                    },
                    task,
                ))
            }
            UPDATE_CATLET_NETWORKS => {
                if data.reached(UpdateCatletState::NetworksUpdated) {
                    return Ok(Step::Unchanged);
                }
                let UpdateCatletData::VmUpdated {
                    target,
                    specification,
                } = data
                else {
                    return Err(out_of_order(event));
                };
                let task = TaskRequest::to_agent(
                    &target.agent,
                    UPDATE_CONFIG_DRIVE,
                    &UpdateConfigDriveCommand {
                        vm_id: target.vm_id.clone(),
                        hostname: specification.config.name.clone(),
                        fodder: specification.config.fodder.clone(),
                        variables: specification.config.variables.clone(),
                    },
                )?;
                Ok(Step::dispatch(
                    UpdateCatletData::NetworksUpdated {
                        target,
                        specification,
                    },
                    task,
                ))
            }
            UPDATE_CONFIG_DRIVE => {
                let UpdateCatletData::NetworksUpdated {
                    target,
                    specification,
                } = data
                else {
                    return Err(out_of_order(event));
                };
                let mut record = ctx.inventory().get_catlet(target.catlet_id).ok_or_else(|| {
                    SagaError::SagaDataMissing(format!(
                        "catlet {} disappeared during update",
                        target.catlet_id
                    ))
                })?;
                record.config = specification.config;
                record.genes = specification.genes;
                record.updated_at = Utc::now();
                ctx.inventory().save_catlet(record).await?;

                info!(catlet_id = %target.catlet_id, agent = %target.agent, "catlet updated");
                Step::complete(&CatletResult {
                    catlet_id: target.catlet_id,
                    agent: target.agent,
                    vm_id: target.vm_id,
                })
            }
            _ => Err(unexpected_event(event)),
        }
    }
}
