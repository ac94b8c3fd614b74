use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{out_of_order, unexpected_event};
use crate::catlet_config::CatletConfig;
use crate::commands::{
    project_of, CatletResult, CreateCatletCommand, CreateCatletVmCommand, CreateCatletVmResult,
    PlaceCatletCommand, PlacementResult, PrepareGenesCommand, ResolveSpecificationCommand,
    UpdateCatletCommand, CREATE_CATLET, CREATE_CATLET_VM, PLACE_CATLET, PREPARE_GENES,
    RESOLVE_CATLET_SPECIFICATION, UPDATE_CATLET,
};
use crate::error::{SagaError, SagaFailure};
use crate::inventory::{CatletRecord, DiskRecord};
use crate::saga::{
    Saga, SagaContext, SagaData, Step, TaskRequest, TaskStatusEvent,
};
use crate::specification::ResolvedSpecification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CreateCatletState {
    ConfigValidated,
    Placed,
    Resolved,
    GenesResolved,
    Created,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    catlet_id: Uuid,
    project: String,
    config: CatletConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum CreateCatletData {
    ConfigValidated {
        request: CreateRequest,
    },
    Placed {
        request: CreateRequest,
        agent: String,
    },
    Resolved {
        request: CreateRequest,
        agent: String,
        specification: ResolvedSpecification,
    },
    GenesResolved {
        request: CreateRequest,
        agent: String,
        specification: ResolvedSpecification,
    },
    Created {
        request: CreateRequest,
        agent: String,
        vm_id: String,
    },
}

impl SagaData for CreateCatletData {
    type State = CreateCatletState;

    fn state(&self) -> CreateCatletState {
        match self {
            CreateCatletData::ConfigValidated { .. } => CreateCatletState::ConfigValidated,
            CreateCatletData::Placed { .. } => CreateCatletState::Placed,
            CreateCatletData::Resolved { .. } => CreateCatletState::Resolved,
            CreateCatletData::GenesResolved { .. } => CreateCatletState::GenesResolved,
            CreateCatletData::Created { .. } => CreateCatletState::Created,
        }
    }
}

impl CreateCatletData {
    fn request(&self) -> &CreateRequest {
        match self {
            CreateCatletData::ConfigValidated { request }
            | CreateCatletData::Placed { request, .. }
            | CreateCatletData::Resolved { request, .. }
            | CreateCatletData::GenesResolved { request, .. }
            | CreateCatletData::Created { request, .. } => request,
        }
    }
}

/// Frees the name claimed when the create started. Once the catlet is in
/// the inventory its record holds the name and this is a no-op.
async fn release_name(request: &CreateRequest, ctx: &SagaContext) {
    let released = ctx
        .inventory()
        .release_catlet_name(&request.project, &request.config.name, request.catlet_id)
        .await;
    if let Err(e) = released {
        warn!(catlet = %request.config.name, error = %e, "failed to release catlet name");
    }
}

/// Creates a catlet: place it, resolve its specification, prepare genes on
/// the chosen agent, create the VM, then hand over to `UpdateCatlet` to apply
/// networks and the config drive.
///
/// The catlet name is reserved in the inventory when the config is
/// validated and released again if the saga fails.
pub struct CreateCatletSaga;

#[async_trait]
impl Saga for CreateCatletSaga {
    const SAGA_TYPE: &'static str = "CreateCatlet";
    const INITIATED_BY: &'static str = CREATE_CATLET;
    const CORRELATES: &'static [&'static str] = &[
        PLACE_CATLET,
        RESOLVE_CATLET_SPECIFICATION,
        PREPARE_GENES,
        CREATE_CATLET_VM,
        UPDATE_CATLET,
    ];

    type Command = CreateCatletCommand;
    type Data = CreateCatletData;

    async fn initiated(
        &self,
        command: CreateCatletCommand,
        ctx: &SagaContext,
    ) -> Result<Step<CreateCatletData>, SagaError> {
        let config = command.config;
        config.validate().map_err(SagaError::InvalidConfig)?;
        let project = project_of(&config);
        if let Some(existing) = ctx.inventory().find_catlet(&project, &config.name) {
            return Err(SagaError::InvalidConfig(format!(
                "catlet '{}' already exists in project '{}' as {}",
                config.name, project, existing.id
            )));
        }

        let task = TaskRequest::local(
            PLACE_CATLET,
            &PlaceCatletCommand {
                name: config.name.clone(),
            },
        )?;
        let catlet_id = Uuid::new_v4();
        if !ctx
            .inventory()
            .reserve_catlet_name(&project, &config.name, catlet_id)
            .await?
        {
            return Err(SagaError::InvalidConfig(format!(
                "catlet '{}' is already being created in project '{}'",
                config.name, project
            )));
        }
        let request = CreateRequest {
            catlet_id,
            project,
            config,
        };
        Ok(Step::dispatch(CreateCatletData::ConfigValidated { request }, task))
    }

    async fn handle(
        &self,
        data: CreateCatletData,
        event: &TaskStatusEvent,
        ctx: &SagaContext,
    ) -> Result<Step<CreateCatletData>, SagaError> {
        let request = data.request().clone();
        let step = self.advance(data, event, ctx).await;
        if matches!(step, Err(_) | Ok(Step::Fail(_))) {
            release_name(&request, ctx).await;
        }
        step
    }

    async fn task_failed(
        &self,
        data: CreateCatletData,
        _event: &TaskStatusEvent,
        failure: SagaFailure,
        ctx: &SagaContext,
    ) -> Result<Step<CreateCatletData>, SagaError> {
        release_name(data.request(), ctx).await;
        Ok(Step::Fail(failure))
    }
}

impl CreateCatletSaga {
    async fn advance(
        &self,
        data: CreateCatletData,
        event: &TaskStatusEvent,
        ctx: &SagaContext,
    ) -> Result<Step<CreateCatletData>, SagaError> {
        match event.command_type.as_str() {
            PLACE_CATLET => {
                if data.reached(CreateCatletState::Placed) {
                    return Ok(Step::Unchanged);
                }
                let CreateCatletData::ConfigValidated { request } = data else {
                    return Err(out_of_order(event));
                };
                let placement: PlacementResult = event.result()?;
                let task = TaskRequest::local(
                    RESOLVE_CATLET_SPECIFICATION,
                    &ResolveSpecificationCommand {
                        config: request.config.clone(),
                        architecture: ctx.architecture(),
                    },
                )?;
                Ok(Step::dispatch(
                    CreateCatletData::Placed {
                        request,
                        agent: placement.agent,
                    },
                    task,
                ))
            }
            RESOLVE_CATLET_SPECIFICATION => {
                if data.reached(CreateCatletState::Resolved) {
                    return Ok(Step::Unchanged);
                }
                let CreateCatletData::Placed { request, agent } = data else {
                    return Err(out_of_order(event));
                };
                let specification: ResolvedSpecification = event.result()?;
                let task = TaskRequest::local(
                    PREPARE_GENES,
                    &PrepareGenesCommand {
                        agent: agent.clone(),
                        genes: specification.genes.clone(),
                    },
                )?;
                Ok(Step::dispatch(
                    CreateCatletData::Resolved {
                        request,
                        agent,
                        specification,
                    },
                    task,
                ))
            }
            PREPARE_GENES => {
                if data.reached(CreateCatletState::GenesResolved) {
                    return Ok(Step::Unchanged);
                }
                let CreateCatletData::Resolved {
                    request,
                    agent,
                    specification,
                } = data
                else {
                    return Err(out_of_order(event));
                };
                let task = TaskRequest::to_agent(
                    &agent,
                    CREATE_CATLET_VM,
                    &CreateCatletVmCommand {
                        catlet_id: request.catlet_id,
                        config: specification.config.clone(),
                    },
                )?;
                Ok(Step::dispatch(
                    CreateCatletData::GenesResolved {
                        request,
                        agent,
                        specification,
                    },
                    task,
                ))
            }
            CREATE_CATLET_VM => {
                if data.reached(CreateCatletState::Created) {
                    return Ok(Step::Unchanged);
                }
                let CreateCatletData::GenesResolved {
                    request,
                    agent,
                    specification,
                } = data
                else {
                    return Err(out_of_order(event));
                };
                let created: CreateCatletVmResult = event.result()?;
                let now = Utc::now();
                ctx.inventory().save_catlet(CatletRecord {
                    id: request.catlet_id,
                    name: request.config.name.clone(),
                    project: request.project.clone(),
                    agent: agent.clone(),
                    vm_id: created.vm_id.clone(),
                    config: specification.config.clone(),
                    genes: specification.genes.clone(),
                    disks: created
                        .disks
                        .into_iter()
                        .map(|disk| DiskRecord {
                            id: disk.id,
                            name: disk.name,
                            agent: agent.clone(),
                        })
                        .collect(),
                    created_at: now,
                    updated_at: now,
                })
                .await?;

                let task = TaskRequest::local(
                    UPDATE_CATLET,
                    &UpdateCatletCommand {
                        catlet_id: request.catlet_id,
                        config: request.config.clone(),
                        specification: Some(specification),
                    },
                )?;
                Ok(Step::dispatch(
                    CreateCatletData::Created {
                        request,
                        agent,
                        vm_id: created.vm_id,
                    },
                    task,
                ))
            }
            UPDATE_CATLET => {
                let CreateCatletData::Created {
                    request,
                    agent,
                    vm_id,
                } = data
                else {
                    return Err(out_of_order(event));
                };
                info!(
                    catlet_id = %request.catlet_id,
                    catlet = %request.config.name,
                    agent = %agent,
                    "catlet created"
                );
                Step::complete(&CatletResult {
                    catlet_id: request.catlet_id,
                    agent,
                    vm_id,
                })
            }
            _ => Err(unexpected_event(event)),
        }
    }
}
