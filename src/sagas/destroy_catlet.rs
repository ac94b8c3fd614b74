use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{out_of_order, unexpected_event};
use crate::commands::{
    DestroyCatletCommand, DestroyCatletResult, DestroyResourcesCommand, RemoveCatletVmCommand,
    DESTROY_CATLET, DESTROY_RESOURCES, REMOVE_CATLET_VM,
};
use crate::error::SagaError;
use crate::inventory::{CatletRecord, DiskRecord};
use crate::saga::{Saga, SagaContext, SagaData, Step, TaskRequest, TaskStatusEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DestroyCatletState {
    Initiated,
    VmRemoved,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum DestroyCatletData {
    Initiated { catlet: CatletRecord },
    /// The VM is gone; its disks are detached and still on disk.
    VmRemoved {
        catlet_id: Uuid,
        disks: Vec<DiskRecord>,
    },
}

impl SagaData for DestroyCatletData {
    type State = DestroyCatletState;

    fn state(&self) -> DestroyCatletState {
        match self {
            DestroyCatletData::Initiated { .. } => DestroyCatletState::Initiated,
            DestroyCatletData::VmRemoved { .. } => DestroyCatletState::VmRemoved,
        }
    }
}

fn destroyed(catlet_id: Uuid, disks: &[DiskRecord]) -> Result<Step<DestroyCatletData>, SagaError> {
    Step::complete(&DestroyCatletResult {
        catlet_id,
        removed: true,
        disks: disks.iter().map(|d| d.id).collect(),
    })
}

/// Removes a catlet's VM, forgets the catlet and then destroys its disks.
/// Disks that cannot be removed end up in the inventory's cleanup queue.
pub struct DestroyCatletSaga;

#[async_trait]
impl Saga for DestroyCatletSaga {
    const SAGA_TYPE: &'static str = "DestroyCatlet";
    const INITIATED_BY: &'static str = DESTROY_CATLET;
    const CORRELATES: &'static [&'static str] = &[REMOVE_CATLET_VM, DESTROY_RESOURCES];

    type Command = DestroyCatletCommand;
    type Data = DestroyCatletData;

    async fn initiated(
        &self,
        command: DestroyCatletCommand,
        ctx: &SagaContext,
    ) -> Result<Step<DestroyCatletData>, SagaError> {
        let Some(catlet) = ctx.inventory().get_catlet(command.catlet_id) else {
            info!(catlet_id = %command.catlet_id, "catlet already gone");
            return Step::complete(&DestroyCatletResult {
                catlet_id: command.catlet_id,
                removed: false,
                disks: Vec::new(),
            });
        };
        let task = TaskRequest::to_agent(
            &catlet.agent,
            REMOVE_CATLET_VM,
            &RemoveCatletVmCommand {
                vm_id: catlet.vm_id.clone(),
            },
        )?;
        Ok(Step::dispatch(DestroyCatletData::Initiated { catlet }, task))
    }

    async fn handle(
        &self,
        data: DestroyCatletData,
        event: &TaskStatusEvent,
        ctx: &SagaContext,
    ) -> Result<Step<DestroyCatletData>, SagaError> {
        match event.command_type.as_str() {
            REMOVE_CATLET_VM => {
                if data.reached(DestroyCatletState::VmRemoved) {
                    return Ok(Step::Unchanged);
                }
                let DestroyCatletData::Initiated { catlet } = data else {
                    return Err(out_of_order(event));
                };
                ctx.inventory().remove_catlet(catlet.id).await?;
                info!(catlet_id = %catlet.id, vm_id = %catlet.vm_id, "catlet vm removed");
                if catlet.disks.is_empty() {
                    return destroyed(catlet.id, &catlet.disks);
                }

                let task = TaskRequest::local(
                    DESTROY_RESOURCES,
                    &DestroyResourcesCommand {
                        disks: catlet.disks.clone(),
                    },
                )?;
                Ok(Step::dispatch(
                    DestroyCatletData::VmRemoved {
                        catlet_id: catlet.id,
                        disks: catlet.disks,
                    },
                    task,
                ))
            }
            DESTROY_RESOURCES => {
                let DestroyCatletData::VmRemoved { catlet_id, disks } = data else {
                    return Err(out_of_order(event));
                };
                destroyed(catlet_id, &disks)
            }
            _ => Err(unexpected_event(event)),
        }
    }
}
