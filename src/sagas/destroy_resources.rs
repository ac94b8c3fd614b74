use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

use crate::commands::{
    DestroyResourcesCommand, DestroyedResources, RemoveDiskCommand, RemoveDiskResult,
    DESTROY_RESOURCES, REMOVE_DISK,
};
use crate::error::{SagaError, SagaFailure};
use crate::inventory::DiskRecord;
use crate::saga::{Saga, SagaContext, SagaData, Step, TaskId, TaskRequest, TaskStatusEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DestroyResourcesState {
    Destroying,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DestroyResourcesData {
    requested: Vec<Uuid>,
    /// Outstanding `RemoveDisk` tasks and the disk each one removes.
    pending: BTreeMap<TaskId, DiskRecord>,
    /// Disks an agent refused to remove.
    #[serde(default)]
    failed: Vec<DiskRecord>,
    #[serde(default)]
    failure: Option<SagaFailure>,
}

impl SagaData for DestroyResourcesData {
    type State = DestroyResourcesState;

    fn state(&self) -> DestroyResourcesState {
        DestroyResourcesState::Destroying
    }
}

/// Join point: wait for every removal, then complete or hand the disks that
/// could not be removed to the cleanup queue and fail.
async fn settle(
    data: DestroyResourcesData,
    ctx: &SagaContext,
) -> Result<Step<DestroyResourcesData>, SagaError> {
    if !data.pending.is_empty() {
        return Ok(Step::wait(data));
    }
    let Some(failure) = data.failure else {
        return Step::complete(&DestroyedResources {
            disks: data.requested,
        });
    };
    warn!(disks = data.failed.len(), error = %failure, "disk removal failed, queued for cleanup");
    ctx.inventory().queue_disk_cleanup(data.failed).await?;
    Ok(Step::Fail(failure))
}

/// Removes a set of disks, each on the agent that holds it. A failed removal
/// does not abandon the others: the saga waits for all of them and queues
/// only the disks that are still there.
pub struct DestroyResourcesSaga;

#[async_trait]
impl Saga for DestroyResourcesSaga {
    const SAGA_TYPE: &'static str = "DestroyResources";
    const INITIATED_BY: &'static str = DESTROY_RESOURCES;
    const CORRELATES: &'static [&'static str] = &[REMOVE_DISK];

    type Command = DestroyResourcesCommand;
    type Data = DestroyResourcesData;

    async fn initiated(
        &self,
        command: DestroyResourcesCommand,
        _ctx: &SagaContext,
    ) -> Result<Step<DestroyResourcesData>, SagaError> {
        let mut pending = BTreeMap::new();
        let mut requested = Vec::new();
        let mut tasks = Vec::new();
        for disk in command.disks {
            if requested.contains(&disk.id) {
                continue;
            }
            let task = TaskRequest::to_agent(
                &disk.agent,
                REMOVE_DISK,
                &RemoveDiskCommand { disk: disk.clone() },
            )?;
            requested.push(disk.id);
            pending.insert(task.task_id, disk);
            tasks.push(task);
        }
        if tasks.is_empty() {
            return Step::complete(&DestroyedResources { disks: requested });
        }
        Ok(Step::dispatch_all(
            DestroyResourcesData {
                requested,
                pending,
                failed: Vec::new(),
                failure: None,
            },
            tasks,
        ))
    }

    async fn handle(
        &self,
        mut data: DestroyResourcesData,
        event: &TaskStatusEvent,
        ctx: &SagaContext,
    ) -> Result<Step<DestroyResourcesData>, SagaError> {
        let Some(disk) = data.pending.remove(&event.initiating_task_id) else {
            return Ok(Step::Unchanged);
        };
        let removed: RemoveDiskResult = event.result()?;
        if removed.disk_id != disk.id {
            warn!(
                task_id = %event.initiating_task_id,
                expected = %disk.id,
                reported = %removed.disk_id,
                "agent reported a different disk for task"
            );
        }
        settle(data, ctx).await
    }

    async fn task_failed(
        &self,
        mut data: DestroyResourcesData,
        event: &TaskStatusEvent,
        failure: SagaFailure,
        ctx: &SagaContext,
    ) -> Result<Step<DestroyResourcesData>, SagaError> {
        let Some(disk) = data.pending.remove(&event.initiating_task_id) else {
            return Ok(Step::Unchanged);
        };
        data.failed.push(disk);
        if data.failure.is_none() {
            data.failure = Some(failure);
        }
        settle(data, ctx).await
    }
}
