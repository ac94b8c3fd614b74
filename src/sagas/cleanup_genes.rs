use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::commands::{
    CleanupGenesCommand, RemoveGenesCommand, RemovedGenes, CLEANUP_GENES, REMOVE_GENES,
};
use crate::error::SagaError;
use crate::genes::UniqueGeneIdentifier;
use crate::saga::{Saga, SagaContext, SagaData, Step, TaskId, TaskRequest, TaskStatusEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CleanupGenesState {
    Removing,
}

#[derive(Debug, Serialize, Deserialize)]
struct Removal {
    task_id: TaskId,
    gene: UniqueGeneIdentifier,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupGenesData {
    agent: String,
    /// Genes still to be looked at, in removal order.
    candidates: Vec<UniqueGeneIdentifier>,
    removed: Vec<UniqueGeneIdentifier>,
    in_flight: Removal,
}

impl SagaData for CleanupGenesData {
    type State = CleanupGenesState;

    fn state(&self) -> CleanupGenesState {
        CleanupGenesState::Removing
    }
}

/// Removes genes from an agent once no catlet on it uses them any more.
///
/// Genes go one at a time and each one is checked against the inventory
/// right before its removal is sent, so a catlet created meanwhile keeps
/// the genes it references.
pub struct CleanupGenesSaga;

/// Pops candidates until one is still unused and builds its removal task.
fn next_removal(
    agent: &str,
    candidates: &mut Vec<UniqueGeneIdentifier>,
    ctx: &SagaContext,
) -> Result<Option<(Removal, TaskRequest)>, SagaError> {
    while !candidates.is_empty() {
        let gene = candidates.remove(0);
        if !ctx.inventory().unused_genes(agent).contains(&gene) {
            debug!(agent = %agent, gene = %gene, "gene in use again, keeping it");
            continue;
        }
        let task = TaskRequest::to_agent(
            agent,
            REMOVE_GENES,
            &RemoveGenesCommand {
                genes: vec![gene.clone()],
            },
        )?;
        let removal = Removal {
            task_id: task.task_id,
            gene,
        };
        return Ok(Some((removal, task)));
    }
    Ok(None)
}

fn removed(
    agent: String,
    genes: Vec<UniqueGeneIdentifier>,
) -> Result<Step<CleanupGenesData>, SagaError> {
    info!(agent = %agent, genes = genes.len(), "unused genes removed");
    Step::complete(&RemovedGenes { agent, genes })
}

#[async_trait]
impl Saga for CleanupGenesSaga {
    const SAGA_TYPE: &'static str = "CleanupGenes";
    const INITIATED_BY: &'static str = CLEANUP_GENES;
    const CORRELATES: &'static [&'static str] = &[REMOVE_GENES];

    type Command = CleanupGenesCommand;
    type Data = CleanupGenesData;

    async fn initiated(
        &self,
        command: CleanupGenesCommand,
        ctx: &SagaContext,
    ) -> Result<Step<CleanupGenesData>, SagaError> {
        let mut candidates = ctx.inventory().unused_genes(&command.agent);
        match next_removal(&command.agent, &mut candidates, ctx)? {
            Some((in_flight, task)) => Ok(Step::dispatch(
                CleanupGenesData {
                    agent: command.agent,
                    candidates,
                    removed: Vec::new(),
                    in_flight,
                },
                task,
            )),
            None => removed(command.agent, Vec::new()),
        }
    }

    async fn handle(
        &self,
        mut data: CleanupGenesData,
        event: &TaskStatusEvent,
        ctx: &SagaContext,
    ) -> Result<Step<CleanupGenesData>, SagaError> {
        if event.initiating_task_id != data.in_flight.task_id {
            return Ok(Step::Unchanged);
        }
        ctx.inventory()
            .remove_gene(&data.agent, &data.in_flight.gene)
            .await?;
        data.removed.push(data.in_flight.gene.clone());

        match next_removal(&data.agent, &mut data.candidates, ctx)? {
            Some((in_flight, task)) => {
                data.in_flight = in_flight;
                Ok(Step::dispatch(data, task))
            }
            None => removed(data.agent, data.removed),
        }
    }
}
