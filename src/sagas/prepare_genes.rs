use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::commands::{
    PrepareGeneCommand, PrepareGeneResult, PrepareGenesCommand, PreparedGenes, PREPARE_GENE,
    PREPARE_GENES,
};
use crate::error::SagaError;
use crate::genes::UniqueGeneIdentifier;
use crate::inventory::GeneRecord;
use crate::saga::{Saga, SagaContext, SagaData, Step, TaskId, TaskRequest, TaskStatusEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PrepareGenesState {
    Preparing,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrepareGenesData {
    agent: String,
    requested: Vec<UniqueGeneIdentifier>,
    /// Outstanding `PrepareGene` tasks and the gene each one carries.
    pending: BTreeMap<TaskId, UniqueGeneIdentifier>,
}

impl SagaData for PrepareGenesData {
    type State = PrepareGenesState;

    fn state(&self) -> PrepareGenesState {
        PrepareGenesState::Preparing
    }
}

/// Fans out one `PrepareGene` per required gene and completes once every gene
/// is reported present, in whatever order the agent answers.
pub struct PrepareGenesSaga;

#[async_trait]
impl Saga for PrepareGenesSaga {
    const SAGA_TYPE: &'static str = "PrepareGenes";
    const INITIATED_BY: &'static str = PREPARE_GENES;
    const CORRELATES: &'static [&'static str] = &[PREPARE_GENE];

    type Command = PrepareGenesCommand;
    type Data = PrepareGenesData;

    async fn initiated(
        &self,
        command: PrepareGenesCommand,
        _ctx: &SagaContext,
    ) -> Result<Step<PrepareGenesData>, SagaError> {
        let mut seen = BTreeSet::new();
        let requested: Vec<UniqueGeneIdentifier> = command
            .genes
            .into_iter()
            .filter(|gene| seen.insert(gene.clone()))
            .collect();
        if requested.is_empty() {
            return Step::complete(&PreparedGenes {
                agent: command.agent,
                genes: requested,
            });
        }

        let mut pending = BTreeMap::new();
        let mut tasks = Vec::with_capacity(requested.len());
        for gene in &requested {
            let task = TaskRequest::to_agent(
                &command.agent,
                PREPARE_GENE,
                &PrepareGeneCommand { gene: gene.clone() },
            )?;
            pending.insert(task.task_id, gene.clone());
            tasks.push(task);
        }
        debug!(agent = %command.agent, genes = requested.len(), "preparing genes");
        Ok(Step::dispatch_all(
            PrepareGenesData {
                agent: command.agent,
                requested,
                pending,
            },
            tasks,
        ))
    }

    async fn handle(
        &self,
        mut data: PrepareGenesData,
        event: &TaskStatusEvent,
        ctx: &SagaContext,
    ) -> Result<Step<PrepareGenesData>, SagaError> {
        let Some(gene) = data.pending.remove(&event.initiating_task_id) else {
            return Ok(Step::Unchanged);
        };
        let prepared: PrepareGeneResult = event.result()?;
        if prepared.gene != gene {
            warn!(
                task_id = %event.initiating_task_id,
                expected = %gene,
                reported = %prepared.gene,
                "agent reported a different gene for task"
            );
        }
        ctx.inventory().add_gene(GeneRecord {
            gene,
            agent: data.agent.clone(),
            size: prepared.size,
            last_seen: Utc::now(),
        })
        .await?;

        if data.pending.is_empty() {
            return Step::complete(&PreparedGenes {
                agent: data.agent,
                genes: data.requested,
            });
        }
        Ok(Step::wait(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::genes::Architecture;
    use crate::inventory::{Inventory, OperationStatus};
    use crate::saga::SagaStore;
    use crate::test_support::{Harness, MockGenePool};
    use serde_json::json;

    fn genes() -> Vec<UniqueGeneIdentifier> {
        vec![
            UniqueGeneIdentifier::catlet("acme/base/1.0".parse().unwrap(), Architecture::Any),
            UniqueGeneIdentifier::new(
                crate::genes::GeneType::Volume,
                "gene:acme/base/1.0:sda".parse().unwrap(),
                Architecture::Any,
            ),
        ]
    }

    async fn run(reverse: bool) -> (Harness, OperationStatus) {
        let h = Harness::new(MockGenePool::new(), &["hv-1"]);
        let op = h
            .submit(PREPARE_GENES, json!({"agent": "hv-1", "genes": genes()}))
            .await;
        let mut sent = h.take();
        assert_eq!(sent.len(), 2);
        if reverse {
            sent.reverse();
        }
        for cmd in &sent {
            assert_eq!(cmd.agent, "hv-1");
            let gene = cmd.payload["gene"].clone();
            h.reply(cmd, json!({"gene": gene, "size": 10})).await;
        }
        let status = h.status(op);
        (h, status)
    }

    #[tokio::test]
    async fn test_completes_in_any_order() {
        let (_, forward) = run(false).await;
        let (h, backward) = run(true).await;
        assert_eq!(forward, backward);
        assert_eq!(
            forward,
            OperationStatus::Completed {
                result: json!({"agent": "hv-1", "genes": genes()})
            }
        );
        assert_eq!(h.inventory.genes("hv-1").len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_report_is_ignored() {
        let h = Harness::new(MockGenePool::new(), &["hv-1"]);
        let op = h
            .submit(PREPARE_GENES, json!({"agent": "hv-1", "genes": genes()}))
            .await;
        let sent = h.take();
        let gene = sent[0].payload["gene"].clone();
        h.reply(&sent[0], json!({"gene": gene})).await;
        h.reply(&sent[0], json!({"gene": gene})).await;

        assert_eq!(h.status(op), OperationStatus::Running);
        assert_eq!(h.engine.metrics().duplicates_ignored, 1);
        assert!(h.take().is_empty());
    }

    #[tokio::test]
    async fn test_join_follows_tasks_not_echoed_gene() {
        let h = Harness::new(MockGenePool::new(), &["hv-1"]);
        let op = h
            .submit(PREPARE_GENES, json!({"agent": "hv-1", "genes": genes()}))
            .await;
        let sent = h.take();
        assert_eq!(sent.len(), 2);
        let first = sent[0].payload["gene"].clone();
        for cmd in &sent {
            h.reply(cmd, json!({ "gene": first })).await;
        }

        assert!(matches!(h.status(op), OperationStatus::Completed { .. }));
        let mut recorded: Vec<_> = h.inventory.genes("hv-1").into_iter().map(|g| g.gene).collect();
        recorded.sort();
        let mut expected = genes();
        expected.sort();
        assert_eq!(recorded, expected);
        assert!(h.store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_to_prepare() {
        let h = Harness::new(MockGenePool::new(), &["hv-1"]);
        let op = h
            .submit(PREPARE_GENES, json!({"agent": "hv-1", "genes": []}))
            .await;
        assert!(matches!(h.status(op), OperationStatus::Completed { .. }));
        assert!(h.take().is_empty());
    }

    #[tokio::test]
    async fn test_gene_failure_fails_saga() {
        let h = Harness::new(MockGenePool::new(), &["hv-1"]);
        let op = h
            .submit(PREPARE_GENES, json!({"agent": "hv-1", "genes": genes()}))
            .await;
        let sent = h.take();
        h.reject(&sent[1], "download failed").await;

        match h.status(op) {
            OperationStatus::Failed { failure } => {
                assert_eq!(failure.kind, ErrorKind::AgentCommandFailed);
                assert_eq!(failure.message, "agent command 'PrepareGene' failed: download failed");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // A late success for the other gene finds no saga.
        h.reply(&sent[0], json!({"gene": sent[0].payload["gene"].clone()})).await;
        assert_eq!(h.engine.metrics().unmatched_events, 1);
    }
}
