use async_trait::async_trait;

use crate::commands::{ResolveSpecificationCommand, RESOLVE_CATLET_SPECIFICATION};
use crate::error::SagaError;
use crate::saga::{NoData, Saga, SagaContext, Step, TaskStatusEvent};
use crate::specification::resolve_specification;

/// Resolves and breeds a catlet config against the gene pool.
pub struct ResolveCatletSpecificationSaga;

#[async_trait]
impl Saga for ResolveCatletSpecificationSaga {
    const SAGA_TYPE: &'static str = "ResolveCatletSpecification";
    const INITIATED_BY: &'static str = RESOLVE_CATLET_SPECIFICATION;
    const CORRELATES: &'static [&'static str] = &[];

    type Command = ResolveSpecificationCommand;
    type Data = NoData;

    async fn initiated(
        &self,
        command: ResolveSpecificationCommand,
        ctx: &SagaContext,
    ) -> Result<Step<NoData>, SagaError> {
        let specification =
            resolve_specification(&command.config, command.architecture, ctx.gene_pool()).await?;
        Step::complete(&specification)
    }

    async fn handle(
        &self,
        data: NoData,
        _event: &TaskStatusEvent,
        _ctx: &SagaContext,
    ) -> Result<Step<NoData>, SagaError> {
        match data {}
    }
}
