use async_trait::async_trait;
use tracing::debug;

use crate::commands::{PlaceCatletCommand, PlacementResult, PLACE_CATLET};
use crate::error::SagaError;
use crate::saga::{NoData, Saga, SagaContext, Step, TaskStatusEvent};

/// Picks the agent that hosts a new catlet: the configured agent with the
/// fewest catlets, ties broken by name.
pub struct PlaceCatletSaga;

#[async_trait]
impl Saga for PlaceCatletSaga {
    const SAGA_TYPE: &'static str = "PlaceCatlet";
    const INITIATED_BY: &'static str = PLACE_CATLET;
    const CORRELATES: &'static [&'static str] = &[];

    type Command = PlaceCatletCommand;
    type Data = NoData;

    async fn initiated(
        &self,
        command: PlaceCatletCommand,
        ctx: &SagaContext,
    ) -> Result<Step<NoData>, SagaError> {
        let inventory = ctx.inventory();
        let agent = ctx
            .agents()
            .iter()
            .map(|agent| (inventory.catlet_count(agent), agent))
            .min()
            .map(|(_, agent)| agent.clone())
            .ok_or_else(|| SagaError::InvalidConfig("no agents available for placement".to_string()))?;

        debug!(catlet = %command.name, agent = %agent, "catlet placed");
        Step::complete(&PlacementResult { agent })
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
