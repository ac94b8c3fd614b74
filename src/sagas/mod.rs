//! Controller sagas.
//!
//! Each saga drives one long-running operation by dispatching commands to
//! agents (or to other sagas) and reacting to their status events.

pub mod cleanup_genes;
pub mod create_catlet;
pub mod deploy_catlet;
pub mod destroy_catlet;
pub mod destroy_resources;
pub mod place_catlet;
pub mod prepare_genes;
pub mod resolve_specification;
pub mod update_catlet;

use crate::error::SagaError;
use crate::saga::{SagaRegistry, TaskStatusEvent};

pub use cleanup_genes::CleanupGenesSaga;
pub use create_catlet::CreateCatletSaga;
pub use deploy_catlet::DeployCatletSaga;
pub use destroy_catlet::DestroyCatletSaga;
pub use destroy_resources::DestroyResourcesSaga;
pub use place_catlet::PlaceCatletSaga;
pub use prepare_genes::PrepareGenesSaga;
pub use resolve_specification::ResolveCatletSpecificationSaga;
pub use update_catlet::UpdateCatletSaga;

/// Registry holding every saga the controller runs.
pub fn registry() -> SagaRegistry {
    SagaRegistry::new()
        .with(DeployCatletSaga)
        .with(CreateCatletSaga)
        .with(UpdateCatletSaga)
        .with(DestroyCatletSaga)
        .with(DestroyResourcesSaga)
        .with(PlaceCatletSaga)
        .with(ResolveCatletSpecificationSaga)
        .with(PrepareGenesSaga)
        .with(CleanupGenesSaga)
}

/// A result for a step the saga has not reached yet.
pub(crate) fn out_of_order(event: &TaskStatusEvent) -> SagaError {
    SagaError::SagaDataMissing(format!(
        "'{}' result arrived before its prerequisites",
        event.command_type
    ))
}

pub(crate) fn unexpected_event(event: &TaskStatusEvent) -> SagaError {
    SagaError::Internal(format!("no step handles '{}'", event.command_type))
}
