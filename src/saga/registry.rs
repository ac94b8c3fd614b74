use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

use super::engine::EngineError;
use super::{Saga, SagaContext, SagaData, Step, TaskRequest, TaskStatusEvent};
use crate::error::{SagaError, SagaFailure};

/// A saga step with the typed data already serialized.
#[derive(Debug)]
pub(crate) enum ErasedStep {
    Unchanged,
    Continue {
        state: String,
        data: Value,
        dispatch: Vec<TaskRequest>,
    },
    Complete(Value),
    Fail(SagaFailure),
}

/// Object-safe view of a [`Saga`], working on JSON data.
#[async_trait]
pub(crate) trait SagaHandler: Send + Sync {
    fn saga_type(&self) -> &'static str;
    fn initiated_by(&self) -> &'static str;

    async fn initiated(&self, payload: Value, ctx: &SagaContext) -> Result<ErasedStep, EngineError>;

    async fn handle(
        &self,
        data: Value,
        event: &TaskStatusEvent,
        ctx: &SagaContext,
    ) -> Result<ErasedStep, EngineError>;

    async fn task_failed(
        &self,
        data: Value,
        event: &TaskStatusEvent,
        failure: SagaFailure,
        ctx: &SagaContext,
    ) -> Result<ErasedStep, EngineError>;
}

struct TypedHandler<S: Saga> {
    saga: S,
}

impl<S: Saga> TypedHandler<S> {
    fn decode(data: Value) -> Result<S::Data, SagaError> {
        serde_json::from_value(data).map_err(|e| {
            SagaError::SagaDataMissing(format!("stored {} data is unreadable: {e}", S::SAGA_TYPE))
        })
    }

    /// Serialize a typed step, refusing any move to an earlier state.
    fn erase(
        previous: Option<<S::Data as SagaData>::State>,
        step: Result<Step<S::Data>, SagaError>,
    ) -> Result<ErasedStep, EngineError> {
        let step = match step {
            Ok(step) => step,
            Err(e) => return Ok(ErasedStep::Fail(e.into())),
        };
        Ok(match step {
            Step::Unchanged => ErasedStep::Unchanged,
            Step::Continue { data, dispatch } => {
                let state = data.state();
                if let Some(previous) = previous {
                    if state < previous {
                        return Err(EngineError::StateRegression {
                            saga_type: S::SAGA_TYPE.to_string(),
                            from: format!("{previous:?}"),
                            to: format!("{state:?}"),
                        });
                    }
                }
                match serde_json::to_value(&data) {
                    Ok(data) => ErasedStep::Continue {
                        state: format!("{state:?}"),
                        data,
                        dispatch,
                    },
                    Err(e) => ErasedStep::Fail(SagaError::from(e).into()),
                }
            }
            Step::Complete(result) => ErasedStep::Complete(result),
            Step::Fail(failure) => ErasedStep::Fail(failure),
        })
    }
}

#[async_trait]
impl<S: Saga> SagaHandler for TypedHandler<S> {
    fn saga_type(&self) -> &'static str {
        S::SAGA_TYPE
    }

    fn initiated_by(&self) -> &'static str {
        S::INITIATED_BY
    }

    async fn initiated(&self, payload: Value, ctx: &SagaContext) -> Result<ErasedStep, EngineError> {
        let command = match serde_json::from_value::<S::Command>(payload) {
            Ok(command) => command,
            Err(e) => {
                let error = SagaError::InvalidConfig(format!(
                    "malformed {} command: {e}",
                    S::INITIATED_BY
                ));
                return Ok(ErasedStep::Fail(error.into()));
            }
        };
        Self::erase(None, self.saga.initiated(command, ctx).await)
    }

    async fn handle(
        &self,
        data: Value,
        event: &TaskStatusEvent,
        ctx: &SagaContext,
    ) -> Result<ErasedStep, EngineError> {
        let data = match Self::decode(data) {
            Ok(data) => data,
            Err(e) => return Ok(ErasedStep::Fail(e.into())),
        };
        let previous = data.state();
        Self::erase(Some(previous), self.saga.handle(data, event, ctx).await)
    }

    async fn task_failed(
        &self,
        data: Value,
        event: &TaskStatusEvent,
        failure: SagaFailure,
        ctx: &SagaContext,
    ) -> Result<ErasedStep, EngineError> {
        let data = match Self::decode(data) {
            Ok(data) => data,
            Err(e) => return Ok(ErasedStep::Fail(e.into())),
        };
        let previous = data.state();
        Self::erase(
            Some(previous),
            self.saga.task_failed(data, event, failure, ctx).await,
        )
    }
}

/// Dispatch table from command and event types to saga definitions.
#[derive(Default)]
pub struct SagaRegistry {
    by_command: BTreeMap<&'static str, Arc<dyn SagaHandler>>,
    by_type: BTreeMap<&'static str, Arc<dyn SagaHandler>>,
    routes: BTreeSet<(&'static str, &'static str)>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a saga definition. A later registration for the same
    /// initiating command replaces the earlier one.
    pub fn register<S: Saga>(&mut self, saga: S) {
        let handler: Arc<dyn SagaHandler> = Arc::new(TypedHandler { saga });
        if self
            .by_command
            .insert(S::INITIATED_BY, handler.clone())
            .is_some()
        {
            warn!(command = S::INITIATED_BY, "replacing saga registration");
        }
        self.by_type.insert(S::SAGA_TYPE, handler);
        for event in S::CORRELATES {
            self.routes.insert((S::SAGA_TYPE, *event));
        }
        info!(saga_type = S::SAGA_TYPE, initiated_by = S::INITIATED_BY, "registering saga");
    }

    pub fn with<S: Saga>(mut self, saga: S) -> Self {
        self.register(saga);
        self
    }

    pub(crate) fn for_command(&self, command_type: &str) -> Option<Arc<dyn SagaHandler>> {
        self.by_command.get(command_type).cloned()
    }

    pub(crate) fn for_type(&self, saga_type: &str) -> Option<Arc<dyn SagaHandler>> {
        self.by_type.get(saga_type).cloned()
    }

    pub fn handles_command(&self, command_type: &str) -> bool {
        self.by_command.contains_key(command_type)
    }

    /// Whether `saga_type` reacts to events of `event_type`.
    pub fn accepts(&self, saga_type: &str, event_type: &str) -> bool {
        self.routes
            .iter()
            .any(|(saga, event)| *saga == saga_type && *event == event_type)
    }

    pub fn saga_types(&self) -> Vec<&'static str> {
        self.by_type.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum CountState {
        Low,
        High,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    impl SagaData for Counter {
        type State = CountState;

        fn state(&self) -> CountState {
            if self.value >= 10 {
                CountState::High
            } else {
                CountState::Low
            }
        }
    }

    #[derive(Deserialize)]
    struct Start {
        value: u32,
    }

    struct CounterSaga;

    #[async_trait]
    impl Saga for CounterSaga {
        const SAGA_TYPE: &'static str = "Counter";
        const INITIATED_BY: &'static str = "StartCounter";
        const CORRELATES: &'static [&'static str] = &["Tick"];

        type Command = Start;
        type Data = Counter;

        async fn initiated(
            &self,
            command: Start,
            _ctx: &SagaContext,
        ) -> Result<Step<Counter>, SagaError> {
            Ok(Step::wait(Counter {
                value: command.value,
            }))
        }

        async fn handle(
            &self,
            data: Counter,
            event: &TaskStatusEvent,
            _ctx: &SagaContext,
        ) -> Result<Step<Counter>, SagaError> {
            let value: u32 = event.result()?;
            if value == 0 {
                return Err(SagaError::Internal("zero".to_string()));
            }
            let _ = data;
            Ok(Step::wait(Counter { value }))
        }
    }

    fn ctx() -> SagaContext {
        crate::test_support::context()
    }

    #[test]
    fn test_routes() {
        let registry = SagaRegistry::new().with(CounterSaga);
        assert!(registry.handles_command("StartCounter"));
        assert!(!registry.handles_command("Tick"));
        assert!(registry.accepts("Counter", "Tick"));
        assert!(!registry.accepts("Counter", "Tock"));
        assert_eq!(registry.saga_types(), vec!["Counter"]);
    }

    #[tokio::test]
    async fn test_malformed_command_fails_saga() {
        let registry = SagaRegistry::new().with(CounterSaga);
        let handler = registry.for_command("StartCounter").unwrap();
        let step = handler
            .initiated(serde_json::json!({"wrong": true}), &ctx())
            .await
            .unwrap();
        match step {
            ErasedStep::Fail(failure) => assert_eq!(failure.kind, ErrorKind::InvalidConfig),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_forward_progress_is_serialized() {
        let registry = SagaRegistry::new().with(CounterSaga);
        let handler = registry.for_type("Counter").unwrap();
        let event = TaskStatusEvent::succeeded(uuid::Uuid::new_v4(), "Tick", serde_json::json!(12));
        let step = handler
            .handle(serde_json::json!({"value": 3}), &event, &ctx())
            .await
            .unwrap();
        match step {
            ErasedStep::Continue { state, data, .. } => {
                assert_eq!(state, "High");
                assert_eq!(data["value"], 12);
            }
            other => panic!("expected continue, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_state_regression_is_rejected() {
        let registry = SagaRegistry::new().with(CounterSaga);
        let handler = registry.for_type("Counter").unwrap();
        let event = TaskStatusEvent::succeeded(uuid::Uuid::new_v4(), "Tick", serde_json::json!(2));
        let err = handler
            .handle(serde_json::json!({"value": 11}), &event, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateRegression { .. }));
    }

    #[tokio::test]
    async fn test_step_error_becomes_failure() {
        let registry = SagaRegistry::new().with(CounterSaga);
        let handler = registry.for_type("Counter").unwrap();
        let event = TaskStatusEvent::succeeded(uuid::Uuid::new_v4(), "Tick", serde_json::json!(0));
        let step = handler
            .handle(serde_json::json!({"value": 1}), &event, &ctx())
            .await
            .unwrap();
        match step {
            ErasedStep::Fail(failure) => {
                assert_eq!(failure.kind, ErrorKind::Internal);
                assert_eq!(failure.message, "internal error: zero");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreadable_data_fails_saga() {
        let registry = SagaRegistry::new().with(CounterSaga);
        let handler = registry.for_type("Counter").unwrap();
        let event = TaskStatusEvent::succeeded(uuid::Uuid::new_v4(), "Tick", serde_json::json!(5));
        let step = handler
            .handle(serde_json::json!("garbage"), &event, &ctx())
            .await
            .unwrap();
        match step {
            ErasedStep::Fail(failure) => assert_eq!(failure.kind, ErrorKind::SagaDataMissing),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
