//! Saga runtime.
//!
//! A saga is a long-running, persisted state machine driven by status events
//! that answer the commands it dispatched. Saga definitions implement the typed
//! [`Saga`] trait; the [`engine::SagaEngine`] owns persistence, correlation and
//! dispatch so definitions never touch the store or the transport.

pub mod engine;
pub mod registry;
pub mod store;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ErrorKind, SagaError, SagaFailure};
use crate::genepool::GenePool;
use crate::genes::Architecture;
use crate::inventory::Inventory;

pub use engine::{EngineError, SagaEngine};
pub use registry::SagaRegistry;
pub use store::{FileSagaStore, MemorySagaStore, PendingTask, SagaRecord, SagaStore, StoreError};

pub type SagaId = Uuid;
pub type TaskId = Uuid;

/// Whoever waits for a saga's terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Requester {
    /// An external operation, tracked in the inventory.
    Operation { operation_id: Uuid },
    /// A parent saga that dispatched this saga's initiating command as a task.
    Saga { saga_id: SagaId, task_id: TaskId },
}

impl Requester {
    /// Key that serializes concurrent initiations for the same requester.
    pub(crate) fn lock_key(&self) -> Uuid {
        match self {
            Requester::Operation { operation_id } => *operation_id,
            Requester::Saga { task_id, .. } => *task_id,
        }
    }
}

/// A command a saga wants sent. `agent: None` targets a saga hosted by the
/// controller itself.
///
/// The task id is assigned when the request is built, so a saga that fans out
/// can remember which task carries which item and join on
/// `initiating_task_id` instead of on whatever the reply echoes back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub command_type: String,
    pub agent: Option<String>,
    pub payload: Value,
}

impl TaskRequest {
    pub fn to_agent(
        agent: &str,
        command_type: &str,
        payload: &impl Serialize,
    ) -> Result<Self, SagaError> {
        Ok(Self {
            task_id: Uuid::new_v4(),
            command_type: command_type.to_string(),
            agent: Some(agent.to_string()),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn local(command_type: &str, payload: &impl Serialize) -> Result<Self, SagaError> {
        Ok(Self {
            task_id: Uuid::new_v4(),
            command_type: command_type.to_string(),
            agent: None,
            payload: serde_json::to_value(payload)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded {
        #[serde(default)]
        result: Value,
    },
    Failed {
        message: String,
        /// Set when the failure comes from a nested saga. Agent failures
        /// leave it empty and are reported as `AgentCommandFailed`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
    },
}

/// Status event answering a previously dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusEvent {
    pub initiating_task_id: TaskId,
    pub command_type: String,
    pub outcome: TaskOutcome,
}

impl TaskStatusEvent {
    pub fn succeeded(task_id: TaskId, command_type: &str, result: Value) -> Self {
        Self {
            initiating_task_id: task_id,
            command_type: command_type.to_string(),
            outcome: TaskOutcome::Succeeded { result },
        }
    }

    pub fn failed(task_id: TaskId, command_type: &str, message: impl Into<String>) -> Self {
        Self {
            initiating_task_id: task_id,
            command_type: command_type.to_string(),
            outcome: TaskOutcome::Failed {
                message: message.into(),
                kind: None,
            },
        }
    }

    /// Decode the success payload.
    pub fn result<T: DeserializeOwned>(&self) -> Result<T, SagaError> {
        match &self.outcome {
            TaskOutcome::Succeeded { result } => Ok(serde_json::from_value(result.clone())?),
            TaskOutcome::Failed { .. } => Err(SagaError::SagaDataMissing(format!(
                "no result on failed {} event",
                self.command_type
            ))),
        }
    }

    /// The failure this event reports, if any.
    pub fn failure(&self) -> Option<SagaFailure> {
        match &self.outcome {
            TaskOutcome::Succeeded { .. } => None,
            TaskOutcome::Failed {
                message,
                kind: Some(kind),
            } => Some(SagaFailure::new(*kind, message.clone())),
            TaskOutcome::Failed {
                message,
                kind: None,
            } => Some(
                SagaError::AgentCommandFailed {
                    command: self.command_type.clone(),
                    message: message.clone(),
                }
                .into(),
            ),
        }
    }
}

/// Typed, persisted saga data. The state must only move forward.
pub trait SagaData: Serialize + DeserializeOwned + Send + Sync + 'static {
    type State: Ord + Copy + fmt::Debug + Send;

    fn state(&self) -> Self::State;

    /// True once `state` has been reached; handlers use it to ignore
    /// redelivered events.
    fn reached(&self, state: Self::State) -> bool {
        self.state() >= state
    }
}

/// Data of sagas that complete within their initiating step and are never
/// persisted.
#[derive(Debug, Serialize, Deserialize)]
pub enum NoData {}

impl SagaData for NoData {
    type State = ();

    fn state(&self) {
        match *self {}
    }
}

/// What a saga step decided.
#[derive(Debug)]
pub enum Step<D> {
    /// Nothing changes; used for redelivered or irrelevant events.
    Unchanged,
    /// Persist `data`, then send `dispatch`.
    Continue { data: D, dispatch: Vec<TaskRequest> },
    Complete(Value),
    Fail(SagaFailure),
}

impl<D> Step<D> {
    pub fn dispatch(data: D, task: TaskRequest) -> Self {
        Step::Continue {
            data,
            dispatch: vec![task],
        }
    }

    pub fn dispatch_all(data: D, tasks: Vec<TaskRequest>) -> Self {
        Step::Continue {
            data,
            dispatch: tasks,
        }
    }

    /// Persist `data` and keep waiting for outstanding tasks.
    pub fn wait(data: D) -> Self {
        Step::Continue {
            data,
            dispatch: Vec::new(),
        }
    }

    pub fn complete(result: &impl Serialize) -> Result<Self, SagaError> {
        Ok(Step::Complete(serde_json::to_value(result)?))
    }
}

/// Collaborators available to saga steps.
#[derive(Clone)]
pub struct SagaServices {
    pub gene_pool: Arc<dyn GenePool>,
    pub inventory: Arc<dyn Inventory>,
    /// Agents eligible for placement.
    pub agents: Vec<String>,
    pub architecture: Architecture,
}

/// Per-invocation context handed to a saga step.
#[derive(Clone)]
pub struct SagaContext {
    pub saga_id: SagaId,
    services: Arc<SagaServices>,
}

impl SagaContext {
    pub(crate) fn new(saga_id: SagaId, services: Arc<SagaServices>) -> Self {
        Self { saga_id, services }
    }

    pub fn gene_pool(&self) -> &dyn GenePool {
        self.services.gene_pool.as_ref()
    }

    pub fn inventory(&self) -> &dyn Inventory {
        self.services.inventory.as_ref()
    }

    pub fn agents(&self) -> &[String] {
        &self.services.agents
    }

    pub fn architecture(&self) -> Architecture {
        self.services.architecture
    }
}

/// A saga definition.
///
/// Every step returns `Err` to end the saga with a failure carrying the error's
/// kind and message. Redelivered events must be recognised through the
/// persisted state and answered with [`Step::Unchanged`].
#[async_trait]
pub trait Saga: Send + Sync + 'static {
    const SAGA_TYPE: &'static str;
    /// Command type that starts a new instance.
    const INITIATED_BY: &'static str;
    /// Event (command) types this saga reacts to.
    const CORRELATES: &'static [&'static str];

    type Command: DeserializeOwned + Send;
    type Data: SagaData;

    async fn initiated(
        &self,
        command: Self::Command,
        ctx: &SagaContext,
    ) -> Result<Step<Self::Data>, SagaError>;

    /// A dispatched task succeeded.
    async fn handle(
        &self,
        data: Self::Data,
        event: &TaskStatusEvent,
        ctx: &SagaContext,
    ) -> Result<Step<Self::Data>, SagaError>;

    /// A dispatched task failed. Fails the saga unless overridden.
    async fn task_failed(
        &self,
        data: Self::Data,
        event: &TaskStatusEvent,
        failure: SagaFailure,
        ctx: &SagaContext,
    ) -> Result<Step<Self::Data>, SagaError> {
        let _ = (data, event, ctx);
        Ok(Step::Fail(failure))
    }
}
