//! Saga engine.
//!
//! Every inbound message (an initiating command or a task status event) is
//! processed to completion before the next one: work produced along the way,
//! such as nested sagas started by a local command or a finished child
//! reporting to its parent, goes through an internal queue instead of
//! recursion. Steps of one saga are serialized by a per-saga lock.

use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::registry::{ErasedStep, SagaHandler, SagaRegistry};
use super::store::{PendingTask, SagaRecord, SagaStore, StoreError};
use super::{Requester, SagaContext, SagaId, SagaServices, TaskId, TaskOutcome, TaskStatusEvent};
use crate::error::SagaFailure;
use crate::inventory::{InventoryError, OperationId, OperationStatus};
use crate::metrics::EngineMetrics;
use crate::mqtt::{AgentCommand, MessageTransport};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("saga store error: {0}")]
    Store(#[from] StoreError),
    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no saga is initiated by command '{0}'")]
    UnknownCommand(String),
    #[error("unknown saga type '{0}'")]
    UnknownSagaType(String),
    #[error("saga {saga_type} attempted to move from {from} back to {to}")]
    StateRegression {
        saga_type: String,
        from: String,
        to: String,
    },
}

enum Envelope {
    Initiate {
        command_type: String,
        payload: Value,
        requester: Requester,
    },
    Status(TaskStatusEvent),
}

pub struct SagaEngine {
    registry: SagaRegistry,
    store: Arc<dyn SagaStore>,
    transport: Arc<dyn MessageTransport>,
    services: Arc<SagaServices>,
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    metrics: StdMutex<EngineMetrics>,
}

impl SagaEngine {
    pub fn new(
        registry: SagaRegistry,
        store: Arc<dyn SagaStore>,
        transport: Arc<dyn MessageTransport>,
        services: SagaServices,
    ) -> Self {
        Self {
            registry,
            store,
            transport,
            services: Arc::new(services),
            locks: StdMutex::new(HashMap::new()),
            metrics: StdMutex::new(EngineMetrics::new()),
        }
    }

    pub fn registry(&self) -> &SagaRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start an operation. Redelivery of the same operation is a no-op.
    pub async fn submit(
        &self,
        operation_id: OperationId,
        command_type: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.initiate(command_type, payload, Requester::Operation { operation_id })
            .await
    }

    /// Create the saga initiated by `command_type` unless `requester` already
    /// owns one.
    pub async fn initiate(
        &self,
        command_type: &str,
        payload: Value,
        requester: Requester,
    ) -> Result<(), EngineError> {
        self.drain(VecDeque::from([Envelope::Initiate {
            command_type: command_type.to_string(),
            payload,
            requester,
        }]))
        .await
    }

    /// Route a status event to the saga that dispatched its task.
    pub async fn handle_event(&self, event: TaskStatusEvent) -> Result<(), EngineError> {
        self.drain(VecDeque::from([Envelope::Status(event)])).await
    }

    /// Re-send every outstanding task after a restart. Returns how many were
    /// sent again.
    pub async fn resume(&self) -> Result<usize, EngineError> {
        let records = self.store.list()?;
        let mut queue = VecDeque::new();
        let mut resent = 0;
        for record in &records {
            for (task_id, task) in &record.pending {
                if task.agent.is_none() {
                    let child = Requester::Saga {
                        saga_id: record.saga_id,
                        task_id: *task_id,
                    };
                    if self.store.find_by_requester(&child)?.is_some() {
                        continue;
                    }
                }
                match self
                    .send(record.saga_id, *task_id, task.clone(), &mut queue)
                    .await
                {
                    Ok(()) => resent += 1,
                    Err(e) => {
                        warn!(saga_id = %record.saga_id, task_id = %task_id, error = %e, "failed to re-send task")
                    }
                }
            }
        }
        info!(sagas = records.len(), resent, "saga engine resumed");
        self.drain(queue).await?;
        Ok(resent)
    }

    async fn drain(&self, mut queue: VecDeque<Envelope>) -> Result<(), EngineError> {
        let mut first_error = None;
        while let Some(envelope) = queue.pop_front() {
            let result = match envelope {
                Envelope::Initiate {
                    command_type,
                    payload,
                    requester,
                } => {
                    self.process_initiate(&command_type, payload, requester, &mut queue)
                        .await
                }
                Envelope::Status(event) => self.process_status(event, &mut queue).await,
            };
            if let Err(e) = result {
                error!(error = %e, "saga step failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn process_initiate(
        &self,
        command_type: &str,
        payload: Value,
        requester: Requester,
        queue: &mut VecDeque<Envelope>,
    ) -> Result<(), EngineError> {
        let handler = self
            .registry
            .for_command(command_type)
            .ok_or_else(|| EngineError::UnknownCommand(command_type.to_string()))?;

        let key = requester.lock_key();
        let lock = self.lock_for(key);
        let guard = lock.lock().await;
        let result = self.start(handler.as_ref(), payload, requester, queue).await;
        drop(guard);
        self.release(key);
        result
    }

    async fn start(
        &self,
        handler: &dyn SagaHandler,
        payload: Value,
        requester: Requester,
        queue: &mut VecDeque<Envelope>,
    ) -> Result<(), EngineError> {
        if let Some(existing) = self.store.find_by_requester(&requester)? {
            debug!(saga_id = %existing.saga_id, saga_type = %existing.saga_type, "saga already initiated");
            self.metric(EngineMetrics::record_duplicate);
            return Ok(());
        }
        if let Requester::Operation { operation_id } = &requester {
            let inventory = &self.services.inventory;
            match inventory.operation(*operation_id).map(|op| op.status) {
                Some(OperationStatus::Completed { .. }) | Some(OperationStatus::Failed { .. }) => {
                    debug!(operation_id = %operation_id, "operation already finished");
                    self.metric(EngineMetrics::record_duplicate);
                    return Ok(());
                }
                _ => {
                    inventory
                        .set_operation(*operation_id, OperationStatus::Running)
                        .await?
                }
            }
        }

        let saga_id = Uuid::new_v4();
        let ctx = SagaContext::new(saga_id, self.services.clone());
        let step = handler.initiated(payload, &ctx).await?;
        self.metric(EngineMetrics::record_started);
        info!(saga_type = handler.saga_type(), saga_id = %saga_id, "saga initiated");

        let record = SagaRecord::new(saga_id, handler.saga_type(), requester);
        self.apply(handler, record, step, queue).await
    }

    async fn process_status(
        &self,
        event: TaskStatusEvent,
        queue: &mut VecDeque<Envelope>,
    ) -> Result<(), EngineError> {
        let Some(found) = self.store.find_by_task(event.initiating_task_id)? else {
            debug!(task_id = %event.initiating_task_id, command_type = %event.command_type, "no saga waits for task");
            self.metric(EngineMetrics::record_unmatched);
            return Ok(());
        };

        let lock = self.lock_for(found.saga_id);
        let _guard = lock.lock().await;
        // Reload: the saga may have advanced or finished while we waited.
        let Some(mut record) = self.store.load(found.saga_id)? else {
            self.metric(EngineMetrics::record_unmatched);
            return Ok(());
        };
        let handler = self
            .registry
            .for_type(&record.saga_type)
            .ok_or_else(|| EngineError::UnknownSagaType(record.saga_type.clone()))?;
        if !self.registry.accepts(&record.saga_type, &event.command_type) {
            warn!(saga_type = %record.saga_type, command_type = %event.command_type, "saga does not handle event type");
            self.metric(EngineMetrics::record_unmatched);
            return Ok(());
        }
        self.metric(EngineMetrics::record_event);

        let ctx = SagaContext::new(record.saga_id, self.services.clone());
        let was_pending = record.pending.remove(&event.initiating_task_id).is_some();
        let step = match event.failure() {
            None => handler.handle(record.data.clone(), &event, &ctx).await?,
            Some(_) if !was_pending => {
                debug!(saga_id = %record.saga_id, task_id = %event.initiating_task_id, "ignoring failure of settled task");
                self.metric(EngineMetrics::record_duplicate);
                return Ok(());
            }
            Some(failure) => {
                handler
                    .task_failed(record.data.clone(), &event, failure, &ctx)
                    .await?
            }
        };

        if matches!(step, ErasedStep::Unchanged) {
            if was_pending {
                record.updated_at = Utc::now();
                self.store.save(&record).await?;
            } else {
                self.metric(EngineMetrics::record_duplicate);
            }
        }
        self.apply(handler.as_ref(), record, step, queue).await
    }

    async fn apply(
        &self,
        handler: &dyn SagaHandler,
        mut record: SagaRecord,
        step: ErasedStep,
        queue: &mut VecDeque<Envelope>,
    ) -> Result<(), EngineError> {
        match step {
            ErasedStep::Unchanged => {
                debug!(saga_id = %record.saga_id, state = %record.state, "saga unchanged");
                Ok(())
            }
            ErasedStep::Continue {
                state,
                data,
                dispatch,
            } => {
                record.state = state;
                record.data = data;
                record.updated_at = Utc::now();
                let tasks: Vec<(TaskId, PendingTask)> = dispatch
                    .into_iter()
                    .map(|task| (task.task_id, PendingTask::from(task)))
                    .collect();
                for (task_id, task) in &tasks {
                    record.pending.insert(*task_id, task.clone());
                    record.correlations.insert(*task_id);
                }
                self.store.save(&record).await?;
                debug!(
                    saga_id = %record.saga_id,
                    saga_type = %record.saga_type,
                    state = %record.state,
                    dispatched = tasks.len(),
                    "saga advanced"
                );
                for (task_id, task) in tasks {
                    self.send(record.saga_id, task_id, task, queue).await?;
                }
                Ok(())
            }
            ErasedStep::Complete(result) => {
                self.finish(handler, record, Ok(result), queue).await
            }
            ErasedStep::Fail(failure) => self.finish(handler, record, Err(failure), queue).await,
        }
    }

    async fn send(
        &self,
        saga_id: SagaId,
        task_id: TaskId,
        task: PendingTask,
        queue: &mut VecDeque<Envelope>,
    ) -> Result<(), EngineError> {
        match task.agent {
            Some(agent) => {
                let command = AgentCommand {
                    command: task.command_type,
                    payload: task.payload,
                    task_id,
                    saga_id,
                    agent,
                };
                self.transport
                    .send(&command)
                    .await
                    .map_err(|e| EngineError::Transport(e.to_string()))?;
                self.metric(EngineMetrics::record_sent);
                debug!(agent = %command.agent, command = %command.command, task_id = %task_id, "task sent to agent");
            }
            None => queue.push_back(Envelope::Initiate {
                command_type: task.command_type,
                payload: task.payload,
                requester: Requester::Saga { saga_id, task_id },
            }),
        }
        Ok(())
    }

    async fn finish(
        &self,
        handler: &dyn SagaHandler,
        record: SagaRecord,
        outcome: Result<Value, SagaFailure>,
        queue: &mut VecDeque<Envelope>,
    ) -> Result<(), EngineError> {
        self.store.remove(record.saga_id).await?;
        self.release(record.saga_id);

        match &outcome {
            Ok(_) => {
                self.metric(EngineMetrics::record_completed);
                info!(saga_type = %record.saga_type, saga_id = %record.saga_id, "saga completed");
            }
            Err(failure) => {
                self.metric(EngineMetrics::record_failed);
                warn!(
                    saga_type = %record.saga_type,
                    saga_id = %record.saga_id,
                    kind = %failure.kind,
                    error = %failure.message,
                    "saga failed"
                );
            }
        }

        match record.requester {
            Requester::Operation { operation_id } => {
                let status = match outcome {
                    Ok(result) => OperationStatus::Completed { result },
                    Err(failure) => OperationStatus::Failed { failure },
                };
                self.services
                    .inventory
                    .set_operation(operation_id, status)
                    .await?;
            }
            Requester::Saga { task_id, .. } => {
                let outcome = match outcome {
                    Ok(result) => TaskOutcome::Succeeded { result },
                    Err(failure) => TaskOutcome::Failed {
                        message: failure.message,
                        kind: Some(failure.kind),
                    },
                };
                queue.push_back(Envelope::Status(TaskStatusEvent {
                    initiating_task_id: task_id,
                    command_type: handler.initiated_by().to_string(),
                    outcome,
                }));
            }
        }
        Ok(())
    }

    fn lock_for(&self, key: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }

    fn release(&self, key: Uuid) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    fn metric(&self, record: impl FnOnce(&mut EngineMetrics)) {
        record(&mut self.metrics.lock().unwrap_or_else(PoisonError::into_inner));
    }
}
