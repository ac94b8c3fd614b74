//! Shared fixtures for unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::genepool::{BoxError, GenePool};
use crate::genes::{Architecture, GeneSetIdentifier, UniqueGeneIdentifier};
use crate::inventory::{Inventory, LocalInventory, OperationStatus};
use crate::mqtt::{AgentCommand, MessageTransport};
use crate::saga::{MemorySagaStore, SagaContext, SagaEngine, SagaServices, TaskStatusEvent};

/// In-memory gene pool that counts how often it is asked for things.
#[derive(Default)]
pub struct MockGenePool {
    tags: HashMap<GeneSetIdentifier, GeneSetIdentifier>,
    contents: HashMap<(GeneSetIdentifier, String), Vec<u8>>,
    resolve_calls: Mutex<HashMap<GeneSetIdentifier, u32>>,
    read_calls: AtomicU32,
    should_fail: bool,
}

impl MockGenePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    /// `tag` resolves to `pinned`; `pinned` resolves to itself.
    pub fn with_tag(mut self, tag: &str, pinned: &str) -> Self {
        let pinned: GeneSetIdentifier = pinned.parse().unwrap();
        self.tags.insert(pinned.clone(), pinned.clone());
        self.tags.insert(tag.parse().unwrap(), pinned);
        self
    }

    /// Catlet gene content of a pinned gene set.
    pub fn with_catlet(self, pinned: &str, config: serde_json::Value) -> Self {
        self.with_content(pinned, "catlet", serde_json::to_vec(&config).unwrap())
    }

    pub fn with_content(mut self, pinned: &str, gene: &str, content: Vec<u8>) -> Self {
        self.contents
            .insert((pinned.parse().unwrap(), gene.to_string()), content);
        self
    }

    pub fn resolve_count(&self, tag: &str) -> u32 {
        let tag: GeneSetIdentifier = tag.parse().unwrap();
        self.resolve_calls
            .lock()
            .unwrap()
            .get(&tag)
            .copied()
            .unwrap_or(0)
    }

    pub fn read_count(&self) -> u32 {
        self.read_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenePool for MockGenePool {
    async fn resolve_gene_set(
        &self,
        id: &GeneSetIdentifier,
    ) -> Result<Option<GeneSetIdentifier>, BoxError> {
        *self
            .resolve_calls
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_insert(0) += 1;
        if self.should_fail {
            return Err("gene pool unreachable".into());
        }
        Ok(self.tags.get(id).cloned())
    }

    async fn read_gene_content(
        &self,
        gene: &UniqueGeneIdentifier,
    ) -> Result<Option<Vec<u8>>, BoxError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            return Err("gene pool unreachable".into());
        }
        let key = (gene.id.gene_set().clone(), gene.id.name().to_string());
        Ok(self.contents.get(&key).cloned())
    }
}

/// Transport that records every command instead of publishing it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<AgentCommand>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<AgentCommand> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last(&self) -> AgentCommand {
        self.sent.lock().unwrap().last().cloned().expect("nothing sent")
    }

    /// Commands sent since the previous call.
    pub fn take(&self) -> Vec<AgentCommand> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn send(&self, command: &AgentCommand) -> Result<(), BoxError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err("broker unreachable".into());
        }
        self.sent.lock().unwrap().push(command.clone());
        Ok(())
    }
}

pub fn services_with(
    pool: MockGenePool,
    inventory: Arc<LocalInventory>,
    agents: &[&str],
) -> SagaServices {
    SagaServices {
        gene_pool: Arc::new(pool),
        inventory,
        agents: agents.iter().map(|a| a.to_string()).collect(),
        architecture: Architecture::Any,
    }
}

pub fn services(inventory: Arc<LocalInventory>, agents: &[&str]) -> SagaServices {
    services_with(MockGenePool::new(), inventory, agents)
}

pub fn context() -> SagaContext {
    let services = services(Arc::new(LocalInventory::new()), &["hv-1"]);
    SagaContext::new(Uuid::new_v4(), Arc::new(services))
}

/// Engine wired with every controller saga and in-memory collaborators.
pub struct Harness {
    pub engine: SagaEngine,
    pub transport: Arc<RecordingTransport>,
    pub inventory: Arc<LocalInventory>,
    pub store: Arc<MemorySagaStore>,
}

impl Harness {
    pub fn new(pool: MockGenePool, agents: &[&str]) -> Self {
        let transport = Arc::new(RecordingTransport::new());
        let inventory = Arc::new(LocalInventory::new());
        let store = Arc::new(MemorySagaStore::new());
        let engine = SagaEngine::new(
            crate::sagas::registry(),
            store.clone(),
            transport.clone(),
            services_with(pool, inventory.clone(), agents),
        );
        Self {
            engine,
            transport,
            inventory,
            store,
        }
    }

    pub async fn submit(&self, command: &str, payload: Value) -> Uuid {
        let operation_id = Uuid::new_v4();
        self.engine
            .submit(operation_id, command, payload)
            .await
            .unwrap();
        operation_id
    }

    pub async fn reply(&self, command: &AgentCommand, result: Value) {
        self.engine
            .handle_event(TaskStatusEvent::succeeded(
                command.task_id,
                &command.command,
                result,
            ))
            .await
            .unwrap();
    }

    pub async fn reject(&self, command: &AgentCommand, message: &str) {
        self.engine
            .handle_event(TaskStatusEvent::failed(
                command.task_id,
                &command.command,
                message,
            ))
            .await
            .unwrap();
    }

    pub fn take(&self) -> Vec<AgentCommand> {
        self.transport.take()
    }

    /// The single command sent since the previous call.
    pub fn take_one(&self, command: &str) -> AgentCommand {
        let mut sent = self.take();
        assert_eq!(sent.len(), 1, "expected exactly one command, got {sent:?}");
        let cmd = sent.remove(0);
        assert_eq!(cmd.command, command);
        cmd
    }

    pub fn status(&self, operation_id: Uuid) -> OperationStatus {
        self.inventory
            .operation(operation_id)
            .expect("operation not recorded")
            .status
    }
}
