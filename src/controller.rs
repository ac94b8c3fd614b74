use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::genepool::{BoxError, LocalGenePool};
use crate::inventory::{Inventory, LocalInventory};
use crate::metrics::EngineMetrics;
use crate::mqtt::{parse_event, parse_request, MqttClient, EVENTS_TOPIC, REQUESTS_TOPIC};
use crate::saga::{FileSagaStore, SagaEngine, SagaServices};
use crate::sagas;

/// Route one inbound message to the saga engine.
pub async fn route_message(engine: &SagaEngine, topic: &str, payload: &[u8]) -> Result<(), BoxError> {
    match topic {
        EVENTS_TOPIC => {
            let event = parse_event(payload)?;
            engine.handle_event(event).await?;
        }
        REQUESTS_TOPIC => {
            let request = parse_request(payload)?;
            info!(operation_id = %request.operation_id, command = %request.command, "operation requested");
            engine
                .submit(request.operation_id, &request.command, request.payload)
                .await?;
        }
        other => return Err(format!("unexpected topic '{other}'").into()),
    }
    Ok(())
}

pub struct Controller {
    pub config: Config,
    pub mqtt: Arc<MqttClient>,
    pub engine: Arc<SagaEngine>,
    pub inventory: Arc<LocalInventory>,
    uptime_sec: u64,
}

impl Controller {
    /// Open the saga store, inventory and gene cache and wire the saga engine
    pub fn new(config: Config) -> Result<(Self, rumqttc::EventLoop), Box<dyn std::error::Error>> {
        let (mqtt, eventloop) = MqttClient::new(&config.mqtt, config.controller_id.clone())?;
        let mqtt = Arc::new(mqtt);

        let store = FileSagaStore::open(&config.store.dir)?;
        let gene_pool = LocalGenePool::open(&config.genepool.root)?;
        let inventory = Arc::new(LocalInventory::open(&config.store.inventory)?);

        if config.placement.agents.is_empty() {
            warn!("no agents configured, catlet placement will fail");
        }
        let services = SagaServices {
            gene_pool: Arc::new(gene_pool),
            inventory: inventory.clone(),
            agents: config.placement.agents.clone(),
            architecture: config.architecture,
        };
        let engine = SagaEngine::new(sagas::registry(), Arc::new(store), mqtt.clone(), services);

        let controller = Self {
            config,
            mqtt,
            engine: Arc::new(engine),
            inventory,
            uptime_sec: 0,
        };
        Ok((controller, eventloop))
    }

    /// Engine counters plus controller-level gauges.
    pub fn metrics(&self) -> EngineMetrics {
        let mut metrics = self.engine.metrics();
        metrics.increment_uptime(self.uptime_sec);
        metrics.set_custom(
            "disk_cleanup_pending",
            self.inventory.pending_disk_cleanup().len() as f64,
        );
        metrics
    }

    /// Send heartbeat with metrics
    pub async fn heartbeat(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.uptime_sec += self.config.heartbeat_secs;

        let metrics = self.metrics();
        info!(
            started = metrics.sagas_started,
            completed = metrics.sagas_completed,
            failed = metrics.sagas_failed,
            active = metrics.active(),
            "saga stats"
        );
        let metrics_json = serde_json::to_value(&metrics)?;
        self.mqtt.report("heartbeat", metrics_json).await?;

        Ok(())
    }

    /// Handle an inbound message off the event loop task.
    fn dispatch(&self, topic: String, payload: Vec<u8>) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = route_message(&engine, &topic, &payload).await {
                warn!(topic = %topic, error = %e, "failed to handle message");
            }
        });
    }

    /// Main event loop
    pub async fn run(
        mut self,
        mut eventloop: rumqttc::EventLoop,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.mqtt.subscribe().await?;

        if self.config.resume_on_start {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.resume().await {
                    error!(error = %e, "failed to resume persisted sagas");
                }
            });
        }
        info!("controller ready, entering main loop");

        let mut heartbeat_interval =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_secs));

        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                            self.dispatch(publish.topic.clone(), publish.payload.to_vec());
                        }
                        Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                            info!("connected to MQTT broker");
                        }
                        Err(e) => {
                            error!(error = %e, "MQTT error, reconnecting...");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                        _ => {}
                    }
                }
                _ = heartbeat_interval.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(error = %e, "failed to send heartbeat");
                    }
                }
            }
        }
    }
}
