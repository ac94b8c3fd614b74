use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MqttConfig;
use crate::genepool::BoxError;
use crate::saga::{SagaId, TaskId, TaskStatusEvent};

pub const EVENTS_TOPIC: &str = "catlets/controller/events";
pub const REQUESTS_TOPIC: &str = "catlets/controller/requests";
pub const STATUS_TOPIC: &str = "catlets/controller/status";

pub fn agent_topic(agent: &str) -> String {
    format!("catlets/agents/{agent}/commands")
}

/// Message from controller to agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub command: String,
    pub payload: serde_json::Value,
    /// Echoed back as `initiating_task_id` in the status event.
    pub task_id: TaskId,
    pub saga_id: SagaId,
    pub agent: String,
}

/// Operation request from an API frontend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerRequest {
    pub operation_id: Uuid,
    pub command: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Heartbeat published by the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerReport {
    pub controller_id: String,
    pub report_type: String, // "heartbeat", "operation"
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

/// Outbound channel to agents.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, command: &AgentCommand) -> Result<(), BoxError>;
}

pub struct MqttClient {
    client: AsyncClient,
    controller_id: String,
}

impl MqttClient {
    /// Create a new MQTT client
    pub fn new(
        config: &MqttConfig,
        controller_id: String,
    ) -> Result<(Self, EventLoop), Box<dyn std::error::Error>> {
        let mut mqttoptions = MqttOptions::new(
            format!("catlet-controller-{}", controller_id),
            &config.broker,
            config.port,
        );
        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        // Status events published while disconnected must still arrive.
        mqttoptions.set_clean_session(false);

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        Ok((
            Self {
                client,
                controller_id,
            },
            eventloop,
        ))
    }

    /// Subscribe to relevant MQTT topics
    pub async fn subscribe(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.client
            .subscribe(EVENTS_TOPIC.to_string(), QoS::AtLeastOnce)
            .await?;
        self.client
            .subscribe(REQUESTS_TOPIC.to_string(), QoS::AtLeastOnce)
            .await?;

        info!(controller_id = %self.controller_id, "subscribed to MQTT topics");
        Ok(())
    }

    /// Publish a report on the controller status topic
    pub async fn report(
        &self,
        report_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let report = ControllerReport {
            controller_id: self.controller_id.clone(),
            report_type: report_type.to_string(),
            payload,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)?
                .as_secs(),
        };

        let payload = serde_json::to_vec(&report)?;
        self.client
            .publish(STATUS_TOPIC.to_string(), QoS::AtLeastOnce, false, payload)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl MessageTransport for MqttClient {
    async fn send(&self, command: &AgentCommand) -> Result<(), BoxError> {
        let payload = serde_json::to_vec(command)?;
        self.client
            .publish(agent_topic(&command.agent), QoS::AtLeastOnce, false, payload)
            .await?;
        debug!(agent = %command.agent, command = %command.command, task_id = %command.task_id, "command published");
        Ok(())
    }
}

/// Parse an incoming MQTT message as a task status event
pub fn parse_event(payload: &[u8]) -> Result<TaskStatusEvent, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Parse an incoming MQTT message as an operation request
pub fn parse_request(payload: &[u8]) -> Result<ControllerRequest, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::TaskOutcome;

    #[test]
    fn test_parse_event_succeeded() {
        let task = Uuid::new_v4();
        let json = format!(
            r#"{{
                "initiating_task_id": "{task}",
                "command_type": "CreateCatletVm",
                "outcome": {{"status": "succeeded", "result": {{"vm_id": "vm-7"}}}}
            }}"#
        );

        let event = parse_event(json.as_bytes()).unwrap();
        assert_eq!(event.initiating_task_id, task);
        assert_eq!(event.command_type, "CreateCatletVm");
        match event.outcome {
            TaskOutcome::Succeeded { result } => assert_eq!(result["vm_id"], "vm-7"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_parse_event_failed_without_result() {
        let task = Uuid::new_v4();
        let json = format!(
            r#"{{
                "initiating_task_id": "{task}",
                "command_type": "RemoveDisk",
                "outcome": {{"status": "failed", "message": "disk in use"}}
            }}"#
        );

        let event = parse_event(json.as_bytes()).unwrap();
        assert_eq!(
            event.outcome,
            TaskOutcome::Failed {
                message: "disk in use".to_string(),
                kind: None
            }
        );
    }

    #[test]
    fn test_parse_event_invalid_json() {
        assert!(parse_event(b"not valid json {[}").is_err());
    }

    #[test]
    fn test_parse_event_missing_task_id() {
        let json = r#"{"command_type": "RemoveDisk", "outcome": {"status": "succeeded"}}"#;
        assert!(parse_event(json.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_request() {
        let op = Uuid::new_v4();
        let json = format!(
            r#"{{"operation_id": "{op}", "command": "DeployCatlet", "payload": {{"config": {{"name": "web"}}}}}}"#
        );

        let request = parse_request(json.as_bytes()).unwrap();
        assert_eq!(request.operation_id, op);
        assert_eq!(request.command, "DeployCatlet");
        assert_eq!(request.payload["config"]["name"], "web");
    }

    #[test]
    fn test_parse_request_empty_payload() {
        let op = Uuid::new_v4();
        let json = format!(r#"{{"operation_id": "{op}", "command": "CleanupGenes"}}"#);
        let request = parse_request(json.as_bytes()).unwrap();
        assert!(request.payload.is_null());
    }

    #[test]
    fn test_agent_command_serialization() {
        let cmd = AgentCommand {
            command: "RemoveCatletVm".to_string(),
            payload: serde_json::json!({"vm_id": "vm-1"}),
            task_id: Uuid::new_v4(),
            saga_id: Uuid::new_v4(),
            agent: "hv-1".to_string(),
        };

        let json = serde_json::to_string(&cmd).unwrap();
        let deserialized: AgentCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, cmd);
    }

    #[test]
    fn test_mqtt_client_new() {
        let config = MqttConfig {
            broker: "localhost".to_string(),
            port: 1883,
            keep_alive_secs: 30,
        };

        let result = MqttClient::new(&config, "ctl-1".to_string());
        assert!(result.is_ok());
        let (client, _eventloop) = result.unwrap();
        assert_eq!(client.controller_id, "ctl-1");
    }

    #[test]
    fn test_mqtt_topics_format() {
        assert_eq!(agent_topic("hv-1"), "catlets/agents/hv-1/commands");
        assert_eq!(EVENTS_TOPIC, "catlets/controller/events");
        assert_eq!(REQUESTS_TOPIC, "catlets/controller/requests");
    }

    #[tokio::test]
    async fn test_mock_transport() {
        let mut transport = MockMessageTransport::new();
        transport
            .expect_send()
            .withf(|cmd| cmd.agent == "hv-2")
            .times(1)
            .returning(|_| Ok(()));

        let cmd = AgentCommand {
            command: "RemoveGenes".to_string(),
            payload: serde_json::json!({}),
            task_id: Uuid::new_v4(),
            saga_id: Uuid::new_v4(),
            agent: "hv-2".to_string(),
        };
        transport.send(&cmd).await.unwrap();
    }
}
