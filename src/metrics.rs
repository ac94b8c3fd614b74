use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Saga engine counters, reported with every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineMetrics {
    pub uptime_sec: u64,
    pub sagas_started: u64,
    pub sagas_completed: u64,
    pub sagas_failed: u64,
    pub events_handled: u64,
    /// Redelivered events and initiations that changed nothing.
    pub duplicates_ignored: u64,
    /// Events no saga was waiting for.
    pub unmatched_events: u64,
    pub commands_sent: u64,
    pub custom: HashMap<String, f64>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&mut self) {
        self.sagas_started += 1;
    }

    pub fn record_completed(&mut self) {
        self.sagas_completed += 1;
    }

    pub fn record_failed(&mut self) {
        self.sagas_failed += 1;
    }

    pub fn record_event(&mut self) {
        self.events_handled += 1;
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates_ignored += 1;
    }

    pub fn record_unmatched(&mut self) {
        self.unmatched_events += 1;
    }

    pub fn record_sent(&mut self) {
        self.commands_sent += 1;
    }

    /// Set a custom metric
    pub fn set_custom(&mut self, key: impl Into<String>, value: f64) {
        self.custom.insert(key.into(), value);
    }

    /// Sagas currently alive, as far as this process has seen.
    pub fn active(&self) -> u64 {
        self.sagas_started
            .saturating_sub(self.sagas_completed + self.sagas_failed)
    }

    /// Share of finished sagas that completed, as percentage
    pub fn success_rate(&self) -> f64 {
        let finished = self.sagas_completed + self.sagas_failed;
        if finished == 0 {
            return 100.0;
        }
        (self.sagas_completed as f64 / finished as f64) * 100.0
    }

    /// Increment uptime (typically called every heartbeat interval)
    pub fn increment_uptime(&mut self, seconds: u64) {
        self.uptime_sec += seconds;
    }
}
