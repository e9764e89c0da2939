use crate::progress::ProgressSample;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Ring capacity per subscriber; broadcast drops the oldest entries for slow
/// consumers, which is exactly the backpressure the log stream wants.
const CHANNEL_CAPACITY: usize = 500;

/// Everything the engine tells the outside world about one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Progress(ProgressSample),
    Log { stream: LogStream, line: String },
    Started { pid: u32 },
    Stopping,
    Exited { code: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One broadcast channel per instance id, created on first use. Senders are
/// cheap clones; subscribers see events from their subscription onward.
#[derive(Debug, Default)]
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self, instance_id: &str) -> broadcast::Sender<EngineEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(instance_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<EngineEvent> {
        self.sender(instance_id).subscribe()
    }

    pub fn emit(&self, instance_id: &str, event: EngineEvent) {
        // send only fails with zero subscribers, which is fine
        let _ = self.sender(instance_id).send(event);
    }
}
