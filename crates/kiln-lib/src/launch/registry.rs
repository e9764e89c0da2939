use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::RwLock;

/// A running game the engine knows about.
#[derive(Debug, Clone)]
pub struct RunningInstance {
    pub instance_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Whether the OS still knows this pid. Used by the stop path between
/// escalation steps; the monitor below batches its checks instead.
pub(crate) fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    sys.process(Pid::from_u32(pid)).is_some()
}

/// In-memory registry of running instances. A background monitor prunes
/// entries whose process disappeared without the reaper noticing (launcher
/// restarts do not persist this map, by design).
#[derive(Debug, Default)]
pub struct RunningRegistry {
    instances: RwLock<HashMap<String, RunningInstance>>,
}

impl RunningRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, instance: RunningInstance) {
        log::info!(
            "registering running instance {} (pid {})",
            instance.instance_id,
            instance.pid
        );
        self.instances
            .write()
            .await
            .insert(instance.instance_id.clone(), instance);
    }

    pub async fn unregister(&self, instance_id: &str) {
        if self.instances.write().await.remove(instance_id).is_some() {
            log::info!("unregistered instance {}", instance_id);
        }
    }

    pub async fn get(&self, instance_id: &str) -> Option<RunningInstance> {
        self.instances.read().await.get(instance_id).cloned()
    }

    pub async fn is_running(&self, instance_id: &str) -> bool {
        self.instances.read().await.contains_key(instance_id)
    }

    pub async fn all(&self) -> Vec<RunningInstance> {
        self.instances.read().await.values().cloned().collect()
    }

    /// Start the liveness monitor. Call once from an async context. One
    /// process-table refresh covers every registered pid per tick.
    pub fn spawn_monitor(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let snapshot = registry.all().await;
                if snapshot.is_empty() {
                    continue;
                }
                let pids: Vec<Pid> =
                    snapshot.iter().map(|i| Pid::from_u32(i.pid)).collect();
                let mut sys = System::new();
                sys.refresh_processes(ProcessesToUpdate::Some(&pids), true);
                for instance in snapshot {
                    if sys.process(Pid::from_u32(instance.pid)).is_none() {
                        log::info!(
                            "instance {} process exited outside the reaper",
                            instance.instance_id
                        );
                        registry.unregister(&instance.instance_id).await;
                    }
                }
            }
        });
    }
}
