pub mod arguments;
pub mod classpath;
pub mod process;
pub mod registry;

use crate::config::EngineConfig;
use crate::instance::metadata::{InstanceMetadata, RamAllocation};
use crate::loader::InstalledRuntime;
use std::path::PathBuf;
use uuid::Uuid;

/// Safety buffer between the recommended allocation and physical memory; a
/// recommendation that leaves less than this falls back to the global value.
const RAM_SAFETY_BUFFER_MB: u64 = 1536;
const RAM_FLOOR_MB: u32 = 512;

/// What the identity provider hands the engine for one launch. Tokens are
/// used for argument substitution and never persisted.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub uuid: String,
    pub access_token: String,
    pub client_token: String,
    pub user_type: String,
}

impl Credentials {
    /// Offline mode: a deterministic UUID derived from the username, so the
    /// same name always maps to the same player identity.
    pub fn offline(username: &str) -> Self {
        let uuid = Uuid::new_v3(
            &Uuid::NAMESPACE_OID,
            format!("OfflinePlayer:{}", username).as_bytes(),
        );
        Self {
            username: username.to_string(),
            uuid: uuid.to_string(),
            access_token: "0".to_string(),
            client_token: String::new(),
            user_type: "legacy".to_string(),
        }
    }
}

/// Everything needed to turn an installed instance into an argv.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub config: EngineConfig,
    pub instance_id: String,
    pub minecraft_version: String,
    pub game_dir: PathBuf,
    pub runtime: InstalledRuntime,
    pub credentials: Credentials,
    pub max_ram_mb: u32,
    pub window: Option<(u32, u32)>,
    /// Extra user JVM arguments, already split into tokens
    pub extra_jvm_args: Vec<String>,
}

impl LaunchContext {
    /// Parse a user-provided JVM argument string the way a shell would.
    pub fn set_extra_jvm_args(&mut self, raw: &str) {
        self.extra_jvm_args = shlex::split(raw).unwrap_or_default();
    }
}

/// Physical memory in MB, sampled fresh per launch. RAM decisions happen
/// once per launch, so no long-lived system handle is kept around.
fn physical_memory_mb() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory() / (1024 * 1024)
}

/// Pick the -Xmx for an instance according to its allocation mode.
pub fn resolve_ram_mb(meta: &InstanceMetadata, config: &EngineConfig) -> u32 {
    let total = physical_memory_mb();
    match meta.ram_allocation {
        RamAllocation::Recommended => match meta.recommended_ram_mb {
            Some(recommended)
                if u64::from(recommended) + RAM_SAFETY_BUFFER_MB <= total =>
            {
                recommended
            }
            Some(recommended) => {
                log::warn!(
                    "recommended {} MB does not fit in {} MB physical memory, using global default",
                    recommended,
                    total
                );
                config.global_ram_mb
            }
            None => config.global_ram_mb,
        },
        RamAllocation::Global => config.global_ram_mb,
        RamAllocation::Custom => {
            let requested = meta.custom_ram_mb.unwrap_or(config.global_ram_mb);
            requested.clamp(RAM_FLOOR_MB, total.min(u32::MAX as u64) as u32)
        }
    }
}
