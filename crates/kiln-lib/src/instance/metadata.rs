use crate::pack::types::LoaderSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the -Xmx for an instance is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RamAllocation {
    /// Use the pack's recommended value when it fits in physical memory
    Recommended,
    /// Use the launcher-wide default
    Global,
    /// Use `custom_ram_mb`, clamped to sane bounds
    Custom,
}

/// Lifecycle state of an instance as the engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    NotInstalled,
    Installing,
    Installed,
    Outdated,
    Running,
    Error,
}

/// The journal persisted at `<instance>/instance.json`. Present exactly when
/// the instance is installed (or outdated); its keys are a stable contract
/// with the UI shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceMetadata {
    pub id: String,
    pub name: String,
    pub installed_version: String,
    pub minecraft_version: String,
    pub loader: LoaderSpec,
    pub installed_at: DateTime<Utc>,
    pub ram_allocation: RamAllocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_ram_mb: Option<u32>,
    #[serde(default = "default_true")]
    pub allow_custom_mods: bool,
    #[serde(default = "default_true")]
    pub allow_custom_resourcepacks: bool,
    #[serde(default = "default_true")]
    pub allow_custom_configs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_ram_mb: Option<u32>,
    #[serde(default)]
    pub category: String,
    /// Instance-relative paths the engine itself installed; drives update
    /// cleanup and offline verification without guessing.
    #[serde(default)]
    pub managed_files: Vec<ManagedFile>,
}

/// One file the engine placed, with whichever digests its source declared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagedFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha512: Option<String>,
}

impl ManagedFile {
    pub fn unhashed(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            sha1: None,
            sha512: None,
        }
    }
}

fn default_true() -> bool {
    true
}

impl InstanceMetadata {
    pub fn protection_flags(&self) -> crate::instance::protection::ProtectionFlags {
        crate::instance::protection::ProtectionFlags {
            allow_custom_mods: self.allow_custom_mods,
            allow_custom_resourcepacks: self.allow_custom_resourcepacks,
            allow_custom_configs: self.allow_custom_configs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::types::LoaderKind;

    fn sample() -> InstanceMetadata {
        InstanceMetadata {
            id: "pack-1".into(),
            name: "Test Pack".into(),
            installed_version: "2.1.0".into(),
            minecraft_version: "1.20.1".into(),
            loader: LoaderSpec {
                kind: LoaderKind::Forge,
                version: "47.2.0".into(),
            },
            installed_at: Utc::now(),
            ram_allocation: RamAllocation::Recommended,
            custom_ram_mb: None,
            allow_custom_mods: true,
            allow_custom_resourcepacks: true,
            allow_custom_configs: false,
            recommended_ram_mb: Some(6144),
            category: "official".into(),
            managed_files: vec![ManagedFile {
                path: "mods/a.jar".into(),
                sha1: Some("aa".into()),
                sha512: None,
            }],
        }
    }

    #[test]
    fn journal_round_trips() {
        let meta = sample();
        let json = serde_json::to_string_pretty(&meta).unwrap();
        let back: InstanceMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn journal_keys_are_stable() {
        let json = serde_json::to_value(sample()).unwrap();
        for key in [
            "id",
            "name",
            "installed_version",
            "minecraft_version",
            "loader",
            "installed_at",
            "ram_allocation",
            "allow_custom_mods",
            "allow_custom_resourcepacks",
            "allow_custom_configs",
            "recommended_ram_mb",
            "category",
            "managed_files",
        ] {
            assert!(json.get(key).is_some(), "missing journal key {}", key);
        }
    }

    #[test]
    fn missing_flags_default_to_permissive() {
        let raw = r#"{
            "id": "x", "name": "x", "installed_version": "1",
            "minecraft_version": "1.20.1",
            "loader": {"kind": "fabric", "version": "0.15.3"},
            "installed_at": "2026-01-01T00:00:00Z",
            "ram_allocation": "global"
        }"#;
        let meta: InstanceMetadata = serde_json::from_str(raw).unwrap();
        assert!(meta.allow_custom_mods);
        assert!(meta.allow_custom_configs);
        assert!(meta.managed_files.is_empty());
    }
}
