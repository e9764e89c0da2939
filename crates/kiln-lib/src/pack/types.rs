use crate::utils::hash::ExpectedHash;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Modrinth pack index (`modrinth.index.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModrinthIndex {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    #[serde(default = "default_game")]
    pub game: String,
    pub version_id: String,
    pub name: String,
    pub summary: Option<String>,
    pub files: Vec<ModrinthFile>,
    #[serde(default)]
    pub dependencies: HashMap<String, String>,
}

fn default_format_version() -> u32 {
    1
}
fn default_game() -> String {
    "minecraft".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModrinthFile {
    pub path: String,
    #[serde(default)]
    pub hashes: HashMap<String, String>,
    pub env: Option<ModrinthEnv>,
    #[serde(default)]
    pub downloads: Vec<String>,
    #[serde(default)]
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModrinthEnv {
    #[serde(default = "default_required")]
    pub client: String,
    #[serde(default = "default_required")]
    pub server: String,
}

fn default_required() -> String {
    "required".to_string()
}

/// CurseForge pack manifest (`manifest.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurseForgeManifest {
    pub minecraft: CurseForgeMinecraft,
    #[serde(default = "default_manifest_type")]
    pub manifest_type: String,
    #[serde(default = "default_manifest_version")]
    pub manifest_version: u32,
    pub name: String,
    pub version: String,
    #[serde(default = "default_author")]
    pub author: String,
    pub files: Vec<CurseForgeFileRef>,
    #[serde(default = "default_overrides")]
    pub overrides: String,
}

fn default_manifest_type() -> String {
    "minecraftModpack".to_string()
}
fn default_manifest_version() -> u32 {
    1
}
fn default_author() -> String {
    "Unknown".to_string()
}
fn default_overrides() -> String {
    "overrides".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurseForgeMinecraft {
    pub version: String,
    pub mod_loaders: Vec<CurseForgeModLoader>,
    #[serde(default)]
    pub recommended_ram: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurseForgeModLoader {
    pub id: String,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurseForgeFileRef {
    #[serde(alias = "projectID")]
    pub project_id: i64,
    #[serde(alias = "fileID")]
    pub file_id: i64,
    pub required: bool,
}

/// The two manifest shapes the engine accepts, tagged at the parse boundary.
#[derive(Debug, Clone)]
pub enum ModpackManifest {
    CurseForge(CurseForgeManifest),
    Modrinth(ModrinthIndex),
}

impl ModpackManifest {
    pub fn info(&self) -> Result<PackInfo> {
        match self {
            ModpackManifest::CurseForge(m) => {
                let loader = m
                    .minecraft
                    .mod_loaders
                    .iter()
                    .find(|l| l.primary)
                    .or_else(|| m.minecraft.mod_loaders.first())
                    .map(|l| LoaderSpec::parse_id(&l.id))
                    .transpose()?
                    .unwrap_or(LoaderSpec {
                        kind: LoaderKind::Vanilla,
                        version: String::new(),
                    });
                Ok(PackInfo {
                    name: m.name.clone(),
                    version: m.version.clone(),
                    minecraft_version: m.minecraft.version.clone(),
                    loader,
                    recommended_ram_mb: m.minecraft.recommended_ram,
                })
            }
            ModpackManifest::Modrinth(idx) => {
                let minecraft_version = idx
                    .dependencies
                    .get("minecraft")
                    .cloned()
                    .ok_or_else(|| anyhow!("modrinth index lacks a minecraft dependency"))?;
                let loader = LoaderSpec::from_modrinth_dependencies(&idx.dependencies);
                Ok(PackInfo {
                    name: idx.name.clone(),
                    version: idx.version_id.clone(),
                    minecraft_version,
                    loader,
                    recommended_ram_mb: None,
                })
            }
        }
    }
}

/// Normalized description of what a pack is, independent of its source shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackInfo {
    pub name: String,
    pub version: String,
    pub minecraft_version: String,
    pub loader: LoaderSpec,
    pub recommended_ram_mb: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LoaderKind {
    Vanilla,
    Forge,
    Fabric,
    Quilt,
    NeoForge,
}

impl LoaderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoaderKind::Vanilla => "vanilla",
            LoaderKind::Forge => "forge",
            LoaderKind::Fabric => "fabric",
            LoaderKind::Quilt => "quilt",
            LoaderKind::NeoForge => "neoforge",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoaderSpec {
    pub kind: LoaderKind,
    pub version: String,
}

impl LoaderSpec {
    /// Parse a CurseForge loader id like `"forge-47.2.0"`,
    /// `"fabric-loader-0.15.3"` or `"neoforge-20.4.80"`.
    pub fn parse_id(id: &str) -> Result<Self> {
        let lowered = id.to_lowercase();
        for (prefix, kind) in [
            ("fabric-loader-", LoaderKind::Fabric),
            ("quilt-loader-", LoaderKind::Quilt),
            ("neoforge-", LoaderKind::NeoForge),
            ("fabric-", LoaderKind::Fabric),
            ("quilt-", LoaderKind::Quilt),
            ("forge-", LoaderKind::Forge),
        ] {
            if let Some(version) = lowered.strip_prefix(prefix) {
                if version.is_empty() {
                    return Err(anyhow!("loader id {:?} has an empty version", id));
                }
                return Ok(Self {
                    kind,
                    version: version.to_string(),
                });
            }
        }
        Err(anyhow!("unrecognized loader id: {:?}", id))
    }

    pub fn from_modrinth_dependencies(deps: &HashMap<String, String>) -> Self {
        for (key, kind) in [
            ("fabric-loader", LoaderKind::Fabric),
            ("quilt-loader", LoaderKind::Quilt),
            ("neoforge", LoaderKind::NeoForge),
            ("forge", LoaderKind::Forge),
        ] {
            if let Some(version) = deps.get(key) {
                return Self {
                    kind,
                    version: version.clone(),
                };
            }
        }
        Self {
            kind: LoaderKind::Vanilla,
            version: String::new(),
        }
    }

    /// Canonical on-disk id for a loader-installed version, e.g.
    /// `fabric-loader-0.15.3-1.20.1`; vanilla keeps the raw version id.
    pub fn installed_version_id(&self, minecraft_version: &str) -> String {
        match self.kind {
            LoaderKind::Vanilla => minecraft_version.to_string(),
            kind => format!("{}-loader-{}-{}", kind.as_str(), self.version, minecraft_version),
        }
    }
}

/// What a planned file is, for routing and progress labelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Mod,
    LoaderLib,
    McAsset,
    Override,
}

/// Where a planned file came from, kept for failure reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    CurseForge { project_id: i64, file_id: i64 },
    Modrinth,
    Archive,
}

/// A concrete download/placement plan entry. `url: None` together with
/// `restricted: false` means the URL is still pending registry resolution;
/// `restricted: true` means the registry declined to hand one out.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub kind: FileKind,
    /// Path relative to the instance root, forward slashes
    pub target_path: String,
    pub url: Option<String>,
    pub expected_hash: Option<ExpectedHash>,
    pub size: Option<u64>,
    pub required: bool,
    pub restricted: bool,
    pub source: SourceRef,
}

/// User- or pack-provided bytes addressed by instance-relative path. Kept in
/// memory until staged into the instance tree or appended to an archive.
#[derive(Debug, Clone, Default)]
pub struct OverridesBundle {
    files: BTreeMap<String, Vec<u8>>,
}

impl OverridesBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: Vec<u8>) {
        self.files.insert(normalize_rel_path(&path.into()), bytes);
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(&normalize_rel_path(path)).map(|v| v.as_slice())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(&normalize_rel_path(path))
    }

    /// Look a file up by bare file name, any directory.
    pub fn find_by_name(&self, file_name: &str) -> Option<(&str, &[u8])> {
        self.files
            .iter()
            .find(|(path, _)| {
                path.rsplit('/').next().map(|n| n == file_name).unwrap_or(false)
            })
            .map(|(path, bytes)| (path.as_str(), bytes.as_slice()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(p, b)| (p.as_str(), b.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Normalize an archive/user path to forward slashes without leading "./".
pub fn normalize_rel_path(path: &str) -> String {
    let mut out = path.replace('\\', "/");
    while let Some(stripped) = out.strip_prefix("./") {
        out = stripped.to_string();
    }
    out.trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_forge_loader_id() {
        let spec = LoaderSpec::parse_id("forge-47.2.0").unwrap();
        assert_eq!(spec.kind, LoaderKind::Forge);
        assert_eq!(spec.version, "47.2.0");
    }

    #[test]
    fn parses_fabric_loader_id_with_loader_infix() {
        let spec = LoaderSpec::parse_id("fabric-loader-0.15.3").unwrap();
        assert_eq!(spec.kind, LoaderKind::Fabric);
        assert_eq!(spec.version, "0.15.3");
    }

    #[test]
    fn parses_neoforge_id() {
        let spec = LoaderSpec::parse_id("neoforge-20.4.80").unwrap();
        assert_eq!(spec.kind, LoaderKind::NeoForge);
        assert_eq!(spec.version, "20.4.80");
    }

    #[test]
    fn rejects_garbage_loader_id() {
        assert!(LoaderSpec::parse_id("liteloader-1.12").is_err());
    }

    #[test]
    fn installed_version_id_formats() {
        let spec = LoaderSpec {
            kind: LoaderKind::Quilt,
            version: "0.21.0".into(),
        };
        assert_eq!(
            spec.installed_version_id("1.20.1"),
            "quilt-loader-0.21.0-1.20.1"
        );

        let vanilla = LoaderSpec {
            kind: LoaderKind::Vanilla,
            version: String::new(),
        };
        assert_eq!(vanilla.installed_version_id("1.20.1"), "1.20.1");
    }

    #[test]
    fn modrinth_dependency_detection_prefers_loaders() {
        let mut deps = HashMap::new();
        deps.insert("minecraft".to_string(), "1.20.1".to_string());
        deps.insert("fabric-loader".to_string(), "0.15.3".to_string());
        let spec = LoaderSpec::from_modrinth_dependencies(&deps);
        assert_eq!(spec.kind, LoaderKind::Fabric);
    }

    #[test]
    fn overrides_bundle_normalizes_paths() {
        let mut bundle = OverridesBundle::new();
        bundle.insert("config\\mod.toml", vec![1]);
        assert!(bundle.contains("config/mod.toml"));
        assert_eq!(bundle.get("config/mod.toml"), Some(&[1u8][..]));
    }

    #[test]
    fn overrides_bundle_finds_by_name() {
        let mut bundle = OverridesBundle::new();
        bundle.insert("mods/secret-mod-1.2.jar", vec![7, 7]);
        let (path, bytes) = bundle.find_by_name("secret-mod-1.2.jar").unwrap();
        assert_eq!(path, "mods/secret-mod-1.2.jar");
        assert_eq!(bytes, &[7, 7]);
    }
}
