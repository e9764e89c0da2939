use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Mojang-format version JSON, also produced (with `inheritsFrom`) by every
/// loader's profile generator. Unknown keys are preserved-by-ignoring; the
/// engine re-serializes only documents it merged itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VersionJson {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inherits_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Arguments>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minecraft_arguments: Option<String>,
    #[serde(default)]
    pub libraries: Vec<Library>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_index: Option<AssetIndexRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads: Option<VersionDownloads>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub java_version: Option<JavaVersionRef>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub version_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Arguments {
    #[serde(default)]
    pub game: Vec<Argument>,
    #[serde(default)]
    pub jvm: Vec<Argument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Argument {
    Simple(String),
    Conditional {
        rules: Vec<Rule>,
        value: ArgumentValue,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgumentValue {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub action: RuleAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<HashMap<String, bool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Disallow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads: Option<LibraryDownloads>,
    /// Maven base URL for loaders that list bare coordinates (Fabric/Quilt)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub natives: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<Rule>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryDownloads {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifiers: Option<HashMap<String, ArtifactRef>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetIndexRef {
    pub id: String,
    pub sha1: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDownloads {
    pub client: ArtifactRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ArtifactRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JavaVersionRef {
    #[serde(default = "default_java_component")]
    pub component: String,
    #[serde(default = "default_java_major")]
    pub major_version: u32,
}

fn default_java_component() -> String {
    "jre-legacy".to_string()
}
fn default_java_major() -> u32 {
    8
}

/// Host OS name as Mojang rules spell it.
pub fn current_os_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "osx",
        "windows" => "windows",
        _ => "linux",
    }
}

/// Native classifier key for the host (legacy `natives` tables).
pub fn current_native_classifier() -> &'static str {
    match std::env::consts::OS {
        "macos" => "natives-macos",
        "windows" => "natives-windows",
        _ => "natives-linux",
    }
}

/// Evaluate Mojang-style rules with no launch features in play (library
/// selection). No rules means allowed.
pub fn rules_allow(rules: Option<&[Rule]>) -> bool {
    let Some(rules) = rules else {
        return true;
    };
    let os_name = current_os_name();
    let mut allowed = false;
    for rule in rules {
        let mut applies = true;
        if let Some(os) = &rule.os {
            if let Some(name) = &os.name {
                if name != os_name {
                    applies = false;
                }
            }
            if applies {
                if let Some(arch) = &os.arch {
                    if arch != std::env::consts::ARCH && !(arch == "x86" && std::env::consts::ARCH == "x86_64") {
                        applies = false;
                    }
                }
            }
        }
        if rule.features.is_some() {
            // feature-gated rules never apply to library selection
            applies = false;
        }
        if applies {
            allowed = rule.action == RuleAction::Allow;
        }
    }
    allowed
}

impl Library {
    pub fn applies_to_host(&self) -> bool {
        rules_allow(self.rules.as_deref())
    }

    /// Repository-relative path of the main artifact.
    pub fn artifact_path(&self) -> Option<String> {
        if let Some(downloads) = &self.downloads {
            if let Some(artifact) = &downloads.artifact {
                if let Some(path) = &artifact.path {
                    return Some(path.clone());
                }
            }
        }
        maven_to_path(&self.name)
    }

    /// Download URL of the main artifact, resolving bare maven coordinates
    /// against the library's repository base.
    pub fn artifact_url(&self, default_repo: &str) -> Option<String> {
        if let Some(downloads) = &self.downloads {
            if let Some(artifact) = &downloads.artifact {
                if artifact.url.is_empty() {
                    // empty URL marks embedded artifacts or processor outputs
                    return None;
                }
                return Some(artifact.url.clone());
            }
        }
        let repo = self.url.as_deref().unwrap_or(default_repo);
        let path = maven_to_path(&self.name)?;
        Some(format!("{}/{}", repo.trim_end_matches('/'), path))
    }

    pub fn artifact_sha1(&self) -> Option<String> {
        if let Some(downloads) = &self.downloads {
            if let Some(artifact) = &downloads.artifact {
                return artifact.sha1.clone();
            }
        }
        self.sha1.clone()
    }

    /// The native-classifier artifact for this host, when the library has a
    /// legacy `natives` table.
    pub fn native_artifact(&self) -> Option<&ArtifactRef> {
        let natives = self.natives.as_ref()?;
        let key = natives.get(current_os_name())?;
        let key = key.replace("${arch}", if cfg!(target_pointer_width = "64") { "64" } else { "32" });
        self.downloads.as_ref()?.classifiers.as_ref()?.get(&key)
    }
}

/// `group:artifact:version[:classifier][@ext]` → repository path.
pub fn maven_to_path(coordinate: &str) -> Option<String> {
    let (coordinate, ext) = match coordinate.split_once('@') {
        Some((c, e)) => (c, e),
        None => (coordinate, "jar"),
    };
    let parts: Vec<&str> = coordinate.split(':').collect();
    if parts.len() < 3 {
        return None;
    }
    let group = parts[0].replace('.', "/");
    let artifact = parts[1];
    let version = parts[2];
    let file = if parts.len() >= 4 {
        format!("{}-{}-{}.{}", artifact, version, parts[3], ext)
    } else {
        format!("{}-{}.{}", artifact, version, ext)
    };
    Some(format!("{}/{}/{}/{}", group, artifact, version, file))
}

/// Merge a loader version JSON over its vanilla parent, the way launchers
/// resolve `inheritsFrom`: child scalars win, argument lists append, child
/// libraries come first so the loader's picks shadow vanilla duplicates.
pub fn merge_versions(parent: &VersionJson, child: &VersionJson) -> VersionJson {
    let mut merged = parent.clone();
    merged.id = child.id.clone();
    merged.inherits_from = None;

    if child.main_class.is_some() {
        merged.main_class = child.main_class.clone();
    }
    if child.minecraft_arguments.is_some() {
        merged.minecraft_arguments = child.minecraft_arguments.clone();
    }
    if let Some(child_args) = &child.arguments {
        let mut args = merged.arguments.take().unwrap_or_default();
        args.game.extend(child_args.game.iter().cloned());
        args.jvm.extend(child_args.jvm.iter().cloned());
        merged.arguments = Some(args);
    }

    let mut libraries = child.libraries.clone();
    libraries.extend(parent.libraries.iter().cloned());
    merged.libraries = libraries;

    if child.java_version.is_some() {
        merged.java_version = child.java_version.clone();
    }
    if child.version_type.is_some() {
        merged.version_type = child.version_type.clone();
    }
    merged
}
