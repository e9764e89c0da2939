use std::collections::HashSet;

/// The per-instance relaxation flags from the metadata journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionFlags {
    pub allow_custom_mods: bool,
    pub allow_custom_resourcepacks: bool,
    pub allow_custom_configs: bool,
}

impl Default for ProtectionFlags {
    fn default() -> Self {
        Self {
            allow_custom_mods: true,
            allow_custom_resourcepacks: true,
            allow_custom_configs: true,
        }
    }
}

/// What a path means to an update/repair/reinstall pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Declared upstream, matching flag is off: upstream bytes win
    UpstreamProtected,
    /// Declared upstream, matching flag is on: a user edit survives
    UpstreamRelaxed,
    /// Not declared upstream: never touched
    UserTerritory,
    /// Saves, screenshots, shaders, logs, options.txt: always preserved
    Aesthetic,
}

/// What to do with one on-disk path during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    ReplaceWithUpstream,
    KeepExisting,
}

const AESTHETIC_PREFIXES: &[&str] = &["shaderpacks/", "screenshots/", "saves/", "logs/"];
const AESTHETIC_FILES: &[&str] = &["options.txt"];

/// The derived protection manifest for one operation: the set of paths the
/// current upstream pack declares. Re-derived on every operation, never
/// persisted.
#[derive(Debug, Clone)]
pub struct ProtectionManifest {
    upstream_paths: HashSet<String>,
    flags: ProtectionFlags,
}

impl ProtectionManifest {
    pub fn new(upstream_paths: HashSet<String>, flags: ProtectionFlags) -> Self {
        Self {
            upstream_paths,
            flags,
        }
    }

    pub fn classify(&self, path: &str) -> PathClass {
        if AESTHETIC_FILES.contains(&path)
            || AESTHETIC_PREFIXES.iter().any(|p| path.starts_with(p))
        {
            return PathClass::Aesthetic;
        }
        if !self.upstream_paths.contains(path) {
            return PathClass::UserTerritory;
        }
        let relaxed = if path.starts_with("mods/") {
            self.flags.allow_custom_mods
        } else if path.starts_with("resourcepacks/") {
            self.flags.allow_custom_resourcepacks
        } else if path.starts_with("config/") || path.starts_with("scripts/") {
            self.flags.allow_custom_configs
        } else {
            // upstream-declared paths outside the four governed trees follow
            // the strictest rule
            false
        };
        if relaxed {
            PathClass::UpstreamRelaxed
        } else {
            PathClass::UpstreamProtected
        }
    }

    /// Decide the fate of one path. `user_modified` says whether the on-disk
    /// bytes differ from what the engine last installed; `forced` is the
    /// reinstall mode that ignores relaxation.
    pub fn decide(&self, path: &str, user_modified: bool, forced: bool) -> MergeAction {
        match self.classify(path) {
            PathClass::Aesthetic | PathClass::UserTerritory => MergeAction::KeepExisting,
            PathClass::UpstreamProtected => MergeAction::ReplaceWithUpstream,
            PathClass::UpstreamRelaxed => {
                if forced || !user_modified {
                    MergeAction::ReplaceWithUpstream
                } else {
                    MergeAction::KeepExisting
                }
            }
        }
    }

    /// Whether an old managed file that disappeared from the new plan may be
    /// deleted during update cleanup.
    pub fn may_remove_stale(&self, path: &str) -> bool {
        !matches!(
            self.classify_for_removal(path),
            PathClass::Aesthetic
        )
    }

    fn classify_for_removal(&self, path: &str) -> PathClass {
        if AESTHETIC_FILES.contains(&path)
            || AESTHETIC_PREFIXES.iter().any(|p| path.starts_with(p))
        {
            PathClass::Aesthetic
        } else {
            PathClass::UserTerritory
        }
    }

    pub fn upstream_paths(&self) -> &HashSet<String> {
        &self.upstream_paths
    }
}
