use crate::config::EngineConfig;
use crate::instance::metadata::{InstanceMetadata, InstanceStatus};
use crate::pack::types::normalize_rel_path;
use crate::utils::fsx;
use crate::utils::hash::{hash_file, ExpectedHash, HashAlgo};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const METADATA_FILE: &str = "instance.json";

/// Commit order for the upstream-owned subtrees. Anything staged outside
/// these trees is placed file-by-file before the journal write.
const COMMIT_SUBTREES: &[&str] = &["mods", "config", "scripts", "resourcepacks"];

/// Owner of the on-disk instance tree and its metadata journal. All
/// mutations stage into `<id>.staging/` and land via ordered renames; the
/// journal write is always last so a crash is detectable.
#[derive(Debug, Clone)]
pub struct InstanceStore {
    config: EngineConfig,
}

impl InstanceStore {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.config.instance_dir(id)
    }

    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.instance_dir(id).join(METADATA_FILE)
    }

    pub fn read_metadata(&self, id: &str) -> Result<Option<InstanceMetadata>> {
        let path = self.metadata_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read journal {:?}", path))?;
        let meta =
            serde_json::from_str(&raw).with_context(|| format!("parse journal {:?}", path))?;
        Ok(Some(meta))
    }

    pub fn write_metadata(&self, meta: &InstanceMetadata) -> Result<()> {
        fsx::write_atomic(
            &self.metadata_path(&meta.id),
            &serde_json::to_vec_pretty(meta)?,
        )
    }

    /// Derive the persisted status. The journal being present means
    /// installed; staging or half-committed residue means a crashed
    /// operation; a version mismatch against the latest known manifest
    /// means outdated.
    pub fn status(&self, id: &str, latest_version: Option<&str>) -> Result<InstanceStatus> {
        let has_residue = self.config.staging_dir(id).exists() || self.has_commit_residue(id);
        let meta = self.read_metadata(id)?;
        Ok(match meta {
            None => {
                if has_residue {
                    InstanceStatus::Error
                } else {
                    InstanceStatus::NotInstalled
                }
            }
            Some(meta) => {
                if has_residue {
                    InstanceStatus::Error
                } else if latest_version.map(|v| v != meta.installed_version).unwrap_or(false) {
                    InstanceStatus::Outdated
                } else {
                    InstanceStatus::Installed
                }
            }
        })
    }

    fn has_commit_residue(&self, id: &str) -> bool {
        let dir = self.instance_dir(id);
        COMMIT_SUBTREES
            .iter()
            .any(|tree| dir.join(format!("{}.old", tree)).exists())
    }

    /// Start (or restart) a staging area for a mutating operation. Leftover
    /// staging from a crashed run is discarded; the operation rebuilds it
    /// from scratch, which is what makes repair idempotent.
    pub fn begin_staging(&self, id: &str) -> Result<StagingArea> {
        let root = self.config.staging_dir(id);
        fsx::remove_dir_if_exists(&root)?;
        fsx::ensure_dir(&root)?;
        log::debug!("staging area ready: {:?}", root);
        Ok(StagingArea { root })
    }

    /// Commit a fully built staging area: swap the governed subtrees in
    /// order, place loose staged entries, then write the journal. The
    /// journal is last, so `installed_version` only ever names a tree that
    /// is completely in place.
    pub fn commit_staged(
        &self,
        staging: StagingArea,
        meta: &InstanceMetadata,
    ) -> Result<()> {
        let instance_dir = self.instance_dir(&meta.id);
        fsx::ensure_dir(&instance_dir)?;

        for tree in COMMIT_SUBTREES {
            let staged = staging.root.join(tree);
            if !staged.exists() {
                continue;
            }
            let live = instance_dir.join(tree);
            let old = instance_dir.join(format!("{}.old", tree));
            fsx::remove_dir_if_exists(&old)?;
            if live.exists() {
                fsx::move_dir(&live, &old)
                    .with_context(|| format!("set aside live subtree {}", tree))?;
            }
            fsx::move_dir(&staged, &live)
                .with_context(|| format!("commit subtree {}", tree))?;
            fsx::remove_dir_if_exists(&old)?;
            log::debug!("committed subtree {}/{}", meta.id, tree);
        }

        // loose staged entries (overrides outside the governed trees)
        for entry in std::fs::read_dir(&staging.root)
            .with_context(|| format!("read staging {:?}", staging.root))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let target = instance_dir.join(&name);
            if entry.file_type()?.is_dir() {
                fsx::copy_dir_recursive(&entry.path(), &target)?;
            } else {
                let bytes = std::fs::read(entry.path())?;
                fsx::write_atomic(&target, &bytes)?;
            }
        }

        self.write_metadata(meta)?;
        fsx::remove_dir_if_exists(&staging.root)?;
        log::info!(
            "committed instance {} at version {}",
            meta.id,
            meta.installed_version
        );
        Ok(())
    }

    /// Delete crash residue (`*.old` trees, stale staging) without touching
    /// live content.
    pub fn clean_residue(&self, id: &str) -> Result<()> {
        fsx::remove_dir_if_exists(&self.config.staging_dir(id))?;
        let dir = self.instance_dir(id);
        for tree in COMMIT_SUBTREES {
            fsx::remove_dir_if_exists(&dir.join(format!("{}.old", tree)))?;
        }
        Ok(())
    }

    pub fn remove_instance(&self, id: &str) -> Result<()> {
        self.clean_residue(id)?;
        fsx::remove_dir_if_exists(&self.instance_dir(id))?;
        log::info!("removed instance {}", id);
        Ok(())
    }

    /// Offline verification: re-hash every managed file against the digests
    /// the journal recorded. Returns the diverging paths.
    pub fn verify_managed(&self, meta: &InstanceMetadata) -> Result<Vec<String>> {
        let dir = self.instance_dir(&meta.id);
        let mut divergent = Vec::new();
        for managed in &meta.managed_files {
            let on_disk = dir.join(&managed.path);
            if !on_disk.is_file() {
                divergent.push(managed.path.clone());
                continue;
            }
            let expected = if let Some(sha512) = &managed.sha512 {
                Some(ExpectedHash::sha512(sha512.clone()))
            } else {
                managed.sha1.clone().map(ExpectedHash::sha1)
            };
            if let Some(expected) = expected {
                let computed = hash_file(&on_disk, expected.algo)?;
                if !expected.matches(&computed) {
                    divergent.push(managed.path.clone());
                }
            }
        }
        Ok(divergent)
    }

    /// Hash an instance file the engine last installed, for modified-or-not
    /// decisions in the protection merge. None when the file is absent.
    pub fn disk_hash(&self, id: &str, rel: &str, algo: HashAlgo) -> Result<Option<String>> {
        let path = self.instance_dir(id).join(rel);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(hash_file(&path, algo)?))
    }

    pub fn list_instances(&self) -> Result<Vec<String>> {
        let dir = self.config.instances_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".staging") {
                continue;
            }
            out.push(name);
        }
        out.sort();
        Ok(out)
    }
}

/// A partially built next version of an instance tree. Paths are instance-
/// relative with forward slashes.
#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, rel: &str) -> PathBuf {
        self.root.join(normalize_rel_path(rel))
    }

    pub fn write_file(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        fsx::write_atomic(&self.path_for(rel), bytes)
    }

    pub fn copy_in(&self, src: &Path, rel: &str) -> Result<()> {
        let dest = self.path_for(rel);
        if let Some(parent) = dest.parent() {
            fsx::ensure_dir(parent)?;
        }
        std::fs::copy(src, &dest)
            .with_context(|| format!("stage {:?} as {:?}", src, rel))?;
        Ok(())
    }

    pub fn contains(&self, rel: &str) -> bool {
        self.path_for(rel).exists()
    }

    /// Ensure a governed subtree exists in staging even when empty, so the
    /// commit swap replaces the live one.
    pub fn ensure_subtree(&self, tree: &str) -> Result<()> {
        fsx::ensure_dir(&self.root.join(tree))
    }
}
