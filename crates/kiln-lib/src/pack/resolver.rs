use crate::archive::PackArchive;
use crate::error::EngineError;
use crate::pack::types::{
    normalize_rel_path, CurseForgeManifest, FileKind, ModpackManifest, ModrinthIndex,
    OverridesBundle, PackInfo, ResolvedFile, SourceRef,
};
use crate::utils::hash::ExpectedHash;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// A parsed and normalized modpack: what it is, what to fetch, and the bytes
/// the archive itself supplies.
#[derive(Debug)]
pub struct ResolvedPack {
    pub info: PackInfo,
    pub manifest: ModpackManifest,
    /// Deduplicated by target path; overrides win over mod entries.
    pub files: Vec<ResolvedFile>,
    pub overrides: OverridesBundle,
}

impl ResolvedPack {
    /// The `(project_id, file_id)` pairs still needing URL resolution.
    pub fn pending_registry_refs(&self) -> Vec<(i64, i64)> {
        self.files
            .iter()
            .filter_map(|f| match (&f.source, &f.url) {
                (SourceRef::CurseForge { project_id, file_id }, None) => {
                    Some((*project_id, *file_id))
                }
                _ => None,
            })
            .collect()
    }
}

/// Detect and parse the descriptor inside a pack archive. Accepts the
/// descriptor at the root or nested one folder deep (packs zipped with a
/// wrapping directory); anything else is `UnknownManifest`.
pub fn parse_manifest(archive: &mut PackArchive) -> Result<(ModpackManifest, String)> {
    let entries = archive.entries()?;

    let mut modrinth_at: Option<String> = None;
    let mut curseforge_at: Option<String> = None;
    for entry in &entries {
        if let Some(prefix) = descriptor_prefix(&entry.path, "modrinth.index.json") {
            modrinth_at.get_or_insert(prefix);
        } else if let Some(prefix) = descriptor_prefix(&entry.path, "manifest.json") {
            curseforge_at.get_or_insert(prefix);
        }
    }

    // Modrinth wins when both are present; mrpacks re-exported from
    // CurseForge sometimes keep the old manifest around.
    if let Some(prefix) = modrinth_at {
        let raw = archive.read_entry(&format!("{}modrinth.index.json", prefix))?;
        let index: ModrinthIndex = serde_json::from_slice(&raw).map_err(|e| {
            anyhow::Error::from(EngineError::CorruptArchive(format!(
                "modrinth.index.json did not parse: {}",
                e
            )))
        })?;
        log::info!(
            "parsed modrinth index: {} v{} ({} files)",
            index.name,
            index.version_id,
            index.files.len()
        );
        return Ok((ModpackManifest::Modrinth(index), prefix));
    }

    if let Some(prefix) = curseforge_at {
        let raw = archive.read_entry(&format!("{}manifest.json", prefix))?;
        let manifest: CurseForgeManifest = serde_json::from_slice(&raw).map_err(|e| {
            anyhow::Error::from(EngineError::CorruptArchive(format!(
                "manifest.json did not parse: {}",
                e
            )))
        })?;
        log::info!(
            "parsed curseforge manifest: {} v{} ({} files)",
            manifest.name,
            manifest.version,
            manifest.files.len()
        );
        return Ok((ModpackManifest::CurseForge(manifest), prefix));
    }

    Err(anyhow::Error::from(EngineError::UnknownManifest))
}

/// Resolve a pack archive into a normalized plan plus its overrides bundle.
pub fn resolve_pack(path: &Path) -> Result<ResolvedPack> {
    let mut archive = PackArchive::open(path)?;
    let (manifest, prefix) = parse_manifest(&mut archive)?;
    let info = manifest.info().context("extract pack info")?;

    let mut plan: Vec<ResolvedFile> = Vec::new();
    match &manifest {
        ModpackManifest::CurseForge(m) => {
            for file in &m.files {
                plan.push(ResolvedFile {
                    kind: FileKind::Mod,
                    // provisional until the registry hands back a file name
                    target_path: format!("mods/{}", file.file_id),
                    url: None,
                    expected_hash: None,
                    size: None,
                    required: file.required,
                    restricted: false,
                    source: SourceRef::CurseForge {
                        project_id: file.project_id,
                        file_id: file.file_id,
                    },
                });
            }
        }
        ModpackManifest::Modrinth(idx) => {
            for file in &idx.files {
                if let Some(env) = &file.env {
                    if env.client == "unsupported" {
                        log::debug!("skipping server-only file {:?}", file.path);
                        continue;
                    }
                }
                let required = file
                    .env
                    .as_ref()
                    .map(|e| e.client != "optional")
                    .unwrap_or(true);
                let expected_hash = file
                    .hashes
                    .get("sha512")
                    .map(|h| ExpectedHash::sha512(h.clone()))
                    .or_else(|| file.hashes.get("sha1").map(|h| ExpectedHash::sha1(h.clone())));
                plan.push(ResolvedFile {
                    kind: FileKind::Mod,
                    target_path: normalize_rel_path(&file.path),
                    url: file.downloads.first().cloned(),
                    expected_hash,
                    size: (file.file_size > 0).then_some(file.file_size),
                    required,
                    restricted: false,
                    source: SourceRef::Modrinth,
                });
            }
        }
    }

    // Overrides: CurseForge names its folder in the manifest, Modrinth uses
    // overrides/ plus client-overrides/ (client wins on collision).
    let override_roots: Vec<String> = match &manifest {
        ModpackManifest::CurseForge(m) => vec![format!("{}{}/", prefix, m.overrides)],
        ModpackManifest::Modrinth(_) => vec![
            format!("{}overrides/", prefix),
            format!("{}client-overrides/", prefix),
        ],
    };

    let mut overrides = OverridesBundle::new();
    archive.for_each_entry(|name, size, reader| {
        for root in &override_roots {
            if let Some(rel) = name.strip_prefix(root.as_str()) {
                if rel.is_empty() {
                    continue;
                }
                let mut bytes = Vec::with_capacity(size as usize);
                reader
                    .read_to_end(&mut bytes)
                    .with_context(|| format!("read override entry {:?}", name))?;
                overrides.insert(rel.to_string(), bytes);
                break;
            }
        }
        Ok(())
    })?;

    for (rel, bytes) in overrides.iter() {
        plan.push(ResolvedFile {
            kind: FileKind::Override,
            target_path: rel.to_string(),
            url: None,
            expected_hash: None,
            size: Some(bytes.len() as u64),
            required: true,
            restricted: false,
            source: SourceRef::Archive,
        });
    }

    let files = dedup_by_target(plan);
    log::info!(
        "resolved pack {} v{}: {} planned files, {} override entries",
        info.name,
        info.version,
        files.len(),
        overrides.len()
    );

    Ok(ResolvedPack {
        info,
        manifest,
        files,
        overrides,
    })
}

/// Last definition per target path wins; iteration order already puts
/// overrides after mod entries.
fn dedup_by_target(plan: Vec<ResolvedFile>) -> Vec<ResolvedFile> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Option<ResolvedFile>> = Vec::with_capacity(plan.len());
    for file in plan {
        match index.get(&file.target_path) {
            Some(&slot) => out[slot] = Some(file),
            None => {
                index.insert(file.target_path.clone(), out.len());
                out.push(Some(file));
            }
        }
    }
    out.into_iter().flatten().collect()
}

fn descriptor_prefix(entry_path: &str, descriptor: &str) -> Option<String> {
    if entry_path == descriptor {
        return Some(String::new());
    }
    let suffix = format!("/{}", descriptor);
    entry_path.strip_suffix(&suffix).and_then(|prefix| {
        // only one wrapping folder deep
        if prefix.contains('/') {
            None
        } else {
            Some(format!("{}/", prefix))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::types::LoaderKind;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_pack(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ZipWriter::new(file);
        for (entry, bytes) in entries {
            writer
                .start_file(*entry, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    const CF_MANIFEST: &str = r#"{
        "minecraft": {
            "version": "1.20.1",
            "modLoaders": [{"id": "forge-47.2.0", "primary": true}],
            "recommendedRam": 6144
        },
        "manifestType": "minecraftModpack",
        "manifestVersion": 1,
        "name": "Test Pack",
        "version": "2.1.0",
        "author": "someone",
        "files": [
            {"projectID": 238222, "fileID": 4712858, "required": true},
            {"projectID": 248787, "fileID": 4633184, "required": false}
        ],
        "overrides": "overrides"
    }"#;

    const MR_INDEX: &str = r#"{
        "formatVersion": 1,
        "game": "minecraft",
        "versionId": "1.4.2",
        "name": "Fabric Pack",
        "files": [
            {
                "path": "mods/sodium.jar",
                "hashes": {"sha1": "aaaa", "sha512": "bbbb"},
                "downloads": ["https://cdn.modrinth.com/sodium.jar"],
                "fileSize": 1024
            },
            {
                "path": "mods/server-only.jar",
                "hashes": {"sha512": "cccc"},
                "env": {"client": "unsupported", "server": "required"},
                "downloads": ["https://cdn.modrinth.com/server-only.jar"],
                "fileSize": 10
            }
        ],
        "dependencies": {"minecraft": "1.20.1", "fabric-loader": "0.15.3"}
    }"#;

    #[test]
    fn resolves_curseforge_pack() {
        let tmp = tempdir().unwrap();
        let path = write_pack(
            tmp.path(),
            "pack.zip",
            &[
                ("manifest.json", CF_MANIFEST.as_bytes()),
                ("overrides/config/mod.toml", b"speed=2"),
                ("overrides/mods/bundled.jar", b"bundled"),
            ],
        );

        let pack = resolve_pack(&path).unwrap();
        assert_eq!(pack.info.name, "Test Pack");
        assert_eq!(pack.info.loader.kind, LoaderKind::Forge);
        assert_eq!(pack.info.loader.version, "47.2.0");
        assert_eq!(pack.info.recommended_ram_mb, Some(6144));

        // two mods pending URL resolution, two overrides
        assert_eq!(pack.pending_registry_refs().len(), 2);
        assert!(pack.overrides.contains("config/mod.toml"));
        assert!(pack.overrides.contains("mods/bundled.jar"));
        assert_eq!(
            pack.files
                .iter()
                .filter(|f| f.kind == FileKind::Override)
                .count(),
            2
        );
    }

    #[test]
    fn resolves_modrinth_pack_and_drops_server_only() {
        let tmp = tempdir().unwrap();
        let path = write_pack(
            tmp.path(),
            "pack.mrpack",
            &[(
                "modrinth.index.json",
                MR_INDEX.as_bytes(),
            )],
        );

        let pack = resolve_pack(&path).unwrap();
        assert_eq!(pack.info.loader.kind, LoaderKind::Fabric);
        assert_eq!(pack.files.len(), 1);
        let file = &pack.files[0];
        assert_eq!(file.target_path, "mods/sodium.jar");
        assert_eq!(file.url.as_deref(), Some("https://cdn.modrinth.com/sodium.jar"));
        // sha512 preferred over sha1
        assert_eq!(file.expected_hash.as_ref().unwrap().hex, "bbbb");
        assert!(pack.pending_registry_refs().is_empty());
    }

    #[test]
    fn accepts_descriptor_nested_one_level() {
        let tmp = tempdir().unwrap();
        let path = write_pack(
            tmp.path(),
            "wrapped.zip",
            &[
                ("Test Pack/manifest.json", CF_MANIFEST.as_bytes()),
                ("Test Pack/overrides/config/a.toml", b"x"),
            ],
        );
        let pack = resolve_pack(&path).unwrap();
        assert_eq!(pack.info.name, "Test Pack");
        assert!(pack.overrides.contains("config/a.toml"));
    }

    #[test]
    fn rejects_archive_without_descriptor() {
        let tmp = tempdir().unwrap();
        let path = write_pack(tmp.path(), "nope.zip", &[("readme.txt", b"hello")]);
        let err = resolve_pack(&path).unwrap_err();
        assert!(matches!(
            EngineError::classify(err),
            EngineError::UnknownManifest
        ));
    }

    #[test]
    fn overrides_win_over_mod_entries_on_same_target() {
        let tmp = tempdir().unwrap();
        // Modrinth file targets mods/sodium.jar; overrides also carries it
        let path = write_pack(
            tmp.path(),
            "pack.mrpack",
            &[
                ("modrinth.index.json", MR_INDEX.as_bytes()),
                ("overrides/mods/sodium.jar", b"patched"),
            ],
        );
        let pack = resolve_pack(&path).unwrap();
        let entry = pack
            .files
            .iter()
            .find(|f| f.target_path == "mods/sodium.jar")
            .unwrap();
        assert_eq!(entry.kind, FileKind::Override);
        assert_eq!(pack.files.iter().filter(|f| f.target_path == "mods/sodium.jar").count(), 1);
    }

    #[test]
    fn inject_then_resolve_sees_injected_override() {
        let tmp = tempdir().unwrap();
        let input = write_pack(
            tmp.path(),
            "pack.zip",
            &[("manifest.json", CF_MANIFEST.as_bytes())],
        );
        let output = tmp.path().join("pack-with-user.zip");
        let mut bundle = OverridesBundle::new();
        bundle.insert("restricted-mod.jar", b"user supplied".to_vec());
        crate::archive::inject(&input, &output, &bundle).unwrap();

        let pack = resolve_pack(&output).unwrap();
        assert_eq!(
            pack.overrides.get("mods/restricted-mod.jar"),
            Some(&b"user supplied"[..])
        );
    }
}
