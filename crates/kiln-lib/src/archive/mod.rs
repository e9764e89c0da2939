use crate::error::EngineError;
use crate::pack::types::{normalize_rel_path, OverridesBundle};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

// Injected entries at or above this size are stored uncompressed; jars and
// zips are already compressed and recompressing them wastes time for nothing.
const STORE_THRESHOLD: usize = 4 * 1024 * 1024;

/// Metadata for one archive entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

/// A modpack archive opened for streaming reads. Entries are decompressed on
/// demand; nothing is held in memory beyond the central directory.
#[derive(Debug)]
pub struct PackArchive {
    archive: ZipArchive<File>,
    path: PathBuf,
}

impl PackArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open archive {:?}", path))?;
        let archive = ZipArchive::new(file).map_err(|e| {
            anyhow::Error::from(EngineError::CorruptArchive(format!(
                "{}: {}",
                path.display(),
                e
            )))
        })?;
        Ok(Self {
            archive,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.len() == 0
    }

    /// List entry metadata without decompressing anything.
    pub fn entries(&mut self) -> Result<Vec<EntryInfo>> {
        let mut out = Vec::with_capacity(self.archive.len());
        for i in 0..self.archive.len() {
            let entry = self
                .archive
                .by_index(i)
                .map_err(|e| corrupt(&self.path, e))?;
            out.push(EntryInfo {
                path: normalize_rel_path(entry.name()),
                size: entry.size(),
                is_dir: entry.is_dir(),
            });
        }
        Ok(out)
    }

    /// Visit every file entry lazily with a streaming reader. The closure
    /// decides per entry whether to consume the reader.
    pub fn for_each_entry<F>(&mut self, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, u64, &mut dyn Read) -> Result<()>,
    {
        for i in 0..self.archive.len() {
            let mut entry = self
                .archive
                .by_index(i)
                .map_err(|e| corrupt(&self.path, e))?;
            if entry.is_dir() {
                continue;
            }
            let name = normalize_rel_path(entry.name());
            let size = entry.size();
            visit(&name, size, &mut entry)?;
        }
        Ok(())
    }

    /// Read one entry fully into memory.
    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        let wanted = normalize_rel_path(name);
        for i in 0..self.archive.len() {
            let mut entry = self
                .archive
                .by_index(i)
                .map_err(|e| corrupt(&self.path, e))?;
            if normalize_rel_path(entry.name()) == wanted {
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut bytes)
                    .with_context(|| format!("read archive entry {:?}", wanted))?;
                return Ok(bytes);
            }
        }
        anyhow::bail!("archive entry not found: {:?}", wanted)
    }

    /// Extract entries matching a predicate into `dest`, preserving relative
    /// paths. Entries that escape the destination are skipped.
    pub fn extract_filtered<F>(&mut self, dest: &Path, filter: F) -> Result<Vec<PathBuf>>
    where
        F: Fn(&str) -> bool,
    {
        let mut extracted = Vec::new();
        for i in 0..self.archive.len() {
            let mut entry = self
                .archive
                .by_index(i)
                .map_err(|e| corrupt(&self.path, e))?;
            let name = normalize_rel_path(entry.name());
            if !filter(&name) {
                continue;
            }

            let Some(enclosed) = entry.enclosed_name() else {
                log::warn!("skipping archive entry with unsafe path: {:?}", entry.name());
                continue;
            };
            let out_path = dest.join(enclosed);

            if entry.is_dir() {
                std::fs::create_dir_all(&out_path)?;
                continue;
            }

            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)
                .with_context(|| format!("create extracted file {:?}", out_path))?;
            std::io::copy(&mut entry, &mut out)
                .with_context(|| format!("extract {:?}", name))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
                }
            }

            extracted.push(out_path);
        }
        Ok(extracted)
    }
}

/// Build a new archive that carries every entry of `input` plus the bundle's
/// files appended under `overrides/`. Routing by extension: `.jar` lands in
/// `overrides/mods/`, `.zip` in `overrides/resourcepacks/`, anything else is
/// skipped with a warning. Passthrough entries are raw-copied so their
/// compressed bytes, CRC and sizes are untouched.
pub fn inject(input: &Path, output: &Path, additions: &OverridesBundle) -> Result<()> {
    let in_file = File::open(input).with_context(|| format!("open archive {:?}", input))?;
    let mut archive = ZipArchive::new(in_file).map_err(|e| corrupt(input, e))?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let out_file =
        File::create(output).with_context(|| format!("create archive {:?}", output))?;
    let mut writer = ZipWriter::new(out_file);

    let mut routed: Vec<(String, &[u8])> = Vec::new();
    for (path, bytes) in additions.iter() {
        match route_injected_path(path) {
            Some(target) => routed.push((target, bytes)),
            None => log::warn!("not injecting {:?}: unsupported file type", path),
        }
    }

    let replaced: std::collections::HashSet<&str> =
        routed.iter().map(|(p, _)| p.as_str()).collect();

    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| corrupt(input, e))?;
        if replaced.contains(normalize_rel_path(entry.name()).as_str()) {
            // the injected version wins
            continue;
        }
        writer
            .raw_copy_file(entry)
            .context("copy passthrough entry")?;
    }

    for (target, bytes) in routed {
        let method = if bytes.len() >= STORE_THRESHOLD || is_precompressed(&target) {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        let options = SimpleFileOptions::default()
            .compression_method(method)
            .large_file(bytes.len() as u64 >= u32::MAX as u64);
        writer
            .start_file(target.as_str(), options)
            .with_context(|| format!("start injected entry {:?}", target))?;
        writer
            .write_all(bytes)
            .with_context(|| format!("write injected entry {:?}", target))?;
        log::debug!("injected {:?} ({} bytes)", target, bytes.len());
    }

    writer.finish().context("finalize injected archive")?;
    Ok(())
}

/// Decide where a user-supplied file belongs inside the archive, by
/// extension. Returns `None` for types the engine does not route.
pub fn route_injected_path(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".jar") {
        Some(format!("overrides/mods/{}", name))
    } else if lower.ends_with(".zip") {
        Some(format!("overrides/resourcepacks/{}", name))
    } else {
        None
    }
}

fn is_precompressed(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".jar") || lower.ends_with(".zip")
}

fn corrupt(path: &Path, err: zip::result::ZipError) -> anyhow::Error {
    anyhow::Error::from(EngineError::CorruptArchive(format!(
        "{}: {}",
        path.display(),
        err
    )))
}
