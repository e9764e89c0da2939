use crate::utils::fsx;
use crate::utils::hash::{hash_file, HashAlgo};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub last_seen: DateTime<Utc>,
}

/// Content-addressed blob store shared by all instances, keyed by SHA-256:
/// `meta/cache/<hh>/<hash>`. Writers stage to a temp name and rename, so
/// readers only ever see complete blobs. Entries accumulate until [`gc`].
#[derive(Debug)]
pub struct ContentCache {
    root: PathBuf,
    index: HashMap<String, CacheEntry>,
}

impl ContentCache {
    pub fn open(root: &Path) -> Result<Self> {
        let index_path = root.join(INDEX_FILE);
        let index = if index_path.exists() {
            let raw = std::fs::read_to_string(&index_path)
                .with_context(|| format!("read cache index {:?}", index_path))?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                log::warn!("cache index unreadable ({}), starting fresh", e);
                HashMap::new()
            })
        } else {
            HashMap::new()
        };
        Ok(Self {
            root: root.to_path_buf(),
            index,
        })
    }

    pub fn save(&self) -> Result<()> {
        fsx::write_atomic(
            &self.root.join(INDEX_FILE),
            &serde_json::to_vec_pretty(&self.index)?,
        )
    }

    pub fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..2]).join(hash)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blob_path(hash).is_file()
    }

    pub fn entry(&self, hash: &str) -> Option<&CacheEntry> {
        self.index.get(hash)
    }

    /// Ingest a file, returning its hash. The blob write goes through a
    /// sibling temp name and rename so concurrent ingests of identical
    /// content converge on one valid blob.
    pub fn store_file(&mut self, path: &Path, source_url: Option<String>) -> Result<String> {
        let hash = hash_file(path, HashAlgo::Sha256)?;
        let size = std::fs::metadata(path)?.len();
        let blob = self.blob_path(&hash);
        if !blob.exists() {
            let mut reader = std::io::BufReader::new(
                std::fs::File::open(path).with_context(|| format!("open {:?}", path))?,
            );
            fsx::write_atomic_from(&blob, &mut reader)?;
        }
        self.index.insert(
            hash.clone(),
            CacheEntry {
                hash: hash.clone(),
                size,
                source_url,
                last_seen: Utc::now(),
            },
        );
        Ok(hash)
    }

    pub fn store_bytes(&mut self, bytes: &[u8], source_url: Option<String>) -> Result<String> {
        let hash = crate::utils::hash::hash_bytes(bytes, HashAlgo::Sha256);
        let blob = self.blob_path(&hash);
        if !blob.exists() {
            fsx::write_atomic(&blob, bytes)?;
        }
        self.index.insert(
            hash.clone(),
            CacheEntry {
                hash: hash.clone(),
                size: bytes.len() as u64,
                source_url,
                last_seen: Utc::now(),
            },
        );
        Ok(hash)
    }

    /// Copy a blob to a destination; false when the blob is absent.
    pub fn restore(&mut self, hash: &str, dest: &Path) -> Result<bool> {
        let blob = self.blob_path(hash);
        if !blob.is_file() {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            fsx::ensure_dir(parent)?;
        }
        std::fs::copy(&blob, dest)
            .with_context(|| format!("restore blob {} -> {:?}", hash, dest))?;
        if let Some(entry) = self.index.get_mut(hash) {
            entry.last_seen = Utc::now();
        }
        Ok(true)
    }

    /// Verify that every blob's content matches its directory name; corrupt
    /// blobs are deleted and reported.
    pub fn verify(&mut self) -> Result<Vec<String>> {
        let mut corrupt = Vec::new();
        for hash in self.index.keys().cloned().collect::<Vec<_>>() {
            let blob = self.blob_path(&hash);
            if !blob.is_file() {
                continue;
            }
            let computed = hash_file(&blob, HashAlgo::Sha256)?;
            if computed != hash {
                log::warn!("cache blob corrupt: {} (content hashes to {})", hash, computed);
                let _ = std::fs::remove_file(&blob);
                self.index.remove(&hash);
                corrupt.push(hash);
            }
        }
        Ok(corrupt)
    }

    /// Drop blobs that no live reference claims.
    pub fn gc(&mut self, reachable: &HashSet<String>) -> Result<usize> {
        let doomed: Vec<String> = self
            .index
            .keys()
            .filter(|h| !reachable.contains(*h))
            .cloned()
            .collect();
        for hash in &doomed {
            let blob = self.blob_path(hash);
            if blob.exists() {
                std::fs::remove_file(&blob)
                    .with_context(|| format!("gc cache blob {:?}", blob))?;
            }
            self.index.remove(hash);
        }
        if !doomed.is_empty() {
            log::info!("cache gc removed {} blobs", doomed.len());
        }
        Ok(doomed.len())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_and_restore_round_trip() {
        let tmp = tempdir().unwrap();
        let mut cache = ContentCache::open(tmp.path()).unwrap();

        let hash = cache
            .store_bytes(b"mod contents", Some("https://cdn/x.jar".into()))
            .unwrap();
        assert!(cache.contains(&hash));

        let dest = tmp.path().join("restored.jar");
        assert!(cache.restore(&hash, &dest).unwrap());
        assert_eq!(std::fs::read(dest).unwrap(), b"mod contents");
    }

    #[test]
    fn blob_path_is_sharded_by_prefix() {
        let tmp = tempdir().unwrap();
        let mut cache = ContentCache::open(tmp.path()).unwrap();
        let hash = cache.store_bytes(b"x", None).unwrap();
        let path = cache.blob_path(&hash);
        assert!(path.starts_with(tmp.path().join(&hash[..2])));
        assert!(path.is_file());
    }

    #[test]
    fn cache_soundness_blob_matches_name() {
        let tmp = tempdir().unwrap();
        let mut cache = ContentCache::open(tmp.path()).unwrap();
        let hash = cache.store_bytes(b"sound", None).unwrap();
        let computed = hash_file(&cache.blob_path(&hash), HashAlgo::Sha256).unwrap();
        assert_eq!(computed, hash);
    }

    #[test]
    fn verify_evicts_corrupted_blob() {
        let tmp = tempdir().unwrap();
        let mut cache = ContentCache::open(tmp.path()).unwrap();
        let hash = cache.store_bytes(b"good bytes", None).unwrap();
        std::fs::write(cache.blob_path(&hash), b"tampered").unwrap();

        let corrupt = cache.verify().unwrap();
        assert_eq!(corrupt, vec![hash.clone()]);
        assert!(!cache.contains(&hash));
    }

    #[test]
    fn gc_keeps_reachable_blobs() {
        let tmp = tempdir().unwrap();
        let mut cache = ContentCache::open(tmp.path()).unwrap();
        let keep = cache.store_bytes(b"keep me", None).unwrap();
        let drop = cache.store_bytes(b"drop me", None).unwrap();

        let mut reachable = HashSet::new();
        reachable.insert(keep.clone());
        let removed = cache.gc(&reachable).unwrap();
        assert_eq!(removed, 1);
        assert!(cache.contains(&keep));
        assert!(!cache.contains(&drop));
    }

    #[test]
    fn index_survives_reopen() {
        let tmp = tempdir().unwrap();
        let hash = {
            let mut cache = ContentCache::open(tmp.path()).unwrap();
            let hash = cache
                .store_bytes(b"persistent", Some("https://cdn/p.jar".into()))
                .unwrap();
            cache.save().unwrap();
            hash
        };
        let cache = ContentCache::open(tmp.path()).unwrap();
        let entry = cache.entry(&hash).unwrap();
        assert_eq!(entry.source_url.as_deref(), Some("https://cdn/p.jar"));
    }
}
