use crate::loader::version::{ArtifactRef, VersionJson};
use crate::loader::InstallCtx;
use crate::net::fetch::DownloadRequest;
use crate::utils::fsx;
use crate::utils::hash::{ExpectedHash, HashAlgo};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

const VERSION_MANIFEST_URL: &str =
    "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json";
const RESOURCES_URL: &str = "https://resources.download.minecraft.net";

#[derive(Debug, Deserialize)]
struct VersionManifest {
    versions: Vec<VersionManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct VersionManifestEntry {
    id: String,
    url: String,
    #[serde(default)]
    sha1: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssetIndex {
    objects: HashMap<String, AssetObject>,
}

#[derive(Debug, Deserialize)]
struct AssetObject {
    hash: String,
    size: u64,
}

/// Install the vanilla runtime: version JSON (cached), client jar,
/// libraries with host-rule filtering, and the asset tree. Returns the
/// parsed version document.
pub async fn install_vanilla(ctx: &InstallCtx<'_>, version_id: &str) -> Result<VersionJson> {
    let version = load_or_fetch_version_json(ctx, version_id).await?;

    let mut requests: Vec<DownloadRequest> = Vec::new();

    // client jar
    if let Some(downloads) = &version.downloads {
        requests.push(artifact_request(
            &downloads.client,
            ctx.config.versions_dir().join(format!("{}.jar", version_id)),
            format!("{}.jar", version_id),
        ));
    }

    // libraries, including native classifiers for this host
    let libraries_dir = ctx.config.libraries_dir();
    for library in version.libraries.iter().filter(|l| l.applies_to_host()) {
        if let Some(path) = library.artifact_path() {
            if let Some(url) = library.artifact_url("https://libraries.minecraft.net") {
                requests.push(DownloadRequest {
                    url,
                    target: libraries_dir.join(&path),
                    expected_hash: library.artifact_sha1().map(ExpectedHash::sha1),
                    size: None,
                    file_name: file_name_of(&path),
                    source_ids: None,
                });
            }
        }
        if let Some(native) = library.native_artifact() {
            if let Some(path) = &native.path {
                requests.push(artifact_request(
                    native,
                    libraries_dir.join(path),
                    file_name_of(path),
                ));
            }
        }
    }

    // asset index + objects
    if let Some(asset_index) = &version.asset_index {
        let index_path = ctx
            .config
            .assets_dir()
            .join("indexes")
            .join(format!("{}.json", asset_index.id));
        let index = load_or_fetch_asset_index(ctx, asset_index, &index_path).await?;

        let objects_dir = ctx.config.assets_dir().join("objects");
        for object in index.objects.values() {
            let prefix = &object.hash[..2];
            requests.push(DownloadRequest {
                url: format!("{}/{}/{}", RESOURCES_URL, prefix, object.hash),
                target: objects_dir.join(prefix).join(&object.hash),
                expected_hash: Some(ExpectedHash::new(HashAlgo::Sha1, object.hash.clone())),
                size: Some(object.size),
                file_name: object.hash.clone(),
                source_ids: None,
            });
        }
    }

    log::info!(
        "vanilla {}: {} artifacts to verify/fetch",
        version_id,
        requests.len()
    );
    let result = ctx
        .pool
        .run(requests.clone(), Some(ctx.phase), ctx.cancel)
        .await?;
    if !result.failed.is_empty() {
        return Err(crate::loader::fail_runtime_downloads(&requests, &result.failed));
    }

    Ok(version)
}

/// Version JSONs are cached under `meta/versions/<id>.json` and reused
/// across instances; only a missing cache hits the network.
pub async fn load_or_fetch_version_json(
    ctx: &InstallCtx<'_>,
    version_id: &str,
) -> Result<VersionJson> {
    let cache_path = ctx.config.versions_dir().join(format!("{}.json", version_id));
    if cache_path.exists() {
        let raw = std::fs::read_to_string(&cache_path)
            .with_context(|| format!("read cached version json {:?}", cache_path))?;
        match serde_json::from_str::<VersionJson>(&raw) {
            Ok(version) => {
                log::debug!("using cached version json for {}", version_id);
                return Ok(version);
            }
            Err(e) => {
                log::warn!(
                    "cached version json for {} is unreadable ({}), refetching",
                    version_id,
                    e
                );
            }
        }
    }

    log::info!("fetching version manifest for {}", version_id);
    let manifest: VersionManifest = ctx
        .client
        .get(VERSION_MANIFEST_URL)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
        .context("parse version manifest")?;

    let entry = manifest
        .versions
        .iter()
        .find(|v| v.id == version_id)
        .ok_or_else(|| anyhow::anyhow!("unknown minecraft version: {}", version_id))?;

    let raw = ctx
        .client
        .get(&entry.url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    if let Some(expected) = &entry.sha1 {
        let computed = crate::utils::hash::hash_bytes(&raw, HashAlgo::Sha1);
        if !ExpectedHash::sha1(expected.clone()).matches(&computed) {
            anyhow::bail!(
                "version json digest mismatch for {} (expected {}, got {})",
                version_id,
                expected,
                computed
            );
        }
    }

    let version: VersionJson =
        serde_json::from_slice(&raw).context("parse version json")?;
    fsx::write_atomic(&cache_path, &raw)?;
    Ok(version)
}

async fn load_or_fetch_asset_index(
    ctx: &InstallCtx<'_>,
    reference: &crate::loader::version::AssetIndexRef,
    cache_path: &std::path::Path,
) -> Result<AssetIndex> {
    if cache_path.exists() {
        if let Ok(raw) = std::fs::read(cache_path) {
            let computed = crate::utils::hash::hash_bytes(&raw, HashAlgo::Sha1);
            if ExpectedHash::sha1(reference.sha1.clone()).matches(&computed) {
                if let Ok(index) = serde_json::from_slice(&raw) {
                    return Ok(index);
                }
            }
        }
    }

    let raw = ctx
        .client
        .get(&reference.url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    fsx::write_atomic(cache_path, &raw)?;
    serde_json::from_slice(&raw).context("parse asset index")
}

fn artifact_request(artifact: &ArtifactRef, target: PathBuf, file_name: String) -> DownloadRequest {
    DownloadRequest {
        url: artifact.url.clone(),
        target,
        expected_hash: artifact.sha1.clone().map(ExpectedHash::sha1),
        size: artifact.size,
        file_name,
        source_ids: None,
    }
}

fn file_name_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}
