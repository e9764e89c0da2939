pub mod fabric;
pub mod forge;
pub mod jre;
pub mod vanilla;
pub mod version;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::net::fetch::{CancelToken, DownloadRequest, FailReason, FetchPool};
use crate::pack::types::{LoaderKind, LoaderSpec};
use crate::progress::PhaseHandle;
use anyhow::Result;
use futures::future::BoxFuture;
use reqwest::Client;
use std::path::PathBuf;
use version::VersionJson;

/// Everything a loader installer needs, borrowed for the duration of one
/// install operation.
pub struct InstallCtx<'a> {
    pub config: &'a EngineConfig,
    pub client: &'a Client,
    pub pool: &'a FetchPool,
    pub phase: &'a PhaseHandle,
    pub cancel: &'a CancelToken,
}

/// A fully installed runtime: the merged version document (cached on disk)
/// plus the java executable that can run it. After this exists, launching
/// needs no network.
#[derive(Debug, Clone)]
pub struct InstalledRuntime {
    pub installed_id: String,
    pub version: VersionJson,
    pub java_path: PathBuf,
}

/// One implementation per loader family; vanilla is the no-op case handled
/// by the dispatcher itself.
pub trait ModloaderInstaller: Send + Sync {
    fn install<'a>(
        &'a self,
        ctx: &'a InstallCtx<'a>,
        minecraft_version: &'a str,
        loader: &'a LoaderSpec,
        vanilla: &'a VersionJson,
    ) -> BoxFuture<'a, Result<VersionJson>>;
}

fn installer_for(kind: LoaderKind) -> Option<Box<dyn ModloaderInstaller>> {
    match kind {
        LoaderKind::Vanilla => None,
        LoaderKind::Fabric => Some(Box::new(fabric::FabricInstaller)),
        LoaderKind::Quilt => Some(Box::new(fabric::QuiltInstaller)),
        LoaderKind::Forge => Some(Box::new(forge::ForgeInstaller)),
        LoaderKind::NeoForge => Some(Box::new(forge::NeoForgeInstaller)),
    }
}

/// Install the Minecraft runtime plus the requested loader into the shared
/// meta tree. Idempotent: everything is keyed by version/hash and verified
/// before being re-fetched.
pub async fn install_runtime(
    ctx: &InstallCtx<'_>,
    minecraft_version: &str,
    loader: &LoaderSpec,
) -> Result<InstalledRuntime> {
    log::info!(
        "installing runtime: minecraft {} with {:?} {}",
        minecraft_version,
        loader.kind,
        loader.version
    );

    let vanilla = vanilla::install_vanilla(ctx, minecraft_version).await?;

    let java_major = vanilla
        .java_version
        .as_ref()
        .map(|j| j.major_version)
        .unwrap_or(8);
    let java_path = jre::ensure_jre(ctx, java_major).await?;

    let installed_id = loader.installed_version_id(minecraft_version);
    let version = match installer_for(loader.kind) {
        None => vanilla,
        Some(installer) => {
            let merged = installer
                .install(ctx, minecraft_version, loader, &vanilla)
                .await?;
            // cache the merged document so launch resolves without network
            let merged_path = ctx.config.versions_dir().join(format!("{}.json", installed_id));
            crate::utils::fsx::write_atomic(&merged_path, &serde_json::to_vec_pretty(&merged)?)?;
            merged
        }
    };

    Ok(InstalledRuntime {
        installed_id,
        version,
        java_path,
    })
}

/// Load a previously installed runtime from the version cache, network-free.
pub fn load_installed_runtime(
    config: &EngineConfig,
    minecraft_version: &str,
    loader: &LoaderSpec,
) -> Result<InstalledRuntime> {
    let installed_id = loader.installed_version_id(minecraft_version);
    let path = config.versions_dir().join(format!("{}.json", installed_id));
    let raw = std::fs::read(&path).map_err(|_| {
        anyhow::Error::from(EngineError::LoaderIncomplete(format!(
            "version document {}",
            installed_id
        )))
    })?;
    let version: VersionJson = serde_json::from_str(&String::from_utf8_lossy(&raw))?;

    let java_major = version
        .java_version
        .as_ref()
        .map(|j| j.major_version)
        .unwrap_or(8);
    let java_path = jre::find_installed_java(config, java_major)
        .ok_or_else(|| EngineError::LoaderIncomplete(format!("java runtime {}", java_major)))?;

    Ok(InstalledRuntime {
        installed_id,
        version,
        java_path,
    })
}

/// Turn download-pool failures inside the runtime phase into the fatal
/// errors the loader contract demands.
pub(crate) fn fail_runtime_downloads(
    requests: &[DownloadRequest],
    failed: &[crate::net::fetch::FailedMod],
) -> anyhow::Error {
    let first = &failed[0];
    let name = first.file_name.clone().unwrap_or_else(|| "library".into());
    match first.reason {
        FailReason::HashMismatch => {
            let expected = requests
                .iter()
                .find(|r| Some(&r.file_name) == first.file_name.as_ref())
                .and_then(|r| r.expected_hash.as_ref())
                .map(|h| h.hex.clone())
                .unwrap_or_default();
            anyhow::Error::from(EngineError::HashMismatch {
                file: name,
                expected,
                actual: "retries exhausted".into(),
            })
        }
        _ => anyhow::Error::from(EngineError::LoaderIncomplete(name)),
    }
}
