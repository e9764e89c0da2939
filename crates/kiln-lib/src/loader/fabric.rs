use crate::loader::version::{merge_versions, VersionJson};
use crate::loader::{InstallCtx, ModloaderInstaller};
use crate::net::fetch::DownloadRequest;
use crate::pack::types::LoaderSpec;
use crate::utils::hash::ExpectedHash;
use anyhow::{Context, Result};
use futures::future::BoxFuture;

const FABRIC_META_URL: &str = "https://meta.fabricmc.net/v2";
const FABRIC_MAVEN_URL: &str = "https://maven.fabricmc.net";
const QUILT_META_URL: &str = "https://meta.quiltmc.org/v3";
const QUILT_MAVEN_URL: &str = "https://maven.quiltmc.org/repository/release";

pub struct FabricInstaller;
pub struct QuiltInstaller;

impl ModloaderInstaller for FabricInstaller {
    fn install<'a>(
        &'a self,
        ctx: &'a InstallCtx<'a>,
        minecraft_version: &'a str,
        loader: &'a LoaderSpec,
        vanilla: &'a VersionJson,
    ) -> BoxFuture<'a, Result<VersionJson>> {
        Box::pin(install_fabric_like(
            ctx,
            minecraft_version,
            loader,
            vanilla,
            "Fabric",
            FABRIC_META_URL,
            FABRIC_MAVEN_URL,
        ))
    }
}

impl ModloaderInstaller for QuiltInstaller {
    fn install<'a>(
        &'a self,
        ctx: &'a InstallCtx<'a>,
        minecraft_version: &'a str,
        loader: &'a LoaderSpec,
        vanilla: &'a VersionJson,
    ) -> BoxFuture<'a, Result<VersionJson>> {
        Box::pin(install_fabric_like(
            ctx,
            minecraft_version,
            loader,
            vanilla,
            "Quilt",
            QUILT_META_URL,
            QUILT_MAVEN_URL,
        ))
    }
}

/// Fabric and Quilt share the same meta service shape: a profile JSON with
/// bare maven-coordinate libraries resolved off the loader's repository.
async fn install_fabric_like(
    ctx: &InstallCtx<'_>,
    minecraft_version: &str,
    loader: &LoaderSpec,
    vanilla: &VersionJson,
    loader_name: &str,
    meta_base: &str,
    maven_base: &str,
) -> Result<VersionJson> {
    log::info!(
        "installing {} loader {} for minecraft {}",
        loader_name,
        loader.version,
        minecraft_version
    );

    let profile_url = format!(
        "{}/versions/loader/{}/{}/profile/json",
        meta_base, minecraft_version, loader.version
    );
    let profile: VersionJson = ctx
        .client
        .get(&profile_url)
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("{} meta rejected {}", loader_name, profile_url))?
        .json()
        .await
        .with_context(|| format!("parse {} profile json", loader_name))?;

    let libraries_dir = ctx.config.libraries_dir();
    let mut requests = Vec::new();
    for library in profile.libraries.iter().filter(|l| l.applies_to_host()) {
        let Some(path) = library.artifact_path() else {
            log::warn!("{} library has no resolvable path: {}", loader_name, library.name);
            continue;
        };
        let Some(url) = library.artifact_url(maven_base) else {
            continue;
        };
        requests.push(DownloadRequest {
            url,
            target: libraries_dir.join(&path),
            expected_hash: library.artifact_sha1().map(ExpectedHash::sha1),
            size: None,
            file_name: path.rsplit('/').next().unwrap_or(&path).to_string(),
            source_ids: None,
        });
    }

    log::info!("{}: {} loader libraries", loader_name, requests.len());
    let result = ctx
        .pool
        .run(requests.clone(), Some(ctx.phase), ctx.cancel)
        .await?;
    if !result.failed.is_empty() {
        return Err(crate::loader::fail_runtime_downloads(&requests, &result.failed));
    }

    Ok(merge_versions(vanilla, &profile))
}
