use crate::archive::PackArchive;
use crate::loader::version::{maven_to_path, merge_versions, Library, VersionJson};
use crate::loader::{InstallCtx, ModloaderInstaller};
use crate::net::fetch::DownloadRequest;
use crate::pack::types::{LoaderKind, LoaderSpec};
use crate::utils::fsx;
use crate::utils::hash::ExpectedHash;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const FORGE_MAVEN_URL: &str = "https://maven.minecraftforge.net";
const NEOFORGE_MAVEN_URL: &str = "https://maven.neoforged.net/releases";

pub struct ForgeInstaller;
pub struct NeoForgeInstaller;

impl ModloaderInstaller for ForgeInstaller {
    fn install<'a>(
        &'a self,
        ctx: &'a InstallCtx<'a>,
        minecraft_version: &'a str,
        loader: &'a LoaderSpec,
        vanilla: &'a VersionJson,
    ) -> BoxFuture<'a, Result<VersionJson>> {
        Box::pin(install_forge_like(ctx, minecraft_version, loader, vanilla))
    }
}

impl ModloaderInstaller for NeoForgeInstaller {
    fn install<'a>(
        &'a self,
        ctx: &'a InstallCtx<'a>,
        minecraft_version: &'a str,
        loader: &'a LoaderSpec,
        vanilla: &'a VersionJson,
    ) -> BoxFuture<'a, Result<VersionJson>> {
        Box::pin(install_forge_like(ctx, minecraft_version, loader, vanilla))
    }
}

/// Modern Forge/NeoForge installer profile (`install_profile.json`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallProfile {
    #[serde(default)]
    data: HashMap<String, SidedValue>,
    #[serde(default)]
    processors: Vec<Processor>,
    #[serde(default)]
    libraries: Vec<Library>,
    /// Pre-1.13 installers instead embed the whole version document here
    #[serde(default)]
    version_info: Option<VersionJson>,
    #[serde(default)]
    install: Option<LegacyInstallSection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyInstallSection {
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SidedValue {
    client: String,
    #[allow(dead_code)]
    server: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Processor {
    jar: String,
    #[serde(default)]
    classpath: Vec<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    sides: Option<Vec<String>>,
}

impl Processor {
    fn runs_on_client(&self) -> bool {
        match &self.sides {
            Some(sides) => sides.iter().any(|s| s == "client"),
            None => true,
        }
    }
}

async fn install_forge_like(
    ctx: &InstallCtx<'_>,
    minecraft_version: &str,
    loader: &LoaderSpec,
    vanilla: &VersionJson,
) -> Result<VersionJson> {
    let loader_name = match loader.kind {
        LoaderKind::NeoForge => "NeoForge",
        _ => "Forge",
    };
    log::info!(
        "installing {} {} for minecraft {}",
        loader_name,
        loader.version,
        minecraft_version
    );

    let installer_path =
        download_installer(ctx, minecraft_version, loader, loader_name).await?;
    let mut installer = PackArchive::open(&installer_path)?;

    let profile: InstallProfile =
        serde_json::from_slice(&installer.read_entry("install_profile.json")?)
            .context("parse install_profile.json")?;

    // Legacy layout carries the version document inside the profile and a
    // single universal jar; no processors to run.
    if let Some(version_info) = &profile.version_info {
        log::info!("{} installer is legacy-format", loader_name);
        extract_embedded_artifacts(&mut installer, &ctx.config.libraries_dir())?;
        if let (Some(file_path), Some(coordinate)) = (
            profile.install.as_ref().and_then(|i| i.file_path.clone()),
            profile.install.as_ref().and_then(|i| i.path.clone()),
        ) {
            if let Some(rel) = maven_to_path(&coordinate) {
                let bytes = installer.read_entry(&file_path)?;
                fsx::write_atomic(&ctx.config.libraries_dir().join(rel), &bytes)?;
            }
        }
        download_libraries(ctx, &version_info.libraries, loader_name).await?;
        return Ok(merge_versions(vanilla, version_info));
    }

    let loader_version: VersionJson =
        serde_json::from_slice(&installer.read_entry("version.json")?)
            .context("parse loader version.json")?;

    // Artifacts the installer ships inline (universal/client jars)
    extract_embedded_artifacts(&mut installer, &ctx.config.libraries_dir())?;

    // Libraries from both documents; empty URLs mark processor outputs
    let mut libraries: Vec<Library> = Vec::new();
    libraries.extend(loader_version.libraries.iter().cloned());
    libraries.extend(profile.libraries.iter().cloned());
    download_libraries(ctx, &libraries, loader_name).await?;

    // Run the client-side processors (deobfuscation, patching)
    let client_processors: Vec<&Processor> = profile
        .processors
        .iter()
        .filter(|p| p.runs_on_client())
        .collect();
    if !client_processors.is_empty() {
        log::info!(
            "{}: executing {} installer processors",
            loader_name,
            client_processors.len()
        );
        let java_major = vanilla
            .java_version
            .as_ref()
            .map(|j| j.major_version)
            .unwrap_or(8);
        let java = crate::loader::jre::find_installed_java(ctx.config, java_major)
            .ok_or_else(|| anyhow::anyhow!("no java available to run installer processors"))?;
        let variables = build_data_variables(
            ctx,
            &profile.data,
            minecraft_version,
            &installer_path,
            &mut installer,
        )?;
        for (idx, processor) in client_processors.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                anyhow::bail!("installation cancelled");
            }
            log::info!(
                "processor {}/{}: {}",
                idx + 1,
                client_processors.len(),
                processor.jar
            );
            run_processor(ctx, processor, &variables, &java).await?;
        }
    }

    Ok(merge_versions(vanilla, &loader_version))
}

async fn download_installer(
    ctx: &InstallCtx<'_>,
    minecraft_version: &str,
    loader: &LoaderSpec,
    loader_name: &str,
) -> Result<PathBuf> {
    let (url, file_name) = match loader.kind {
        LoaderKind::NeoForge => {
            let file = format!("neoforge-{}-installer.jar", loader.version);
            (
                format!(
                    "{}/net/neoforged/neoforge/{}/{}",
                    NEOFORGE_MAVEN_URL, loader.version, file
                ),
                file,
            )
        }
        _ => {
            let full_version = if loader.version.contains('-') {
                loader.version.clone()
            } else {
                format!("{}-{}", minecraft_version, loader.version)
            };
            let file = format!("forge-{}-installer.jar", full_version);
            (
                format!(
                    "{}/net/minecraftforge/forge/{}/{}",
                    FORGE_MAVEN_URL, full_version, file
                ),
                file,
            )
        }
    };

    let target = ctx.config.cache_dir().join("installers").join(&file_name);
    if target.exists() {
        log::info!("using cached {} installer {:?}", loader_name, target);
        return Ok(target);
    }

    let requests = vec![DownloadRequest {
        url,
        target: target.clone(),
        expected_hash: None,
        size: None,
        file_name,
        source_ids: None,
    }];
    let result = ctx
        .pool
        .run(requests.clone(), Some(ctx.phase), ctx.cancel)
        .await?;
    if !result.failed.is_empty() {
        return Err(crate::loader::fail_runtime_downloads(&requests, &result.failed));
    }
    Ok(target)
}

async fn download_libraries(
    ctx: &InstallCtx<'_>,
    libraries: &[Library],
    loader_name: &str,
) -> Result<()> {
    let libraries_dir = ctx.config.libraries_dir();
    let mut requests = Vec::new();
    for library in libraries.iter().filter(|l| l.applies_to_host()) {
        let Some(path) = library.artifact_path() else {
            continue;
        };
        let target = libraries_dir.join(&path);
        let Some(url) = library.artifact_url(FORGE_MAVEN_URL) else {
            // embedded artifact or processor output; it must exist by now or
            // will be produced by a processor below
            log::debug!("library without URL: {}", library.name);
            continue;
        };
        requests.push(DownloadRequest {
            url,
            target,
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
    Ok(())
}

/// Installer jars ship ready-made artifacts under `maven/`; copy them into
/// the shared libraries tree.
fn extract_embedded_artifacts(installer: &mut PackArchive, libraries_dir: &Path) -> Result<()> {
    let entries = installer.entries()?;
    for entry in entries {
        if entry.is_dir || !entry.path.starts_with("maven/") {
            continue;
        }
        let rel = entry.path.trim_start_matches("maven/");
        let target = libraries_dir.join(rel);
        if target.exists() {
            continue;
        }
        let bytes = installer.read_entry(&entry.path)?;
        fsx::write_atomic(&target, &bytes)?;
        log::debug!("extracted embedded artifact {}", rel);
    }
    Ok(())
}

/// Resolve `install_profile.data` entries and the built-in placeholders into
/// concrete paths for processor argument substitution.
fn build_data_variables(
    ctx: &InstallCtx<'_>,
    data: &HashMap<String, SidedValue>,
    minecraft_version: &str,
    installer_path: &Path,
    installer: &mut PackArchive,
) -> Result<HashMap<String, String>> {
    let libraries_dir = ctx.config.libraries_dir();
    let mut variables = HashMap::new();

    variables.insert("SIDE".to_string(), "client".to_string());
    variables.insert(
        "MINECRAFT_JAR".to_string(),
        ctx.config
            .versions_dir()
            .join(format!("{}.jar", minecraft_version))
            .to_string_lossy()
            .to_string(),
    );
    variables.insert(
        "ROOT".to_string(),
        ctx.config.meta_dir().to_string_lossy().to_string(),
    );
    variables.insert(
        "INSTALLER".to_string(),
        installer_path.to_string_lossy().to_string(),
    );

    let work_dir = ctx.config.cache_dir().join("installer-work");
    fsx::ensure_dir(&work_dir)?;

    for (key, value) in data {
        let client = value.client.trim();
        let resolved = if client.starts_with('[') && client.ends_with(']') {
            let coordinate = &client[1..client.len() - 1];
            match maven_to_path(coordinate) {
                Some(rel) => libraries_dir.join(rel).to_string_lossy().to_string(),
                None => client.to_string(),
            }
        } else if client.starts_with('\'') && client.ends_with('\'') {
            client.trim_matches('\'').to_string()
        } else if client.starts_with('/') {
            // a file embedded in the installer jar
            let rel = client.trim_start_matches('/');
            let out = work_dir.join(rel.replace('/', "_"));
            let bytes = installer.read_entry(rel)?;
            fsx::write_atomic(&out, &bytes)?;
            out.to_string_lossy().to_string()
        } else {
            client.to_string()
        };
        variables.insert(key.clone(), resolved);
    }

    Ok(variables)
}

fn substitute(input: &str, variables: &HashMap<String, String>, libraries_dir: &Path) -> String {
    // bracketed maven coordinates may appear directly in args as well
    if input.starts_with('[') && input.ends_with(']') {
        if let Some(rel) = maven_to_path(&input[1..input.len() - 1]) {
            return libraries_dir.join(rel).to_string_lossy().to_string();
        }
    }
    let mut out = input.to_string();
    for (key, value) in variables {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

/// Execute one installer processor: a plain `java -cp ... MainClass args`
/// invocation, with the main class read from the processor jar manifest.
async fn run_processor(
    ctx: &InstallCtx<'_>,
    processor: &Processor,
    variables: &HashMap<String, String>,
    java: &Path,
) -> Result<()> {
    let libraries_dir = ctx.config.libraries_dir();

    let processor_jar = libraries_dir.join(
        maven_to_path(&processor.jar)
            .ok_or_else(|| anyhow::anyhow!("bad processor coordinate {:?}", processor.jar))?,
    );
    let main_class = read_main_class(&processor_jar)
        .with_context(|| format!("read main class of {:?}", processor_jar))?;

    let separator = if cfg!(windows) { ";" } else { ":" };
    let mut classpath_entries = vec![processor_jar.to_string_lossy().to_string()];
    for coordinate in &processor.classpath {
        if let Some(rel) = maven_to_path(coordinate) {
            classpath_entries.push(libraries_dir.join(rel).to_string_lossy().to_string());
        }
    }
    let classpath = classpath_entries.join(separator);

    let args: Vec<String> = processor
        .args
        .iter()
        .map(|a| substitute(a, variables, &libraries_dir))
        .collect();

    log::debug!("processor exec: {} -cp <{} entries> {}", java.display(), classpath_entries.len(), main_class);
    let mut command = tokio::process::Command::new(java);
    command
        .arg("-cp")
        .arg(&classpath)
        .arg(&main_class)
        .args(&args);
    crate::utils::process::suppress_console(&mut command);
    let output = command
        .output()
        .await
        .with_context(|| format!("spawn processor {:?}", processor.jar))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "installer processor {} failed ({}): {}",
            processor.jar,
            output.status,
            stderr.lines().last().unwrap_or("no output")
        );
    }
    Ok(())
}

/// Pull `Main-Class` out of a jar's MANIFEST.MF.
fn read_main_class(jar: &Path) -> Result<String> {
    let mut archive = PackArchive::open(jar)?;
    let manifest = archive.read_entry("META-INF/MANIFEST.MF")?;
    let text = String::from_utf8_lossy(&manifest);
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("Main-Class:") {
            return Ok(value.trim().to_string());
        }
    }
    anyhow::bail!("jar {:?} declares no Main-Class", jar)
}
