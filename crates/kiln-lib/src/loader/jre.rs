use crate::config::{java_platform, EngineConfig};
use crate::loader::InstallCtx;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const ZULU_API_BASE: &str = "https://api.azul.com/metadata/v1/zulu/packages";

#[derive(Debug, Deserialize)]
struct ZuluPackage {
    download_url: String,
    #[serde(default)]
    name: Option<String>,
}

/// Ensure a JRE of the given major version exists under
/// `meta/java/<major>/<platform>` and return its java executable. An
/// existing installation, or a matching system java, short-circuits the
/// download.
pub async fn ensure_jre(ctx: &InstallCtx<'_>, major: u32) -> Result<PathBuf> {
    let install_dir = jre_install_dir(ctx.config, major);
    if let Some(java) = find_java_executable(&install_dir) {
        log::debug!("found provisioned jre {}: {:?}", major, java);
        return Ok(java);
    }

    log::info!("provisioning jre {} into {:?}", major, install_dir);
    let (os_param, arch_param, ext) = zulu_query_params();
    let url = format!(
        "{}/?os={}&arch={}&java_version={}&bundle_type=jre&javafx_bundled=false&ext={}&archive_type={}&latest=true&release_status=ga&availability_types=CA&page=1&page_size=1",
        ZULU_API_BASE, os_param, arch_param, major, ext, ext
    );

    let packages: Vec<ZuluPackage> = ctx
        .client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
        .context("parse zulu package metadata")?;
    let package = packages
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no jre build available for java {}", major))?;
    log::info!(
        "downloading jre archive {}",
        package.name.as_deref().unwrap_or(&package.download_url)
    );

    let archive_path = install_dir.with_extension(format!("download.{}", ext));
    let bytes = ctx
        .client
        .get(&package.download_url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    crate::utils::fsx::write_atomic(&archive_path, &bytes)?;

    crate::utils::fsx::remove_dir_if_exists(&install_dir)?;
    crate::utils::fsx::ensure_dir(&install_dir)?;
    if ext == "zip" {
        let mut archive = crate::archive::PackArchive::open(&archive_path)?;
        archive.extract_filtered(&install_dir, |_| true)?;
    } else {
        extract_tar_gz(&archive_path, &install_dir)?;
    }
    let _ = std::fs::remove_file(&archive_path);

    let java = find_java_executable(&install_dir)
        .ok_or_else(|| anyhow::anyhow!("jre archive contained no java executable"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&java)?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(&java, perms)?;
    }

    log::info!("jre {} ready: {:?}", major, java);
    Ok(java)
}

/// Locate a previously provisioned JRE without touching the network,
/// falling back to a system java on PATH.
pub fn find_installed_java(config: &EngineConfig, major: u32) -> Option<PathBuf> {
    if let Some(java) = find_java_executable(&jre_install_dir(config, major)) {
        return Some(java);
    }
    match which::which("java") {
        Ok(java) => {
            log::warn!(
                "no provisioned jre {} found, falling back to system java at {:?}",
                major,
                java
            );
            Some(java)
        }
        Err(_) => None,
    }
}

pub fn jre_install_dir(config: &EngineConfig, major: u32) -> PathBuf {
    config.java_dir().join(major.to_string()).join(java_platform())
}

/// Search an extracted JRE tree for the java executable. Zulu archives wrap
/// everything in a versioned folder, macOS adds Contents/Home.
pub fn find_java_executable(root: &Path) -> Option<PathBuf> {
    if !root.is_dir() {
        return None;
    }
    let exe_name = if cfg!(windows) { "java.exe" } else { "java" };

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let candidate = dir.join("bin").join(exe_name);
        if candidate.is_file() {
            return Some(candidate);
        }
        let mac_candidate = dir.join("Contents/Home/bin").join(exe_name);
        if mac_candidate.is_file() {
            return Some(mac_candidate);
        }
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                }
            }
        }
    }
    None
}

fn zulu_query_params() -> (&'static str, &'static str, &'static str) {
    let os = match std::env::consts::OS {
        "windows" => "windows",
        "macos" => "macos",
        _ => "linux",
    };
    let arch = match std::env::consts::ARCH {
        "aarch64" => "aarch64",
        "arm" => "aarch32",
        _ => "x64",
    };
    let ext = if os == "windows" { "zip" } else { "tar.gz" };
    (os, arch, ext)
}

fn extract_tar_gz(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .with_context(|| format!("open jre archive {:?}", archive_path))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(dest)
        .with_context(|| format!("unpack jre archive into {:?}", dest))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn finds_java_in_nested_layout() {
        let tmp = tempdir().unwrap();
        let exe = if cfg!(windows) { "java.exe" } else { "java" };
        let bin = tmp.path().join("zulu17.46.19-ca-jre17.0.9/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join(exe), b"#!").unwrap();

        let found = find_java_executable(tmp.path()).unwrap();
        assert!(found.ends_with(Path::new("bin").join(exe)));
    }

    #[test]
    fn finds_java_in_macos_layout() {
        let tmp = tempdir().unwrap();
        let exe = if cfg!(windows) { "java.exe" } else { "java" };
        let bin = tmp.path().join("zulu-17.jre/Contents/Home/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join(exe), b"#!").unwrap();

        assert!(find_java_executable(tmp.path()).is_some());
    }

    #[test]
    fn missing_tree_yields_none() {
        let tmp = tempdir().unwrap();
        assert!(find_java_executable(&tmp.path().join("nope")).is_none());
    }

    #[test]
    fn extract_tar_gz_roundtrip() {
        let tmp = tempdir().unwrap();
        let archive_path = tmp.path().join("jre.tar.gz");

        // build a tiny tar.gz with a nested bin/java
        let file = std::fs::File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let data = b"fake-java";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "jre-17/bin/java", &data[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = tmp.path().join("out");
        extract_tar_gz(&archive_path, &dest).unwrap();
        assert!(dest.join("jre-17/bin/java").is_file());
    }
}
