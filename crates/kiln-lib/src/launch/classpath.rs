use crate::loader::version::VersionJson;
use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

pub fn classpath_separator() -> &'static str {
    if cfg!(windows) {
        ";"
    } else {
        ":"
    }
}

/// Build the -cp string: every host-applicable library plus the game jar,
/// deduplicated by repository path with first-wins ordering (the merge puts
/// loader libraries before vanilla ones, and loaders pin the versions they
/// need).
pub fn build_classpath(
    version: &VersionJson,
    libraries_dir: &Path,
    game_jar: &Path,
) -> Result<String> {
    let mut seen_artifacts: HashSet<String> = HashSet::new();
    let mut entries: Vec<String> = Vec::new();

    for library in version.libraries.iter().filter(|l| l.applies_to_host()) {
        let Some(path) = library.artifact_path() else {
            continue;
        };
        // dedupe on group:artifact so a loader's pinned version shadows the
        // vanilla copy of the same library
        let key = artifact_key(&library.name);
        if !seen_artifacts.insert(key) {
            continue;
        }
        let full = libraries_dir.join(&path);
        entries.push(full.to_string_lossy().to_string());
    }

    entries.push(game_jar.to_string_lossy().to_string());
    Ok(entries.join(classpath_separator()))
}

/// Libraries the version document expects on disk but which are absent;
/// non-empty means the installation is incomplete and repair is due.
pub fn missing_libraries(version: &VersionJson, libraries_dir: &Path) -> Vec<String> {
    let mut missing = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for library in version.libraries.iter().filter(|l| l.applies_to_host()) {
        let Some(path) = library.artifact_path() else {
            continue;
        };
        if !seen.insert(artifact_key(&library.name)) {
            continue;
        }
        if library.artifact_url("").is_none() && !libraries_dir.join(&path).is_file() {
            // processor outputs with no URL are still required on disk
            missing.push(library.name.clone());
            continue;
        }
        if !libraries_dir.join(&path).is_file() {
            missing.push(library.name.clone());
        }
    }
    missing
}

fn artifact_key(name: &str) -> String {
    let mut parts = name.split(':');
    let group = parts.next().unwrap_or_default();
    let artifact = parts.next().unwrap_or_default();
    let classifier = parts.nth(1).unwrap_or_default();
    format!("{}:{}:{}", group, artifact, classifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::version::Library;

    fn lib(name: &str) -> Library {
        Library {
            name: name.into(),
            downloads: None,
            url: None,
            natives: None,
            rules: None,
            sha1: None,
            size: None,
        }
    }

    #[test]
    fn dedupes_same_artifact_first_wins() {
        let version = VersionJson {
            id: "x".into(),
            libraries: vec![
                lib("org.ow2.asm:asm:9.6"),
                lib("org.ow2.asm:asm:9.2"),
                lib("com.google.guava:guava:31.1-jre"),
            ],
            ..Default::default()
        };
        let cp = build_classpath(
            &version,
            Path::new("/data/libraries"),
            Path::new("/data/versions/x.jar"),
        )
        .unwrap();
        assert!(cp.contains("asm-9.6.jar"));
        assert!(!cp.contains("asm-9.2.jar"));
        assert!(cp.contains("guava-31.1-jre.jar"));
        assert!(cp.ends_with("x.jar"));
    }

    #[test]
    fn classifier_artifacts_are_distinct() {
        let version = VersionJson {
            id: "x".into(),
            libraries: vec![
                lib("org.lwjgl:lwjgl:3.3.1"),
                lib("org.lwjgl:lwjgl:3.3.1:natives-linux"),
            ],
            ..Default::default()
        };
        let cp = build_classpath(
            &version,
            Path::new("/l"),
            Path::new("/v/x.jar"),
        )
        .unwrap();
        assert!(cp.contains("lwjgl-3.3.1.jar"));
        assert!(cp.contains("lwjgl-3.3.1-natives-linux.jar"));
    }

    #[test]
    fn missing_libraries_lists_absent_files() {
        let tmp = tempfile::tempdir().unwrap();
        let version = VersionJson {
            id: "x".into(),
            libraries: vec![lib("com.example:present:1"), lib("com.example:absent:1")],
            ..Default::default()
        };
        let present = tmp.path().join("com/example/present/1/present-1.jar");
        std::fs::create_dir_all(present.parent().unwrap()).unwrap();
        std::fs::write(&present, b"jar").unwrap();

        let missing = missing_libraries(&version, tmp.path());
        assert_eq!(missing, vec!["com.example:absent:1".to_string()]);
    }
}
