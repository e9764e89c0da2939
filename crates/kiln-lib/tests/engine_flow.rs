//! End-to-end engine flows against a mocked registry and CDN: install with
//! restricted files, updates that honor protection, repair, and the status
//! lifecycle.

use kiln_lib::config::{java_platform, EngineConfig};
use kiln_lib::instance::metadata::InstanceStatus;
use kiln_lib::net::fetch::FailReason;
use kiln_lib::orchestrator::{Engine, InstallOptions, PackSource};
use kiln_lib::pack::types::OverridesBundle;
use kiln_lib::utils::hash::{hash_bytes, hash_file, HashAlgo};
use kiln_lib::EngineError;
use serde_json::json;
use std::path::{Path, PathBuf};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

const ALPHA_BYTES: &[u8] = b"alpha mod contents";
const BETA_BYTES: &[u8] = b"beta mod contents";
const SECRET_BYTES: &[u8] = b"user supplied restricted mod";

fn write_pack(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
    use std::io::Write;
    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    for (entry, bytes) in entries {
        writer
            .start_file(*entry, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap();
    path
}

fn cf_manifest(version: &str, files: &[(i64, i64, bool)]) -> String {
    let files: Vec<_> = files
        .iter()
        .map(|(project, file, required)| {
            json!({"projectID": project, "fileID": file, "required": required})
        })
        .collect();
    json!({
        "minecraft": {"version": "1.20.1", "modLoaders": []},
        "manifestType": "minecraftModpack",
        "manifestVersion": 1,
        "name": "Flow Pack",
        "version": version,
        "author": "tester",
        "files": files,
        "overrides": "overrides"
    })
    .to_string()
}

/// Seed everything install_runtime would otherwise fetch: a cached version
/// document and a fake provisioned JRE.
fn seed_runtime(config: &EngineConfig, libraries: serde_json::Value) {
    let version_json = json!({
        "id": "1.20.1",
        "mainClass": "net.minecraft.client.main.Main",
        "libraries": libraries
    });
    let path = config.versions_dir().join("1.20.1.json");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, version_json.to_string()).unwrap();

    let java_bin = config.java_dir().join("8").join(java_platform()).join("bin");
    std::fs::create_dir_all(&java_bin).unwrap();
    let java = java_bin.join(if cfg!(windows) { "java.exe" } else { "java" });
    std::fs::write(java, b"#!/bin/true").unwrap();
}

async fn mock_registry(server: &MockServer, rows: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/mods/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": rows })))
        .mount(server)
        .await;
}

async fn mock_cdn_file(server: &MockServer, route: &str, bytes: &'static [u8]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.to_vec()))
        .mount(server)
        .await;
}

fn engine_for(tmp: &Path, server: &MockServer) -> Engine {
    let config = EngineConfig::new(tmp)
        .with_registry_base_url(server.uri())
        .with_download_concurrency(4);
    seed_runtime(&config, json!([]));
    Engine::new(config).unwrap()
}

fn standard_rows(server: &MockServer) -> serde_json::Value {
    json!([
        {
            "id": 100, "modId": 1, "fileName": "alpha.jar",
            "downloadUrl": format!("{}/cdn/alpha.jar", server.uri()),
            "hashes": [{"value": hash_bytes(ALPHA_BYTES, HashAlgo::Sha1), "algo": 1}]
        },
        {
            "id": 200, "modId": 2, "fileName": "beta.jar",
            "downloadUrl": format!("{}/cdn/beta.jar", server.uri()),
            "hashes": [{"value": hash_bytes(BETA_BYTES, HashAlgo::Sha1), "algo": 1}]
        },
        {
            "id": 300, "modId": 3, "fileName": "secret-mod.jar",
            "downloadUrl": null,
            "hashes": [{"value": hash_bytes(SECRET_BYTES, HashAlgo::Sha1), "algo": 1}]
        }
    ])
}

#[tokio::test]
async fn fresh_install_with_restricted_mod_satisfied_by_user_bytes() {
    let server = MockServer::start().await;
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_for(tmp.path(), &server);

    mock_registry(&server, standard_rows(&server)).await;
    mock_cdn_file(&server, "/cdn/alpha.jar", ALPHA_BYTES).await;
    mock_cdn_file(&server, "/cdn/beta.jar", BETA_BYTES).await;

    let pack = write_pack(
        tmp.path(),
        "pack.zip",
        &[
            (
                "manifest.json",
                cf_manifest("1.0.0", &[(1, 100, true), (2, 200, true), (3, 300, true)])
                    .as_bytes(),
            ),
            ("overrides/config/common.toml", b"render_distance=8"),
        ],
    );

    let mut user_overrides = OverridesBundle::new();
    user_overrides.insert("secret-mod.jar", SECRET_BYTES.to_vec());

    let result = engine
        .install(
            "flow",
            PackSource::LocalArchive(pack),
            InstallOptions {
                user_overrides,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(result.failed.is_empty(), "failed: {:?}", result.failed);

    let dir = engine.store().instance_dir("flow");
    assert_eq!(std::fs::read(dir.join("mods/alpha.jar")).unwrap(), ALPHA_BYTES);
    assert_eq!(std::fs::read(dir.join("mods/beta.jar")).unwrap(), BETA_BYTES);
    // the restricted file carries exactly the user-supplied bytes
    assert_eq!(
        hash_file(&dir.join("mods/secret-mod.jar"), HashAlgo::Sha1).unwrap(),
        hash_bytes(SECRET_BYTES, HashAlgo::Sha1)
    );
    assert_eq!(
        std::fs::read(dir.join("config/common.toml")).unwrap(),
        b"render_distance=8"
    );

    let meta = engine.metadata("flow").unwrap().unwrap();
    assert_eq!(meta.installed_version, "1.0.0");
    assert_eq!(
        engine.status("flow", Some("1.0.0")).await.unwrap(),
        InstanceStatus::Installed
    );
    assert_eq!(
        engine.status("flow", Some("2.0.0")).await.unwrap(),
        InstanceStatus::Outdated
    );

    // hash correctness of every managed download
    assert!(engine.verify("flow").await.unwrap().is_empty());
}

#[tokio::test]
async fn restricted_mod_without_substitute_reports_failure() {
    let server = MockServer::start().await;
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_for(tmp.path(), &server);

    mock_registry(&server, standard_rows(&server)).await;
    mock_cdn_file(&server, "/cdn/alpha.jar", ALPHA_BYTES).await;

    // restricted file is optional here, so the install still succeeds
    let pack = write_pack(
        tmp.path(),
        "pack.zip",
        &[(
            "manifest.json",
            cf_manifest("1.0.0", &[(1, 100, true), (3, 300, false)]).as_bytes(),
        )],
    );

    let result = engine
        .install("partial", PackSource::LocalArchive(pack), InstallOptions::default())
        .await
        .unwrap();
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].reason, FailReason::Restricted);
    assert_eq!(result.failed[0].file_name.as_deref(), Some("secret-mod.jar"));

    // committed despite the optional failure
    assert_eq!(
        engine.metadata("partial").unwrap().unwrap().installed_version,
        "1.0.0"
    );
}

#[tokio::test]
async fn missing_required_mod_fails_the_operation() {
    let server = MockServer::start().await;
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_for(tmp.path(), &server);

    // registry knows nothing about file 999
    mock_registry(&server, json!([])).await;

    let pack = write_pack(
        tmp.path(),
        "pack.zip",
        &[(
            "manifest.json",
            cf_manifest("1.0.0", &[(9, 999, true)]).as_bytes(),
        )],
    );

    let err = engine
        .install("broken", PackSource::LocalArchive(pack), InstallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unknown(_)));
    // no journal means not installed; the aborted staging reads as error
    assert!(engine.metadata("broken").unwrap().is_none());
    assert_eq!(
        engine.status("broken", None).await.unwrap(),
        InstanceStatus::Error
    );
}

#[tokio::test]
async fn update_preserves_user_resourcepack_and_refreshes_mods() {
    let server = MockServer::start().await;
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_for(tmp.path(), &server);

    mock_registry(&server, standard_rows(&server)).await;
    mock_cdn_file(&server, "/cdn/alpha.jar", ALPHA_BYTES).await;
    mock_cdn_file(&server, "/cdn/beta.jar", BETA_BYTES).await;

    // v1 ships only alpha
    let pack_v1 = write_pack(
        tmp.path(),
        "pack-v1.zip",
        &[(
            "manifest.json",
            cf_manifest("1.0.0", &[(1, 100, true)]).as_bytes(),
        )],
    );
    engine
        .install("upd", PackSource::LocalArchive(pack_v1), InstallOptions::default())
        .await
        .unwrap();

    // the user drops in a resourcepack of their own
    let dir = engine.store().instance_dir("upd");
    std::fs::create_dir_all(dir.join("resourcepacks")).unwrap();
    std::fs::write(dir.join("resourcepacks/custom.zip"), b"user pack bytes").unwrap();
    let user_sha = hash_file(&dir.join("resourcepacks/custom.zip"), HashAlgo::Sha1).unwrap();

    // v2 swaps alpha for beta
    let pack_v2 = write_pack(
        tmp.path(),
        "pack-v2.zip",
        &[(
            "manifest.json",
            cf_manifest("2.0.0", &[(2, 200, true)]).as_bytes(),
        )],
    );
    let result = engine
        .update("upd", PackSource::LocalArchive(pack_v2), InstallOptions::default())
        .await
        .unwrap();
    assert!(result.failed.is_empty());

    // user territory untouched, upstream mods swapped
    assert_eq!(
        hash_file(&dir.join("resourcepacks/custom.zip"), HashAlgo::Sha1).unwrap(),
        user_sha
    );
    assert!(dir.join("mods/beta.jar").exists());
    assert!(!dir.join("mods/alpha.jar").exists());
    assert_eq!(
        engine.metadata("upd").unwrap().unwrap().installed_version,
        "2.0.0"
    );
    assert!(engine.verify("upd").await.unwrap().is_empty());
}

#[tokio::test]
async fn update_preserves_user_added_mod_in_relaxed_tree() {
    let server = MockServer::start().await;
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_for(tmp.path(), &server);

    mock_registry(&server, standard_rows(&server)).await;
    mock_cdn_file(&server, "/cdn/alpha.jar", ALPHA_BYTES).await;
    mock_cdn_file(&server, "/cdn/beta.jar", BETA_BYTES).await;

    let pack_v1 = write_pack(
        tmp.path(),
        "pack-v1.zip",
        &[(
            "manifest.json",
            cf_manifest("1.0.0", &[(1, 100, true)]).as_bytes(),
        )],
    );
    engine
        .install("mods-kept", PackSource::LocalArchive(pack_v1), InstallOptions::default())
        .await
        .unwrap();

    let dir = engine.store().instance_dir("mods-kept");
    std::fs::write(dir.join("mods/my-minimap.jar"), b"user mod").unwrap();

    let pack_v2 = write_pack(
        tmp.path(),
        "pack-v2.zip",
        &[(
            "manifest.json",
            cf_manifest("2.0.0", &[(2, 200, true)]).as_bytes(),
        )],
    );
    engine
        .update("mods-kept", PackSource::LocalArchive(pack_v2), InstallOptions::default())
        .await
        .unwrap();

    // the user-added mod is not in any manifest: user territory
    assert_eq!(std::fs::read(dir.join("mods/my-minimap.jar")).unwrap(), b"user mod");
    // the old upstream mod is gone
    assert!(!dir.join("mods/alpha.jar").exists());
}

#[tokio::test]
async fn repeated_install_of_same_version_is_a_noop() {
    let server = MockServer::start().await;
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_for(tmp.path(), &server);

    mock_registry(&server, standard_rows(&server)).await;
    mock_cdn_file(&server, "/cdn/alpha.jar", ALPHA_BYTES).await;

    let entries = [(
        "manifest.json",
        cf_manifest("1.0.0", &[(1, 100, true)]),
    )];
    let pack = write_pack(
        tmp.path(),
        "pack.zip",
        &[(entries[0].0, entries[0].1.as_bytes())],
    );

    engine
        .install("twice", PackSource::LocalArchive(pack.clone()), InstallOptions::default())
        .await
        .unwrap();
    let installed_at_first = engine.metadata("twice").unwrap().unwrap().installed_at;

    let result = engine
        .install("twice", PackSource::LocalArchive(pack), InstallOptions::default())
        .await
        .unwrap();
    assert!(result.succeeded.is_empty() && result.failed.is_empty());
    assert_eq!(
        engine.metadata("twice").unwrap().unwrap().installed_at,
        installed_at_first
    );
}

#[tokio::test]
async fn repair_restores_deleted_library_without_touching_the_instance() {
    let server = MockServer::start().await;
    let tmp = tempfile::tempdir().unwrap();

    let config = EngineConfig::new(tmp.path())
        .with_registry_base_url(server.uri())
        .with_download_concurrency(4);
    let lib_bytes: &[u8] = b"library jar bytes";
    seed_runtime(
        &config,
        json!([{
            "name": "com.example:runtime-lib:1.0",
            "downloads": {"artifact": {
                "path": "com/example/runtime-lib/1.0/runtime-lib-1.0.jar",
                "sha1": hash_bytes(lib_bytes, HashAlgo::Sha1),
                "size": lib_bytes.len(),
                "url": format!("{}/cdn/runtime-lib-1.0.jar", server.uri())
            }}
        }]),
    );
    let engine = Engine::new(config.clone()).unwrap();

    mock_registry(&server, standard_rows(&server)).await;
    mock_cdn_file(&server, "/cdn/alpha.jar", ALPHA_BYTES).await;
    Mock::given(method("GET"))
        .and(path("/cdn/runtime-lib-1.0.jar"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(lib_bytes.to_vec()))
        .mount(&server)
        .await;

    let pack = write_pack(
        tmp.path(),
        "pack.zip",
        &[
            (
                "manifest.json",
                cf_manifest("1.0.0", &[(1, 100, true)]).as_bytes(),
            ),
            ("overrides/config/settings.toml", b"x=1"),
        ],
    );
    engine
        .install("repairable", PackSource::LocalArchive(pack), InstallOptions::default())
        .await
        .unwrap();

    let lib_path = config
        .libraries_dir()
        .join("com/example/runtime-lib/1.0/runtime-lib-1.0.jar");
    assert!(lib_path.exists());
    std::fs::remove_file(&lib_path).unwrap();

    engine.repair("repairable").await.unwrap();

    assert_eq!(std::fs::read(&lib_path).unwrap(), lib_bytes);
    // mods and configs are bytewise untouched
    let dir = engine.store().instance_dir("repairable");
    assert_eq!(std::fs::read(dir.join("mods/alpha.jar")).unwrap(), ALPHA_BYTES);
    assert_eq!(std::fs::read(dir.join("config/settings.toml")).unwrap(), b"x=1");
    assert_eq!(
        engine.status("repairable", Some("1.0.0")).await.unwrap(),
        InstanceStatus::Installed
    );
}

#[tokio::test]
async fn reinstall_forces_upstream_bytes_but_keeps_saves() {
    let server = MockServer::start().await;
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_for(tmp.path(), &server);

    mock_registry(&server, standard_rows(&server)).await;
    mock_cdn_file(&server, "/cdn/alpha.jar", ALPHA_BYTES).await;

    let pack = write_pack(
        tmp.path(),
        "pack.zip",
        &[
            (
                "manifest.json",
                cf_manifest("1.0.0", &[(1, 100, true)]).as_bytes(),
            ),
            ("overrides/config/tuned.toml", b"upstream default"),
        ],
    );
    engine
        .install("force", PackSource::LocalArchive(pack.clone()), InstallOptions::default())
        .await
        .unwrap();

    // user edits an upstream config, tampers with a mod, and plays a world
    let dir = engine.store().instance_dir("force");
    std::fs::write(dir.join("config/tuned.toml"), b"user tuned").unwrap();
    std::fs::write(dir.join("mods/alpha.jar"), b"tampered").unwrap();
    std::fs::create_dir_all(dir.join("saves/world1")).unwrap();
    std::fs::write(dir.join("saves/world1/level.dat"), b"progress").unwrap();

    engine
        .reinstall("force", PackSource::LocalArchive(pack), InstallOptions::default())
        .await
        .unwrap();

    // upstream-owned trees are factory fresh again
    assert_eq!(std::fs::read(dir.join("mods/alpha.jar")).unwrap(), ALPHA_BYTES);
    assert_eq!(
        std::fs::read(dir.join("config/tuned.toml")).unwrap(),
        b"upstream default"
    );
    // the allow-list survives
    assert_eq!(
        std::fs::read(dir.join("saves/world1/level.dat")).unwrap(),
        b"progress"
    );
}
