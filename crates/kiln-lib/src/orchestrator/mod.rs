use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::instance::metadata::{
    InstanceMetadata, InstanceStatus, ManagedFile, RamAllocation,
};
use crate::instance::protection::{MergeAction, ProtectionFlags, ProtectionManifest};
use crate::instance::store::{InstanceStore, StagingArea};
use crate::launch::process::{launch_game, stop_game, ProcessHandle};
use crate::launch::registry::RunningRegistry;
use crate::launch::{resolve_ram_mb, Credentials, LaunchContext};
use crate::loader::{install_runtime, load_installed_runtime, InstallCtx};
use crate::net::fetch::{
    CancelToken, DownloadRequest, DownloadResult, FailReason, FailedMod, FetchPool,
};
use crate::pack::resolver::{resolve_pack, ResolvedPack};
use crate::pack::types::{FileKind, OverridesBundle, SourceRef};
use crate::progress::{weights, ProgressBus, Step};
use crate::registry::{FileResolution, RegistryClient};
use crate::utils::hash::{hash_file, HashAlgo};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Which flavor of tree mutation is running; they share one pipeline and
/// differ in how the protection policy is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutateMode {
    Install,
    Update,
    Reinstall,
}

/// Caller-facing knobs for install-family operations.
#[derive(Debug, Default)]
pub struct InstallOptions {
    /// Display name; defaults to the pack's own
    pub name: Option<String>,
    pub category: String,
    /// User-supplied bytes for restricted files, keyed by relative path or
    /// bare file name
    pub user_overrides: OverridesBundle,
    pub ram_allocation: Option<RamAllocation>,
    pub cancel: Option<CancelToken>,
}

/// Where a modpack archive comes from.
#[derive(Debug, Clone)]
pub enum PackSource {
    LocalArchive(PathBuf),
    Remote(String),
}

/// Options for launching an installed instance.
#[derive(Debug, Default)]
pub struct LaunchOptions {
    /// None means offline mode with this username
    pub credentials: Option<Credentials>,
    pub offline_username: Option<String>,
    pub window: Option<(u32, u32)>,
    pub extra_jvm_args: Option<String>,
}

/// The engine facade: owns the store, the shared HTTP client, the event
/// channels and the per-instance operation locks. One value per process.
pub struct Engine {
    config: EngineConfig,
    client: reqwest::Client,
    store: InstanceStore,
    registry: RegistryClient,
    events: Arc<EventBus>,
    running: Arc<RunningRegistry>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    in_flight: Arc<Mutex<HashMap<String, uuid::Uuid>>>,
}

/// RAII marker for one in-flight operation id.
struct OperationGuard {
    instance_id: String,
    registry: Arc<Mutex<HashMap<String, uuid::Uuid>>>,
}

impl OperationGuard {
    fn enter(
        registry: &Arc<Mutex<HashMap<String, uuid::Uuid>>>,
        instance_id: &str,
        kind: &str,
    ) -> Self {
        let op_id = uuid::Uuid::new_v4();
        registry
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), op_id);
        log::info!("operation {} started: {} on {}", op_id, kind, instance_id);
        Self {
            instance_id: instance_id.to_string(),
            registry: Arc::clone(registry),
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.registry.lock().unwrap().remove(&self.instance_id);
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let client = config.http_client().context("build http client")?;
        let registry = RegistryClient::new(client.clone(), config.registry_base_url.clone());
        let store = InstanceStore::new(config.clone());
        let running = RunningRegistry::new();
        Ok(Self {
            config,
            client,
            store,
            registry,
            events: Arc::new(EventBus::new()),
            running,
            op_locks: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Start background housekeeping (process liveness). Call once from an
    /// async context.
    pub fn start(&self) {
        self.running.spawn_monitor();
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    pub fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe(instance_id)
    }

    /// Status query; shared-lock read plus the running/in-flight registries.
    pub async fn status(
        &self,
        instance_id: &str,
        latest_version: Option<&str>,
    ) -> Result<InstanceStatus> {
        if self.running.is_running(instance_id).await {
            return Ok(InstanceStatus::Running);
        }
        if self.in_flight.lock().unwrap().contains_key(instance_id) {
            return Ok(InstanceStatus::Installing);
        }
        self.store.status(instance_id, latest_version)
    }

    pub fn metadata(&self, instance_id: &str) -> Result<Option<InstanceMetadata>> {
        self.store.read_metadata(instance_id)
    }

    fn lock_for(&self, instance_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.op_locks.lock().unwrap();
        locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Relay an operation's progress stream onto the instance event channel.
    fn forward_progress(&self, instance_id: &str, bus: &Arc<ProgressBus>) {
        let mut rx = bus.subscribe();
        let events = self.events.clone();
        let id = instance_id.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(sample) => events.emit(&id, EngineEvent::Progress(sample)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn materialize_pack(&self, source: &PackSource, cancel: &CancelToken) -> Result<PathBuf> {
        match source {
            PackSource::LocalArchive(path) => Ok(path.clone()),
            PackSource::Remote(url) => {
                let parsed = url::Url::parse(url)
                    .with_context(|| format!("bad pack source url {:?}", url))?;
                let file_name = parsed
                    .path_segments()
                    .and_then(|mut s| s.next_back())
                    .filter(|n| !n.is_empty())
                    .unwrap_or("modpack.zip")
                    .to_string();
                let target = self.config.cache_dir().join("packs").join(&file_name);
                let pool = FetchPool::new(self.client.clone(), self.config.download_concurrency);
                let result = pool
                    .run(
                        vec![DownloadRequest {
                            url: url.clone(),
                            target: target.clone(),
                            expected_hash: None,
                            size: None,
                            file_name,
                            source_ids: None,
                        }],
                        None,
                        cancel,
                    )
                    .await?;
                if !result.all_succeeded() {
                    return Err(anyhow::Error::from(EngineError::RegistryNetwork(format!(
                        "could not fetch pack archive {}",
                        url
                    ))));
                }
                Ok(target)
            }
        }
    }

    /// Fresh install of a pack into a (possibly empty) instance.
    pub async fn install(
        &self,
        instance_id: &str,
        source: PackSource,
        options: InstallOptions,
    ) -> Result<DownloadResult, EngineError> {
        self.mutate(instance_id, source, options, MutateMode::Install)
            .await
    }

    /// Update an installed instance to a new pack version, merging per the
    /// protection policy.
    pub async fn update(
        &self,
        instance_id: &str,
        source: PackSource,
        options: InstallOptions,
    ) -> Result<DownloadResult, EngineError> {
        self.mutate(instance_id, source, options, MutateMode::Update)
            .await
    }

    /// Forced rebuild of the upstream-owned trees, ignoring relaxation
    /// flags; saves and friends survive via the aesthetic allow-list.
    pub async fn reinstall(
        &self,
        instance_id: &str,
        source: PackSource,
        options: InstallOptions,
    ) -> Result<DownloadResult, EngineError> {
        self.mutate(instance_id, source, options, MutateMode::Reinstall)
            .await
    }

    async fn mutate(
        &self,
        instance_id: &str,
        source: PackSource,
        options: InstallOptions,
        mode: MutateMode,
    ) -> Result<DownloadResult, EngineError> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;
        let _op = OperationGuard::enter(
            &self.in_flight,
            instance_id,
            match mode {
                MutateMode::Install => "install",
                MutateMode::Update => "update",
                MutateMode::Reinstall => "reinstall",
            },
        );
        self.mutate_locked(instance_id, source, options, mode)
            .await
            .map_err(EngineError::classify)
    }

    async fn mutate_locked(
        &self,
        instance_id: &str,
        source: PackSource,
        options: InstallOptions,
        mode: MutateMode,
    ) -> Result<DownloadResult> {
        let cancel = options.cancel.clone().unwrap_or_else(CancelToken::never);
        let previous_meta = self.store.read_metadata(instance_id)?;
        self.store.clean_residue(instance_id)?;

        let bus = ProgressBus::new();
        self.forward_progress(instance_id, &bus);

        let archive_path = self.materialize_pack(&source, &cancel).await?;
        let mut pack = resolve_pack(&archive_path)?;

        // user-supplied bytes beat the archive's own overrides
        for (path, bytes) in options.user_overrides.iter() {
            match route_user_override(path) {
                Some(rel) => pack.overrides.insert(rel, bytes.to_vec()),
                None => log::warn!("ignoring user override {:?}: unsupported file type", path),
            }
        }

        // already at this version and intact: a repeated install is a no-op
        if mode != MutateMode::Reinstall {
            if let Some(prev) = &previous_meta {
                if prev.installed_version == pack.info.version
                    && self.store.verify_managed(prev)?.is_empty()
                {
                    log::info!(
                        "{} already at version {}, nothing to do",
                        instance_id,
                        pack.info.version
                    );
                    bus.complete();
                    return Ok(DownloadResult::default());
                }
            }
        }

        // phase 1: minecraft + loader into the shared tree
        let runtime_phase = bus.phase(Step::InstallingRuntime, 0.0, weights::RUNTIME);
        let pool = FetchPool::new(self.client.clone(), self.config.download_concurrency);
        let ctx = InstallCtx {
            config: &self.config,
            client: &self.client,
            pool: &pool,
            phase: &runtime_phase,
            cancel: &cancel,
        };
        install_runtime(&ctx, &pack.info.minecraft_version, &pack.info.loader).await?;
        runtime_phase.finish();

        // phase 2: mods
        let mods_phase = bus.phase(Step::DownloadingMods, weights::RUNTIME, weights::MODS);
        let staging = self.store.begin_staging(instance_id)?;
        for tree in ["mods", "config", "scripts", "resourcepacks"] {
            staging.ensure_subtree(tree)?;
        }

        let mut failed: Vec<FailedMod> = Vec::new();
        let mut managed: Vec<ManagedFile> = Vec::new();
        let requests = self
            .build_mod_requests(
                instance_id,
                &mut pack,
                &staging,
                &mut failed,
                &mut managed,
            )
            .await?;

        let download_result = pool
            .run(requests.clone(), Some(&mods_phase), &cancel)
            .await?;
        failed.extend(download_result.failed.iter().cloned());
        for req in &requests {
            if download_result
                .failed
                .iter()
                .any(|f| f.file_name.as_deref() == Some(req.file_name.as_str()))
            {
                continue;
            }
            if let Some(entry) = managed_entry_for(req, &staging) {
                managed.push(entry);
            }
        }
        mods_phase.finish();

        // phase 3: overrides, protection merge, commit
        let commit_phase = bus.phase(
            Step::Staging,
            weights::RUNTIME + weights::MODS,
            weights::COMMIT,
        );
        for (rel, bytes) in pack.overrides.iter() {
            staging.write_file(rel, bytes)?;
            managed.push(ManagedFile::unhashed(rel));
        }
        commit_phase.tick(0.4);

        let flags = previous_meta
            .as_ref()
            .map(|m| m.protection_flags())
            .unwrap_or_default();
        if previous_meta.is_some() || mode != MutateMode::Install {
            self.merge_existing_tree(
                instance_id,
                &staging,
                &pack,
                previous_meta.as_ref(),
                flags,
                mode == MutateMode::Reinstall,
            )?;
        }
        commit_phase.tick(0.7);

        // fail the operation only when a required file stayed unsatisfied
        let required_failures: Vec<&FailedMod> = failed
            .iter()
            .filter(|f| self.failure_is_required(&pack, f))
            .collect();
        if !required_failures.is_empty() {
            let first = required_failures[0];
            log::error!(
                "{} required files unsatisfied, aborting before commit ({:?})",
                required_failures.len(),
                first.file_name
            );
            anyhow::bail!(
                "{} required files could not be satisfied (first: {:?}, {:?})",
                required_failures.len(),
                first.file_name,
                first.reason
            );
        }

        let meta = InstanceMetadata {
            id: instance_id.to_string(),
            name: options
                .name
                .clone()
                .or_else(|| previous_meta.as_ref().map(|m| m.name.clone()))
                .unwrap_or_else(|| pack.info.name.clone()),
            installed_version: pack.info.version.clone(),
            minecraft_version: pack.info.minecraft_version.clone(),
            loader: pack.info.loader.clone(),
            installed_at: chrono::Utc::now(),
            ram_allocation: options
                .ram_allocation
                .or(previous_meta.as_ref().map(|m| m.ram_allocation))
                .unwrap_or(RamAllocation::Recommended),
            custom_ram_mb: previous_meta.as_ref().and_then(|m| m.custom_ram_mb),
            allow_custom_mods: flags.allow_custom_mods,
            allow_custom_resourcepacks: flags.allow_custom_resourcepacks,
            allow_custom_configs: flags.allow_custom_configs,
            recommended_ram_mb: pack.info.recommended_ram_mb,
            category: if options.category.is_empty() {
                previous_meta
                    .as_ref()
                    .map(|m| m.category.clone())
                    .unwrap_or_default()
            } else {
                options.category.clone()
            },
            managed_files: managed,
        };

        self.store.commit_staged(staging, &meta)?;
        commit_phase.finish();
        bus.complete();

        if !failed.is_empty() {
            log::warn!(
                "operation finished with {} optional/unresolved files",
                failed.len()
            );
        }
        Ok(DownloadResult {
            succeeded: download_result.succeeded,
            failed,
        })
    }

    /// Turn the resolved plan into concrete download requests targeting the
    /// staging area, resolving CurseForge refs through the registry and
    /// satisfying restricted files from overrides or existing disk content.
    async fn build_mod_requests(
        &self,
        instance_id: &str,
        pack: &mut ResolvedPack,
        staging: &StagingArea,
        failed: &mut Vec<FailedMod>,
        managed: &mut Vec<ManagedFile>,
    ) -> Result<Vec<DownloadRequest>> {
        let pending = pack.pending_registry_refs();
        let resolutions = if pending.is_empty() {
            Vec::new()
        } else {
            self.registry.resolve_files(&pending).await?
        };
        let by_ref: HashMap<(i64, i64), &crate::registry::ResolvedModFile> = resolutions
            .iter()
            .map(|r| ((r.project_id, r.file_id), r))
            .collect();

        let instance_dir = self.store.instance_dir(instance_id);
        let mut requests = Vec::new();

        // restricted handling reads the bundle while the plan is mutated;
        // take it out for the loop and put it back after
        let overrides = std::mem::take(&mut pack.overrides);

        for file in &mut pack.files {
            if file.kind != FileKind::Mod {
                continue;
            }

            // Modrinth-style entries carry their URL inline
            if let Some(url) = file.url.clone() {
                requests.push(DownloadRequest {
                    url,
                    target: staging.path_for(&file.target_path),
                    expected_hash: file.expected_hash.clone(),
                    size: file.size,
                    file_name: file
                        .target_path
                        .rsplit('/')
                        .next()
                        .unwrap_or(&file.target_path)
                        .to_string(),
                    source_ids: None,
                });
                continue;
            }

            let key = match file.source {
                SourceRef::CurseForge {
                    project_id,
                    file_id,
                } => (project_id, file_id),
                _ => continue,
            };
            let Some(resolved) = by_ref.get(&key) else {
                continue;
            };
            match &resolved.resolution {
                FileResolution::Resolved {
                    url,
                    file_name,
                    hash,
                    size,
                } => {
                    file.target_path = format!("mods/{}", file_name);
                    file.url = Some(url.clone());
                    file.expected_hash = hash.clone();
                    requests.push(DownloadRequest {
                        url: url.clone(),
                        target: staging.path_for(&file.target_path),
                        expected_hash: hash.clone(),
                        size: *size,
                        file_name: file_name.clone(),
                        source_ids: Some(key),
                    });
                }
                FileResolution::Restricted { file_name, hash } => {
                    file.restricted = true;
                    if let Some(name) = file_name {
                        file.target_path = format!("mods/{}", name);
                    }
                    let satisfied = self.satisfy_restricted(
                        &instance_dir,
                        staging,
                        &overrides,
                        file_name.as_deref(),
                        hash.as_ref(),
                        managed,
                    )?;
                    if satisfied {
                        log::info!(
                            "restricted file {:?} satisfied from overrides/disk",
                            file_name
                        );
                    } else {
                        log::warn!("restricted file {:?} has no local substitute", file_name);
                        failed.push(FailedMod {
                            project_id: Some(key.0),
                            file_id: Some(key.1),
                            file_name: file_name.clone(),
                            reason: FailReason::Restricted,
                        });
                    }
                }
                FileResolution::Missing => {
                    if file.required {
                        log::warn!("registry does not know file {:?}", key);
                    }
                    failed.push(FailedMod {
                        project_id: Some(key.0),
                        file_id: Some(key.1),
                        file_name: None,
                        reason: FailReason::Missing,
                    });
                }
            }
        }

        pack.overrides = overrides;
        Ok(requests)
    }

    /// A restricted file counts as satisfied when the overrides bundle (or
    /// the previous instance tree, verified by hash) already carries it.
    fn satisfy_restricted(
        &self,
        instance_dir: &Path,
        staging: &StagingArea,
        overrides: &OverridesBundle,
        file_name: Option<&str>,
        expected: Option<&crate::utils::hash::ExpectedHash>,
        managed: &mut Vec<ManagedFile>,
    ) -> Result<bool> {
        let Some(file_name) = file_name else {
            return Ok(false);
        };
        let rel = format!("mods/{}", file_name);

        if overrides.contains(&rel) || overrides.find_by_name(file_name).is_some() {
            // the overrides staging pass will place it
            return Ok(true);
        }

        let existing = instance_dir.join(&rel);
        if existing.is_file() {
            let acceptable = match expected {
                Some(expected) => {
                    let computed = hash_file(&existing, expected.algo)?;
                    expected.matches(&computed)
                }
                None => true,
            };
            if acceptable {
                staging.copy_in(&existing, &rel)?;
                managed.push(ManagedFile {
                    path: rel,
                    sha1: expected
                        .filter(|e| e.algo == HashAlgo::Sha1)
                        .map(|e| e.hex.clone()),
                    sha512: None,
                });
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn failure_is_required(&self, pack: &ResolvedPack, failure: &FailedMod) -> bool {
        match (failure.project_id, failure.file_id) {
            (Some(project_id), Some(file_id)) => pack
                .files
                .iter()
                .any(|f| {
                    f.required
                        && f.source
                            == SourceRef::CurseForge {
                                project_id,
                                file_id,
                            }
                }),
            _ => match &failure.file_name {
                Some(name) => pack.files.iter().any(|f| {
                    f.required && f.target_path.rsplit('/').next() == Some(name.as_str())
                }),
                None => false,
            },
        }
    }

    /// Carry user-owned content from the live tree into staging so the
    /// subtree swap preserves it, honoring the protection table.
    fn merge_existing_tree(
        &self,
        instance_id: &str,
        staging: &StagingArea,
        pack: &ResolvedPack,
        previous: Option<&InstanceMetadata>,
        flags: ProtectionFlags,
        forced: bool,
    ) -> Result<()> {
        let instance_dir = self.store.instance_dir(instance_id);
        if !instance_dir.exists() {
            return Ok(());
        }

        let upstream: HashSet<String> =
            pack.files.iter().map(|f| f.target_path.clone()).collect();
        let protection = ProtectionManifest::new(upstream, flags);

        let old_hashes: HashMap<&str, &ManagedFile> = previous
            .map(|m| {
                m.managed_files
                    .iter()
                    .map(|f| (f.path.as_str(), f))
                    .collect()
            })
            .unwrap_or_default();
        let old_managed: HashSet<&str> = old_hashes.keys().copied().collect();

        for tree in ["mods", "config", "scripts", "resourcepacks"] {
            let live = instance_dir.join(tree);
            if !live.is_dir() {
                continue;
            }
            for rel in walk_relative(&live, tree)? {
                let staged_has_it = staging.contains(&rel);
                let was_managed = old_managed.contains(rel.as_str());
                let user_modified = match old_hashes.get(rel.as_str()).copied() {
                    Some(old) => !self.disk_matches_managed(&instance_dir, old)?,
                    None => true,
                };

                if staged_has_it {
                    // upstream provides new bytes; protection decides
                    if protection.decide(&rel, user_modified, forced)
                        == MergeAction::KeepExisting
                    {
                        staging.copy_in(&instance_dir.join(&rel), &rel)?;
                        log::debug!("kept user version of {}", rel);
                    }
                    continue;
                }

                // not in the new plan: managed leftovers from the previous
                // version vanish, user territory survives
                if was_managed && !user_modified && protection.may_remove_stale(&rel) {
                    log::info!("dropping {} (absent from new version)", rel);
                    continue;
                }
                if was_managed && user_modified && forced {
                    log::info!("dropping modified upstream leftover {} (reinstall)", rel);
                    continue;
                }
                if protection.classify(&rel)
                    == crate::instance::protection::PathClass::UpstreamProtected
                    && !was_managed
                    && forced
                {
                    continue;
                }
                staging.copy_in(&instance_dir.join(&rel), &rel)?;
            }
        }
        Ok(())
    }

    fn disk_matches_managed(&self, instance_dir: &Path, managed: &ManagedFile) -> Result<bool> {
        let path = instance_dir.join(&managed.path);
        if !path.is_file() {
            return Ok(false);
        }
        if let Some(sha512) = &managed.sha512 {
            return Ok(hash_file(&path, HashAlgo::Sha512)?.eq_ignore_ascii_case(sha512));
        }
        if let Some(sha1) = &managed.sha1 {
            return Ok(hash_file(&path, HashAlgo::Sha1)?.eq_ignore_ascii_case(sha1));
        }
        // no recorded digest: treat as unmodified upstream
        Ok(true)
    }

    /// Repair: re-verify and re-fetch the Minecraft runtime, loader
    /// libraries and assets. Never touches mods or user content, and
    /// converges after any crash.
    pub async fn repair(&self, instance_id: &str) -> Result<(), EngineError> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;
        let _op = OperationGuard::enter(&self.in_flight, instance_id, "repair");
        self.repair_locked(instance_id)
            .await
            .map_err(EngineError::classify)
    }

    async fn repair_locked(&self, instance_id: &str) -> Result<()> {
        let meta = self
            .store
            .read_metadata(instance_id)?
            .ok_or_else(|| anyhow::anyhow!("instance {} is not installed", instance_id))?;
        self.store.clean_residue(instance_id)?;

        let bus = ProgressBus::new();
        self.forward_progress(instance_id, &bus);
        let phase = bus.phase(Step::InstallingRuntime, 0.0, 100.0);
        let cancel = CancelToken::never();
        let pool = FetchPool::new(self.client.clone(), self.config.download_concurrency);
        let ctx = InstallCtx {
            config: &self.config,
            client: &self.client,
            pool: &pool,
            phase: &phase,
            cancel: &cancel,
        };
        install_runtime(&ctx, &meta.minecraft_version, &meta.loader).await?;
        phase.finish();
        bus.complete();
        log::info!("repair of {} complete", instance_id);
        Ok(())
    }

    /// Launch an installed instance; waits for any in-flight mutation on the
    /// same instance before starting, and refuses double launches.
    pub async fn launch(
        &self,
        instance_id: &str,
        options: LaunchOptions,
    ) -> Result<ProcessHandle, EngineError> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;
        self.launch_locked(instance_id, options)
            .await
            .map_err(EngineError::classify)
    }

    async fn launch_locked(
        &self,
        instance_id: &str,
        options: LaunchOptions,
    ) -> Result<ProcessHandle> {
        if self.running.is_running(instance_id).await {
            return Err(anyhow::Error::from(EngineError::Busy(
                instance_id.to_string(),
            )));
        }
        let meta = self
            .store
            .read_metadata(instance_id)?
            .ok_or_else(|| anyhow::anyhow!("instance {} is not installed", instance_id))?;
        if self.store.status(instance_id, None)? == InstanceStatus::Error {
            anyhow::bail!(
                "instance {} has unfinished changes on disk; run repair first",
                instance_id
            );
        }

        let runtime =
            load_installed_runtime(&self.config, &meta.minecraft_version, &meta.loader)?;
        let credentials = options
            .credentials
            .unwrap_or_else(|| {
                Credentials::offline(options.offline_username.as_deref().unwrap_or("Player"))
            });

        let mut ctx = LaunchContext {
            config: self.config.clone(),
            instance_id: instance_id.to_string(),
            minecraft_version: meta.minecraft_version.clone(),
            game_dir: self.store.instance_dir(instance_id),
            runtime,
            credentials,
            max_ram_mb: resolve_ram_mb(&meta, &self.config),
            window: options.window,
            extra_jvm_args: Vec::new(),
        };
        if let Some(raw) = &options.extra_jvm_args {
            ctx.set_extra_jvm_args(raw);
        }

        launch_game(&ctx, self.events.clone(), self.running.clone()).await
    }

    /// Cooperative stop with the 10 s grace period.
    pub async fn stop(&self, instance_id: &str) -> Result<String, EngineError> {
        stop_game(instance_id, &self.events, &self.running)
            .await
            .map_err(EngineError::classify)
    }

    /// Offline integrity check of everything the engine installed.
    pub async fn verify(&self, instance_id: &str) -> Result<Vec<String>, EngineError> {
        let meta = self
            .store
            .read_metadata(instance_id)
            .map_err(EngineError::classify)?
            .ok_or_else(|| {
                EngineError::Unknown(anyhow::anyhow!("instance {} is not installed", instance_id))
            })?;
        self.store
            .verify_managed(&meta)
            .map_err(EngineError::classify)
    }

    /// Delete an instance tree; refuses while the game runs.
    pub async fn remove(&self, instance_id: &str) -> Result<(), EngineError> {
        if self.running.is_running(instance_id).await {
            return Err(EngineError::Busy(instance_id.to_string()));
        }
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;
        self.store
            .remove_instance(instance_id)
            .map_err(EngineError::classify)
    }

    pub fn list_instances(&self) -> Result<Vec<String>, EngineError> {
        self.store.list_instances().map_err(EngineError::classify)
    }

    /// The id of the mutating operation currently touching an instance, if
    /// any; read-only introspection for the UI.
    pub fn active_operation(&self, instance_id: &str) -> Option<uuid::Uuid> {
        self.in_flight.lock().unwrap().get(instance_id).copied()
    }

    /// Store pack art (logo, banner) fetched by the shell alongside the
    /// pack, under the shared meta tree.
    pub fn store_pack_art(
        &self,
        instance_id: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), EngineError> {
        let path = self.config.modpacks_dir().join(instance_id).join(name);
        crate::utils::fsx::write_atomic(&path, bytes).map_err(EngineError::classify)
    }

    /// Serve stored pack art to the UI as a data URL.
    pub fn pack_art_data_url(
        &self,
        instance_id: &str,
        name: &str,
    ) -> Result<Option<String>, EngineError> {
        let path = self.config.modpacks_dir().join(instance_id).join(name);
        if !path.is_file() {
            return Ok(None);
        }
        crate::utils::fsx::read_as_data_url(&path)
            .map(Some)
            .map_err(EngineError::classify)
    }
}

fn managed_entry_for(req: &DownloadRequest, staging: &StagingArea) -> Option<ManagedFile> {
    let rel = req
        .target
        .strip_prefix(staging.root())
        .ok()?
        .to_string_lossy()
        .replace('\\', "/");
    let (sha1, sha512) = match &req.expected_hash {
        Some(h) if h.algo == HashAlgo::Sha1 => (Some(h.hex.clone()), None),
        Some(h) if h.algo == HashAlgo::Sha512 => (None, Some(h.hex.clone())),
        _ => (None, None),
    };
    Some(ManagedFile {
        path: rel,
        sha1,
        sha512,
    })
}

/// Place a user-supplied file inside the instance tree: explicit relative
/// paths pass through, bare names route by extension the way archive
/// injection does (`.jar` to mods/, `.zip` to resourcepacks/).
fn route_user_override(path: &str) -> Option<String> {
    if path.contains('/') {
        return Some(path.to_string());
    }
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".jar") {
        Some(format!("mods/{}", path))
    } else if lower.ends_with(".zip") {
        Some(format!("resourcepacks/{}", path))
    } else {
        None
    }
}

/// Relative paths (forward slashes) of every file under `root`, prefixed
/// with `prefix/`.
fn walk_relative(root: &Path, prefix: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(format!(
                    "{}/{}",
                    prefix,
                    rel.to_string_lossy().replace('\\', "/")
                ));
            }
        }
    }
    out.sort();
    Ok(out)
}
