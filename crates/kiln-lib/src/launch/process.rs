use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus, LogStream};
use crate::launch::arguments::{build_game_arguments, build_jvm_arguments};
use crate::launch::classpath::{build_classpath, missing_libraries};
use crate::launch::registry::{pid_alive, RunningInstance, RunningRegistry};
use crate::launch::LaunchContext;
use crate::loader::version::VersionJson;
use crate::utils::fsx;
use crate::utils::process as spawn_opts;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;

/// How long a polite stop request gets before escalation.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Handle to a supervised game process. Log lines and lifecycle events flow
/// through the instance's event channel; the handle itself only exposes the
/// exit observer.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl ProcessHandle {
    /// Wait until the process exits, returning its code when the platform
    /// reports one.
    pub async fn wait_exit(&mut self) -> Option<i32> {
        loop {
            if let Some(code) = *self.exit_rx.borrow() {
                return Some(code);
            }
            if self.exit_rx.changed().await.is_err() {
                return *self.exit_rx.borrow();
            }
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }
}

/// Spawn the game for an installed instance: build the argv offline, pipe
/// both output streams into the event channel, and reap the exit.
pub async fn launch_game(
    ctx: &LaunchContext,
    events: Arc<EventBus>,
    registry: Arc<RunningRegistry>,
) -> Result<ProcessHandle> {
    let version = &ctx.runtime.version;
    log::info!(
        "launching {} ({} as {})",
        ctx.instance_id,
        ctx.runtime.installed_id,
        ctx.credentials.username
    );

    if !ctx.runtime.java_path.is_file() {
        return Err(anyhow::Error::from(EngineError::JavaError(format!(
            "java executable missing: {}",
            ctx.runtime.java_path.display()
        ))));
    }

    let libraries_dir = ctx.config.libraries_dir();
    let missing = missing_libraries(version, &libraries_dir);
    if !missing.is_empty() {
        log::error!("{} libraries missing before launch: {:?}", missing.len(), missing);
        return Err(anyhow::Error::from(EngineError::LoaderIncomplete(
            missing[0].clone(),
        )));
    }

    let natives_dir = ctx.config.natives_dir(&ctx.minecraft_version);
    extract_natives(version, &libraries_dir, &natives_dir)?;

    let game_jar = resolve_game_jar(ctx)?;
    let classpath = build_classpath(version, &libraries_dir, &game_jar)?;
    let jvm_args = build_jvm_arguments(ctx, version, &natives_dir, &classpath);
    let game_args = build_game_arguments(ctx, version);
    let main_class = version
        .main_class
        .clone()
        .ok_or_else(|| EngineError::JavaError("version document has no main class".into()))?;

    fsx::ensure_dir(&ctx.game_dir)?;

    let mut command = tokio::process::Command::new(&ctx.runtime.java_path);
    command
        .args(&jvm_args)
        .arg(&main_class)
        .args(&game_args)
        .current_dir(&ctx.game_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    spawn_opts::detach(&mut command);

    let mut child = command.spawn().context("spawn game process")?;
    let pid = child
        .id()
        .ok_or_else(|| EngineError::JavaError("spawned process has no pid".into()))?;
    let started_at = Utc::now();
    log::info!("game process started: pid {}", pid);

    // log pumps own the pipe read halves exclusively
    if let Some(stdout) = child.stdout.take() {
        spawn_log_pump(stdout, LogStream::Stdout, ctx.instance_id.clone(), events.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_log_pump(stderr, LogStream::Stderr, ctx.instance_id.clone(), events.clone());
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let reaper_events = events.clone();
    let reaper_registry = registry.clone();
    let reaper_id = ctx.instance_id.clone();
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => {
                let code = status.code();
                if status.success() {
                    log::info!("instance {} exited cleanly", reaper_id);
                } else {
                    log::warn!("instance {} exited with {:?}", reaper_id, code);
                }
                code
            }
            Err(e) => {
                log::error!("failed to reap instance {}: {}", reaper_id, e);
                None
            }
        };
        let _ = exit_tx.send(Some(code.unwrap_or(-1)));
        reaper_events.emit(&reaper_id, EngineEvent::Exited { code });
        reaper_registry.unregister(&reaper_id).await;
    });

    registry
        .register(RunningInstance {
            instance_id: ctx.instance_id.clone(),
            pid,
            started_at,
        })
        .await;
    events.emit(&ctx.instance_id, EngineEvent::Started { pid });

    Ok(ProcessHandle {
        pid,
        started_at,
        exit_rx,
    })
}

/// Ask a running instance to stop: polite close, ten seconds of grace, then
/// the axe. Returns a short human-readable account of what it took.
pub async fn stop_game(
    instance_id: &str,
    events: &EventBus,
    registry: &RunningRegistry,
) -> Result<String> {
    let Some(running) = registry.get(instance_id).await else {
        anyhow::bail!("instance {} is not running", instance_id);
    };
    events.emit(instance_id, EngineEvent::Stopping);
    log::info!("stopping instance {} (pid {})", instance_id, running.pid);

    request_graceful_stop(running.pid)?;

    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(running.pid) {
            registry.unregister(instance_id).await;
            return Ok("stopped gracefully".to_string());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    log::warn!(
        "instance {} ignored the stop request, killing pid {}",
        instance_id,
        running.pid
    );
    force_kill(running.pid)?;
    registry.unregister(instance_id).await;
    Ok("grace period elapsed, killed".to_string())
}

fn spawn_log_pump<R>(
    reader: R,
    stream: LogStream,
    instance_id: String,
    events: Arc<EventBus>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            events.emit(&instance_id, EngineEvent::Log { stream, line });
        }
    });
}

fn resolve_game_jar(ctx: &LaunchContext) -> Result<PathBuf> {
    let versions_dir = ctx.config.versions_dir();
    let installed_jar = versions_dir.join(format!("{}.jar", ctx.runtime.installed_id));
    if installed_jar.is_file() {
        return Ok(installed_jar);
    }
    let vanilla_jar = versions_dir.join(format!("{}.jar", ctx.minecraft_version));
    if vanilla_jar.is_file() {
        return Ok(vanilla_jar);
    }
    Err(anyhow::Error::from(EngineError::LoaderIncomplete(format!(
        "game jar for {}",
        ctx.minecraft_version
    ))))
}

/// Unpack the native libraries this host needs next to the instance's
/// version, once per version. Jars without a native classifier for the host
/// are skipped.
fn extract_natives(
    version: &VersionJson,
    libraries_dir: &Path,
    natives_dir: &Path,
) -> Result<()> {
    fsx::ensure_dir(natives_dir)?;
    for library in version.libraries.iter().filter(|l| l.applies_to_host()) {
        let Some(native) = library.native_artifact() else {
            continue;
        };
        let Some(path) = &native.path else {
            continue;
        };
        let jar = libraries_dir.join(path);
        if !jar.is_file() {
            log::warn!("native jar missing, skipping: {:?}", jar);
            continue;
        }
        let mut archive = crate::archive::PackArchive::open(&jar)?;
        archive.extract_filtered(natives_dir, |name| {
            let lower = name.to_ascii_lowercase();
            lower.ends_with(".so") || lower.ends_with(".dll") || lower.ends_with(".dylib") || lower.ends_with(".jnilib")
        })?;
    }
    Ok(())
}

#[cfg(unix)]
fn request_graceful_stop(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("send SIGTERM")?;
    Ok(())
}

#[cfg(unix)]
fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).context("send SIGKILL"),
    }
}

#[cfg(windows)]
fn request_graceful_stop(pid: u32) -> Result<()> {
    use windows_sys::Win32::Foundation::HWND;
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindowThreadProcessId, IsWindowVisible, PostMessageW, WM_CLOSE,
    };

    struct FindState {
        pid: u32,
        hwnd: Option<HWND>,
    }

    extern "system" fn enum_callback(hwnd: HWND, lparam: isize) -> i32 {
        unsafe {
            let state = &mut *(lparam as *mut FindState);
            let mut proc_id = 0u32;
            GetWindowThreadProcessId(hwnd, &mut proc_id);
            if proc_id == state.pid && IsWindowVisible(hwnd) != 0 {
                state.hwnd = Some(hwnd);
                return 0;
            }
            1
        }
    }

    let mut state = FindState { pid, hwnd: None };
    unsafe {
        EnumWindows(Some(enum_callback), &mut state as *mut FindState as isize);
        if let Some(hwnd) = state.hwnd {
            PostMessageW(hwnd, WM_CLOSE, 0, 0);
            return Ok(());
        }
    }
    log::debug!("no visible window for pid {}, skipping WM_CLOSE", pid);
    Ok(())
}

#[cfg(windows)]
fn force_kill(pid: u32) -> Result<()> {
    let mut command = std::process::Command::new("taskkill");
    command.args(["/PID", &pid.to_string(), "/T", "/F"]);
    spawn_opts::suppress_console_std(&mut command);
    let output = command.output().context("run taskkill")?;
    if !output.status.success() {
        anyhow::bail!(
            "taskkill failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}
