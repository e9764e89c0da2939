use crate::error::{classify_io, EngineError};
use crate::progress::PhaseHandle;
use crate::utils::fsx;
use crate::utils::hash::{hash_file, ExpectedHash};
use anyhow::{Context, Result};
use futures::StreamExt;
use rand::Rng;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const RENAME_ATTEMPTS: u32 = 5;

/// Cooperative cancellation: workers check between chunks and before every
/// retry. Cancelling preserves `.part` files for a later resume.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// A token that never fires, for operations without a cancel surface.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// One file the pool should fetch and place.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub target: PathBuf,
    pub expected_hash: Option<ExpectedHash>,
    pub size: Option<u64>,
    /// Display name for progress/failure reporting
    pub file_name: String,
    /// (project_id, file_id) when the file came from the mod registry
    pub source_ids: Option<(i64, i64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    Missing,
    Restricted,
    HashMismatch,
    Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedMod {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub reason: FailReason,
}

impl FailedMod {
    pub fn for_request(req: &DownloadRequest, reason: FailReason) -> Self {
        Self {
            project_id: req.source_ids.map(|(p, _)| p),
            file_id: req.source_ids.map(|(_, f)| f),
            file_name: Some(req.file_name.clone()),
            reason,
        }
    }
}

#[derive(Debug, Default)]
pub struct DownloadResult {
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<FailedMod>,
}

impl DownloadResult {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

enum FileOutcome {
    Succeeded(PathBuf),
    Failed(FailedMod),
}

/// Bounded-parallel downloader with retry, backoff and range resume.
pub struct FetchPool {
    client: Client,
    concurrency: usize,
}

impl FetchPool {
    pub fn new(client: Client, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
        }
    }

    /// Fetch every request, bounded by the pool's concurrency. Per-file
    /// failures are collected into the result; auth errors and cancellation
    /// abort the whole run.
    pub async fn run(
        &self,
        requests: Vec<DownloadRequest>,
        phase: Option<&PhaseHandle>,
        cancel: &CancelToken,
    ) -> Result<DownloadResult> {
        let total = requests.len() as u64;
        if total == 0 {
            return Ok(DownloadResult::default());
        }

        let completed = Arc::new(AtomicU64::new(0));
        let outcomes: Vec<Result<FileOutcome>> = futures::stream::iter(requests)
            .map(|req| {
                let client = self.client.clone();
                let cancel = cancel.clone();
                let completed = completed.clone();
                async move {
                    let outcome = fetch_one(&client, &req, &cancel, phase).await;
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(phase) = phase {
                        phase.tick_counter(done, total);
                    }
                    outcome
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut result = DownloadResult::default();
        for outcome in outcomes {
            match outcome? {
                FileOutcome::Succeeded(path) => result.succeeded.push(path),
                FileOutcome::Failed(failed) => {
                    log::warn!(
                        "download failed permanently: {:?} ({:?})",
                        failed.file_name,
                        failed.reason
                    );
                    result.failed.push(failed);
                }
            }
        }
        Ok(result)
    }
}

async fn fetch_one(
    client: &Client,
    req: &DownloadRequest,
    cancel: &CancelToken,
    phase: Option<&PhaseHandle>,
) -> Result<FileOutcome> {
    // Already present and verified: nothing to do.
    if req.target.exists() {
        match &req.expected_hash {
            Some(expected) => {
                if let Ok(Ok(())) = crate::utils::hash::verify_file(&req.target, expected) {
                    log::debug!("already on disk with matching hash: {:?}", req.target);
                    return Ok(FileOutcome::Succeeded(req.target.clone()));
                }
                log::info!("stale file on disk, re-downloading: {:?}", req.target);
            }
            None => {
                log::debug!("already on disk (no hash to check): {:?}", req.target);
                return Ok(FileOutcome::Succeeded(req.target.clone()));
            }
        }
    }

    let part_path = part_path_for(&req.target);
    let mut last_reason = FailReason::Network;

    for attempt in 1..=MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            anyhow::bail!("download cancelled");
        }

        match stream_to_part(client, req, &part_path, cancel, phase).await {
            Ok(()) => {
                if let Some(expected) = &req.expected_hash {
                    let computed = hash_file(&part_path, expected.algo)?;
                    if !expected.matches(&computed) {
                        log::warn!(
                            "hash mismatch for {} (attempt {}/{}): expected {}, got {}",
                            req.file_name,
                            attempt,
                            MAX_ATTEMPTS,
                            expected.hex,
                            computed
                        );
                        let _ = std::fs::remove_file(&part_path);
                        last_reason = FailReason::HashMismatch;
                        sleep_backoff(attempt).await;
                        continue;
                    }
                }
                move_into_place(&part_path, &req.target).await?;
                return Ok(FileOutcome::Succeeded(req.target.clone()));
            }
            Err(err) => match err {
                FetchError::Fatal(e) => return Err(e),
                FetchError::Terminal(reason, msg) => {
                    log::warn!("terminal download error for {}: {}", req.file_name, msg);
                    return Ok(FileOutcome::Failed(FailedMod::for_request(req, reason)));
                }
                FetchError::Transient(msg, retry_after) => {
                    last_reason = FailReason::Network;
                    log::warn!(
                        "download error for {} (attempt {}/{}): {}",
                        req.file_name,
                        attempt,
                        MAX_ATTEMPTS,
                        msg
                    );
                    if attempt < MAX_ATTEMPTS {
                        match retry_after {
                            Some(delay) => tokio::time::sleep(delay).await,
                            None => sleep_backoff(attempt).await,
                        }
                    }
                }
            },
        }
    }

    Ok(FileOutcome::Failed(FailedMod::for_request(req, last_reason)))
}

enum FetchError {
    /// Aborts the whole pool (auth failures, cancellation, disk trouble)
    Fatal(anyhow::Error),
    /// This file is done for, others continue
    Terminal(FailReason, String),
    /// Worth retrying, optionally after a server-mandated delay
    Transient(String, Option<Duration>),
}

async fn stream_to_part(
    client: &Client,
    req: &DownloadRequest,
    part_path: &Path,
    cancel: &CancelToken,
    phase: Option<&PhaseHandle>,
) -> std::result::Result<(), FetchError> {
    if let Some(parent) = part_path.parent() {
        fsx::ensure_dir(parent).map_err(FetchError::Fatal)?;
    }

    let resume_from = std::fs::metadata(part_path).map(|m| m.len()).unwrap_or(0);
    let mut request = client.get(&req.url);
    if resume_from > 0 {
        log::debug!(
            "resuming {} from byte {} via range request",
            req.file_name,
            resume_from
        );
        request = request.header(RANGE, format!("bytes={}-", resume_from));
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => return Err(FetchError::Transient(e.to_string(), None)),
    };

    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED => {
            return Err(FetchError::Fatal(anyhow::Error::from(
                EngineError::CurseforgeUnauthorized,
            )))
        }
        StatusCode::FORBIDDEN => {
            return Err(FetchError::Fatal(anyhow::Error::from(
                EngineError::CurseforgeForbidden,
            )))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            let delay = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::Transient("rate limited (429)".into(), delay));
        }
        StatusCode::REQUEST_TIMEOUT => {
            return Err(FetchError::Transient("request timeout (408)".into(), None))
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            // stale .part larger than the remote file; restart clean
            let _ = std::fs::remove_file(part_path);
            return Err(FetchError::Transient("range not satisfiable".into(), None));
        }
        StatusCode::NOT_FOUND => {
            return Err(FetchError::Terminal(
                FailReason::Missing,
                format!("404 for {}", req.url),
            ))
        }
        s if s.is_server_error() => {
            return Err(FetchError::Transient(format!("server error {}", s), None))
        }
        s if s.is_client_error() => {
            return Err(FetchError::Terminal(
                FailReason::Network,
                format!("HTTP {} for {}", s, req.url),
            ))
        }
        _ => {}
    }

    // 206 keeps the partial bytes, a plain 200 restarts the file.
    let append = status == StatusCode::PARTIAL_CONTENT && resume_from > 0;
    let ranges_supported = response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false)
        || append;
    if resume_from > 0 && !append {
        log::debug!(
            "server ignored range request for {} (ranges supported: {}), restarting",
            req.file_name,
            ranges_supported
        );
    }

    let total_size = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|len| if append { len + resume_from } else { len })
        .or(req.size);

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(append)
        .write(true)
        .truncate(!append)
        .open(part_path)
        .await
        .map_err(|e| fatal_io(e, part_path))?;

    let mut written = if append { resume_from } else { 0 };
    let started = Instant::now();
    let mut last_tick = Instant::now();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            // flush what we have so the next run resumes from it
            let _ = file.flush().await;
            return Err(FetchError::Fatal(anyhow::anyhow!("download cancelled")));
        }
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => return Err(FetchError::Transient(e.to_string(), None)),
        };
        file.write_all(&chunk)
            .await
            .map_err(|e| fatal_io(e, part_path))?;
        written += chunk.len() as u64;

        if let Some(phase) = phase {
            if last_tick.elapsed() >= Duration::from_millis(100) {
                last_tick = Instant::now();
                let elapsed = started.elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 {
                    ((written.saturating_sub(resume_from)) as f64 / elapsed) as u64
                } else {
                    0
                };
                phase.note_file(req.file_name.clone(), rate);
            }
        }
    }

    file.flush().await.map_err(|e| fatal_io(e, part_path))?;
    file.sync_all().await.map_err(|e| fatal_io(e, part_path))?;

    if let Some(total) = total_size {
        if written < total {
            return Err(FetchError::Transient(
                format!("connection closed early ({}/{} bytes)", written, total),
                None,
            ));
        }
    }

    Ok(())
}

fn fatal_io(err: std::io::Error, path: &Path) -> FetchError {
    if let Some(engine) = classify_io(&err) {
        return FetchError::Fatal(anyhow::Error::from(engine));
    }
    FetchError::Fatal(anyhow::Error::from(err).context(format!("write {:?}", path)))
}

async fn move_into_place(part: &Path, target: &Path) -> Result<()> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match fsx::move_file(part, target) {
            Ok(()) => return Ok(()),
            Err(err) => {
                let in_use = err
                    .chain()
                    .filter_map(|c| c.downcast_ref::<std::io::Error>())
                    .any(|io| matches!(classify_io(io), Some(EngineError::FileInUse(_))));
                if in_use && attempt < RENAME_ATTEMPTS {
                    log::warn!(
                        "target in use, retrying rename ({}/{}): {:?}",
                        attempt,
                        RENAME_ATTEMPTS,
                        target
                    );
                    sleep_backoff(attempt).await;
                    continue;
                }
                if in_use {
                    return Err(anyhow::Error::from(EngineError::FileInUse(
                        target.display().to_string(),
                    )));
                }
                return Err(err).with_context(|| format!("finalize download {:?}", target));
            }
        }
    }
}

fn part_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    target.with_file_name(format!("{}.part", name))
}

async fn sleep_backoff(attempt: u32) {
    tokio::time::sleep(backoff_delay(attempt)).await;
}

/// Exponential backoff with ±20% jitter, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE
        .as_millis()
        .saturating_mul(1u128 << (attempt.saturating_sub(1)).min(16)) as u64;
    let capped = exp.min(BACKOFF_CAP.as_millis() as u64);
    let jitter = rand::rng().random_range(0.8..=1.2);
    Duration::from_millis(((capped as f64) * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hash::{hash_bytes, HashAlgo};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn request_for(server_url: &str, route: &str, target: &Path) -> DownloadRequest {
        DownloadRequest {
            url: format!("{}{}", server_url, route),
            target: target.to_path_buf(),
            expected_hash: None,
            size: None,
            file_name: route.trim_start_matches('/').to_string(),
            source_ids: None,
        }
    }

    #[tokio::test]
    async fn downloads_and_verifies() {
        let server = MockServer::start().await;
        let body = b"mod bytes".to_vec();
        Mock::given(method("GET"))
            .and(path("/a.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("mods/a.jar");
        let mut req = request_for(&server.uri(), "/a.jar", &target);
        req.expected_hash = Some(ExpectedHash::sha1(hash_bytes(&body, HashAlgo::Sha1)));

        let pool = FetchPool::new(Client::new(), 4);
        let result = pool
            .run(vec![req], None, &CancelToken::never())
            .await
            .unwrap();
        assert!(result.all_succeeded());
        assert_eq!(std::fs::read(&target).unwrap(), body);
        assert!(!tmp.path().join("mods/a.jar.part").exists());
    }

    #[tokio::test]
    async fn retries_server_errors_up_to_the_bound() {
        struct FlakyTwice {
            hits: std::sync::atomic::AtomicU32,
        }
        impl Respond for FlakyTwice {
            fn respond(&self, _: &Request) -> ResponseTemplate {
                let n = self.hits.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    ResponseTemplate::new(500)
                } else {
                    ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec())
                }
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky.jar"))
            .respond_with(FlakyTwice {
                hits: std::sync::atomic::AtomicU32::new(0),
            })
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("flaky.jar");
        let pool = FetchPool::new(Client::new(), 1);
        let result = pool
            .run(
                vec![request_for(&server.uri(), "/flaky.jar", &target)],
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap();
        assert!(result.all_succeeded());
        assert_eq!(std::fs::read(&target).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down.jar"))
            .respond_with(ResponseTemplate::new(500))
            .expect(u64::from(MAX_ATTEMPTS))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("down.jar");
        let pool = FetchPool::new(Client::new(), 1);
        let result = pool
            .run(
                vec![request_for(&server.uri(), "/down.jar", &target)],
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap();
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].reason, FailReason::Network);
    }

    #[tokio::test]
    async fn auth_errors_abort_the_pool() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/locked.jar"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("locked.jar");
        let pool = FetchPool::new(Client::new(), 1);
        let err = pool
            .run(
                vec![request_for(&server.uri(), "/locked.jar", &target)],
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            EngineError::classify(err),
            EngineError::CurseforgeUnauthorized
        ));
    }

    #[tokio::test]
    async fn missing_file_is_terminal_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.jar"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("gone.jar");
        let pool = FetchPool::new(Client::new(), 1);
        let result = pool
            .run(
                vec![request_for(&server.uri(), "/gone.jar", &target)],
                None,
                &CancelToken::never(),
            )
            .await
            .unwrap();
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].reason, FailReason::Missing);
    }

    #[tokio::test]
    async fn hash_mismatch_retries_then_reports() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bad.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"wrong".to_vec()))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("bad.jar");
        let mut req = request_for(&server.uri(), "/bad.jar", &target);
        req.expected_hash = Some(ExpectedHash::sha1(
            "0000000000000000000000000000000000000000",
        ));

        let pool = FetchPool::new(Client::new(), 1);
        let result = pool
            .run(vec![req], None, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].reason, FailReason::HashMismatch);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn resumes_from_existing_part_file() {
        let full = b"0123456789abcdef".to_vec();

        struct RangeAware {
            body: Vec<u8>,
        }
        impl Respond for RangeAware {
            fn respond(&self, req: &Request) -> ResponseTemplate {
                if let Some(range) = req.headers.get("range") {
                    let spec = range.to_str().unwrap_or("");
                    let from: usize = spec
                        .trim_start_matches("bytes=")
                        .trim_end_matches('-')
                        .parse()
                        .unwrap_or(0);
                    ResponseTemplate::new(206)
                        .insert_header("accept-ranges", "bytes")
                        .set_body_bytes(self.body[from..].to_vec())
                } else {
                    ResponseTemplate::new(200)
                        .insert_header("accept-ranges", "bytes")
                        .set_body_bytes(self.body.clone())
                }
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resume.jar"))
            .respond_with(RangeAware { body: full.clone() })
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("resume.jar");
        // a previous run left the first 6 bytes behind
        std::fs::write(tmp.path().join("resume.jar.part"), &full[..6]).unwrap();

        let mut req = request_for(&server.uri(), "/resume.jar", &target);
        req.expected_hash = Some(ExpectedHash::sha1(hash_bytes(&full, HashAlgo::Sha1)));

        let pool = FetchPool::new(Client::new(), 1);
        let result = pool
            .run(vec![req], None, &CancelToken::never())
            .await
            .unwrap();
        assert!(result.all_succeeded());
        assert_eq!(std::fs::read(&target).unwrap(), full);
    }

    #[tokio::test]
    async fn skips_files_already_valid_on_disk() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cached.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
            .expect(0)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("cached.jar");
        std::fs::write(&target, b"data").unwrap();

        let mut req = request_for(&server.uri(), "/cached.jar", &target);
        req.expected_hash = Some(ExpectedHash::sha1(hash_bytes(b"data", HashAlgo::Sha1)));

        let pool = FetchPool::new(Client::new(), 1);
        let result = pool
            .run(vec![req], None, &CancelToken::never())
            .await
            .unwrap();
        assert!(result.all_succeeded());
    }

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..16 {
            let a1 = backoff_delay(1);
            assert!(a1 >= Duration::from_millis(400) && a1 <= Duration::from_millis(600));
            let a10 = backoff_delay(10);
            assert!(a10 <= Duration::from_millis(12_000));
        }
    }
}
