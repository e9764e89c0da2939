use crate::error::EngineError;
use crate::utils::hash::{ExpectedHash, HashAlgo};
use anyhow::Result;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Registry batching limits: ids per call and calls in flight.
const BATCH_SIZE: usize = 50;
const BATCH_PARALLELISM: usize = 4;
const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetModFilesRequest {
    file_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    data: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModFileInfo {
    pub id: i64,
    #[serde(default)]
    pub mod_id: Option<i64>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub file_status: Option<i32>,
    #[serde(default)]
    pub file_length: Option<u64>,
    #[serde(default)]
    pub hashes: Vec<FileHashInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHashInfo {
    pub value: String,
    /// 1 = SHA-1, 2 = MD5
    pub algo: u32,
}

impl ModFileInfo {
    pub fn sha1(&self) -> Option<ExpectedHash> {
        self.hashes
            .iter()
            .find(|h| h.algo == 1)
            .map(|h| ExpectedHash::new(HashAlgo::Sha1, h.value.clone()))
    }
}

/// What the registry said about one requested `(project_id, file_id)` pair.
#[derive(Debug, Clone)]
pub enum FileResolution {
    /// A concrete download
    Resolved {
        url: String,
        file_name: String,
        hash: Option<ExpectedHash>,
        size: Option<u64>,
    },
    /// Metadata exists but distribution is disabled by the author; the hash
    /// still lets the engine verify a user-supplied substitute
    Restricted {
        file_name: Option<String>,
        hash: Option<ExpectedHash>,
    },
    /// The registry does not know the file
    Missing,
}

#[derive(Debug, Clone)]
pub struct ResolvedModFile {
    pub project_id: i64,
    pub file_id: i64,
    pub resolution: FileResolution,
}

/// Client for the authenticated mod-registry proxy. The proxy injects the
/// upstream API key; this side only sees 401/403 when that goes wrong.
pub struct RegistryClient {
    client: Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Resolve a set of `(project_id, file_id)` pairs to download URLs,
    /// classifying what cannot be downloaded. Batches of up to 50 ids run
    /// with bounded parallelism; every requested pair appears exactly once
    /// in the result.
    pub async fn resolve_files(&self, refs: &[(i64, i64)]) -> Result<Vec<ResolvedModFile>> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }

        let chunks: Vec<Vec<i64>> = refs
            .chunks(BATCH_SIZE)
            .map(|c| c.iter().map(|(_, file_id)| *file_id).collect())
            .collect();
        let total_batches = chunks.len();
        log::info!(
            "resolving {} mod files in {} registry batches",
            refs.len(),
            total_batches
        );

        let batch_results: Vec<Result<Vec<ModFileInfo>>> = futures::stream::iter(
            chunks.into_iter().enumerate(),
        )
        .map(|(idx, file_ids)| async move {
            log::debug!(
                "registry batch {}/{} ({} ids)",
                idx + 1,
                total_batches,
                file_ids.len()
            );
            self.fetch_batch(file_ids).await
        })
        .buffer_unordered(BATCH_PARALLELISM)
        .collect()
        .await;

        let mut by_file_id: HashMap<i64, ModFileInfo> = HashMap::new();
        let mut failed_batches = 0usize;
        let mut last_err: Option<anyhow::Error> = None;
        for result in batch_results {
            match result {
                Ok(rows) => {
                    for row in rows {
                        by_file_id.insert(row.id, row);
                    }
                }
                Err(err) => {
                    // Auth failures abort outright; transport trouble lets
                    // the remaining batches classify as missing.
                    match EngineError::classify(err) {
                        e @ (EngineError::CurseforgeUnauthorized
                        | EngineError::CurseforgeForbidden) => return Err(e.into()),
                        e => {
                            failed_batches += 1;
                            log::warn!("registry batch failed: {}", e);
                            last_err = Some(e.into());
                        }
                    }
                }
            }
        }

        if failed_batches == total_batches {
            let err = last_err
                .unwrap_or_else(|| anyhow::anyhow!("all registry batches failed"));
            return Err(anyhow::Error::from(EngineError::RegistryNetwork(
                err.to_string(),
            )));
        }

        // Correlate the response set against the requested set: anything the
        // registry did not return is missing, not silently dropped.
        let mut out = Vec::with_capacity(refs.len());
        for &(project_id, file_id) in refs {
            let resolution = match by_file_id.get(&file_id) {
                Some(info) => match &info.download_url {
                    Some(url) if !url.is_empty() => FileResolution::Resolved {
                        url: url.clone(),
                        file_name: info
                            .file_name
                            .clone()
                            .unwrap_or_else(|| format!("file-{}.jar", file_id)),
                        hash: info.sha1(),
                        size: info.file_length,
                    },
                    _ => FileResolution::Restricted {
                        file_name: info.file_name.clone(),
                        hash: info.sha1(),
                    },
                },
                None => FileResolution::Missing,
            };
            out.push(ResolvedModFile {
                project_id,
                file_id,
                resolution,
            });
        }
        Ok(out)
    }

    async fn fetch_batch(&self, file_ids: Vec<i64>) -> Result<Vec<ModFileInfo>> {
        let url = format!("{}/mods/files", self.base_url);
        let body = GetModFilesRequest { file_ids };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let response = match self.client.post(&url).json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(anyhow::Error::from(EngineError::RegistryNetwork(
                            e.to_string(),
                        )));
                    }
                    log::warn!(
                        "registry connection error (attempt {}/{}): {}",
                        attempt,
                        MAX_ATTEMPTS,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                    continue;
                }
            };

            match response.status() {
                StatusCode::UNAUTHORIZED => {
                    return Err(anyhow::Error::from(EngineError::CurseforgeUnauthorized))
                }
                StatusCode::FORBIDDEN => {
                    return Err(anyhow::Error::from(EngineError::CurseforgeForbidden))
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(anyhow::Error::from(EngineError::RegistryNetwork(
                            "rate limit exceeded (429)".into(),
                        )));
                    }
                    let delay = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(1 << attempt.min(4)));
                    log::warn!("registry rate limited, backing off {:?}", delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                s if s.is_server_error() => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(anyhow::Error::from(EngineError::RegistryNetwork(
                            format!("registry error {}", s),
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                    continue;
                }
                StatusCode::NOT_FOUND => {
                    // acceptable: none of the requested files exist
                    return Ok(Vec::new());
                }
                s if !s.is_success() => {
                    return Err(anyhow::Error::from(EngineError::RegistryNetwork(
                        format!("registry error {}", s),
                    )));
                }
                _ => {}
            }

            let envelope: ApiEnvelope<Vec<ModFileInfo>> = response
                .json()
                .await
                .map_err(|e| EngineError::RegistryNetwork(format!("bad registry payload: {}", e)))?;
            return Ok(envelope.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> Client {
        Client::new()
    }

    #[tokio::test]
    async fn classifies_resolved_restricted_and_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mods/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {
                        "id": 100,
                        "modId": 1,
                        "fileName": "alpha.jar",
                        "downloadUrl": "https://cdn.example/alpha.jar",
                        "hashes": [{"value": "aa", "algo": 1}, {"value": "bb", "algo": 2}]
                    },
                    {
                        "id": 200,
                        "modId": 2,
                        "fileName": "beta.jar",
                        "downloadUrl": null
                    }
                ]
            })))
            .mount(&server)
            .await;

        let registry = RegistryClient::new(client(), server.uri());
        let resolved = registry
            .resolve_files(&[(1, 100), (2, 200), (3, 300)])
            .await
            .unwrap();
        assert_eq!(resolved.len(), 3);

        match &resolved[0].resolution {
            FileResolution::Resolved { url, file_name, hash, .. } => {
                assert_eq!(url, "https://cdn.example/alpha.jar");
                assert_eq!(file_name, "alpha.jar");
                assert_eq!(hash.as_ref().unwrap().hex, "aa");
            }
            other => panic!("expected resolved, got {:?}", other),
        }
        assert!(matches!(
            resolved[1].resolution,
            FileResolution::Restricted { .. }
        ));
        assert!(matches!(resolved[2].resolution, FileResolution::Missing));
    }

    #[tokio::test]
    async fn batches_requests_of_more_than_fifty_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mods/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .expect(2)
            .mount(&server)
            .await;

        let refs: Vec<(i64, i64)> = (0..60).map(|i| (i, 1000 + i)).collect();
        let registry = RegistryClient::new(client(), server.uri());
        let resolved = registry.resolve_files(&refs).await.unwrap();
        assert_eq!(resolved.len(), 60);
        assert!(resolved
            .iter()
            .all(|r| matches!(r.resolution, FileResolution::Missing)));
    }

    #[tokio::test]
    async fn unauthorized_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mods/files"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let registry = RegistryClient::new(client(), server.uri());
        let err = registry.resolve_files(&[(1, 100)]).await.unwrap_err();
        assert!(matches!(
            EngineError::classify(err),
            EngineError::CurseforgeUnauthorized
        ));
    }

    #[tokio::test]
    async fn forbidden_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mods/files"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let registry = RegistryClient::new(client(), server.uri());
        let err = registry.resolve_files(&[(1, 100)]).await.unwrap_err();
        assert!(matches!(
            EngineError::classify(err),
            EngineError::CurseforgeForbidden
        ));
    }

    #[tokio::test]
    async fn total_transport_failure_maps_to_registry_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mods/files"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = RegistryClient::new(client(), server.uri());
        let err = registry.resolve_files(&[(1, 100)]).await.unwrap_err();
        assert!(matches!(
            EngineError::classify(err),
            EngineError::RegistryNetwork(_)
        ));
    }

    #[tokio::test]
    async fn request_body_carries_file_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mods/files"))
            .and(body_partial_json(json!({"fileIds": [100]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .expect(1)
            .mount(&server)
            .await;

        let registry = RegistryClient::new(client(), server.uri());
        registry.resolve_files(&[(1, 100)]).await.unwrap();
    }
}
