//! Lead store persistence + HTTP transport utilities for DLH.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dlh_core::Lead;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dlh-storage";

/// Prior store state as handed to the lifecycle transform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub leads: Vec<Lead>,
    /// Elements of the persisted array that were not valid lead records.
    pub dropped_records: usize,
    /// Where an unparsable store file was copied before starting over.
    pub quarantined_to: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading lead store {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing lead store {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("preserving corrupt lead store at {}: {source}", .path.display())]
    Quarantine {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("lead store {} is unparsable: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("encoding lead store: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Whole-collection persistence boundary: load once, save once per run.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn load(&self) -> Result<StoreSnapshot, StoreError>;
    async fn save(&self, leads: &[Lead]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn quarantine_path(&self, bytes: &[u8]) -> PathBuf {
        let hash = Self::sha256_hex(bytes);
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "leads.json".to_string());
        self.path
            .with_file_name(format!("{file_name}.corrupt-{}", &hash[..12]))
    }

    async fn quarantine(&self, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let target = self.quarantine_path(bytes);
        let exists = fs::try_exists(&target)
            .await
            .map_err(|source| StoreError::Quarantine {
                path: target.clone(),
                source,
            })?;
        if !exists {
            fs::write(&target, bytes)
                .await
                .map_err(|source| StoreError::Quarantine {
                    path: target.clone(),
                    source,
                })?;
        }
        Ok(target)
    }

    async fn write_atomically(&self, bytes: &[u8]) -> std::io::Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if written.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        written
    }
}

/// Parse a persisted array, dropping elements that are not lead records.
pub fn decode_leads(bytes: &[u8]) -> Result<(Vec<Lead>, usize), serde_json::Error> {
    let values: Vec<JsonValue> = serde_json::from_slice(bytes)?;
    let mut leads = Vec::with_capacity(values.len());
    let mut dropped = 0usize;
    for (index, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<Lead>(value) {
            Ok(lead) => leads.push(lead),
            Err(err) => {
                warn!(index, error = %err, "dropping malformed stored lead");
                dropped += 1;
            }
        }
    }
    Ok((leads, dropped))
}

/// Pretty-print with 4-space indentation, the layout existing store files use.
pub fn encode_leads(leads: &[Lead]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    leads.serialize(&mut serializer)?;
    Ok(buf)
}

impl JsonFileStore {
    /// Raw store bytes, or `None` when the file is missing or blank.
    async fn read_bytes(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Load without side effects: an unparsable file is an error, not quarantined.
    pub async fn load_read_only(&self) -> Result<StoreSnapshot, StoreError> {
        let Some(bytes) = self.read_bytes().await? else {
            return Ok(StoreSnapshot::default());
        };
        let (leads, dropped_records) =
            decode_leads(&bytes).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok(StoreSnapshot {
            leads,
            dropped_records,
            quarantined_to: None,
        })
    }
}

#[async_trait]
impl LeadStore for JsonFileStore {
    async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        let Some(bytes) = self.read_bytes().await? else {
            return Ok(StoreSnapshot::default());
        };

        match decode_leads(&bytes) {
            Ok((leads, dropped_records)) => Ok(StoreSnapshot {
                leads,
                dropped_records,
                quarantined_to: None,
            }),
            Err(err) => {
                let target = self.quarantine(&bytes).await?;
                warn!(
                    path = %self.path.display(),
                    quarantined_to = %target.display(),
                    error = %err,
                    "lead store is unparsable; starting from an empty store"
                );
                Ok(StoreSnapshot {
                    leads: Vec::new(),
                    dropped_records: 0,
                    quarantined_to: Some(target),
                })
            }
        }
    }

    async fn save(&self, leads: &[Lead]) -> Result<(), StoreError> {
        let bytes = encode_leads(leads)?;
        self.write_atomically(&bytes)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

#[derive(Debug, Default)]
pub struct MemoryLeadStore {
    leads: Mutex<Vec<Lead>>,
}

impl MemoryLeadStore {
    pub fn new(leads: Vec<Lead>) -> Self {
        Self {
            leads: Mutex::new(leads),
        }
    }

    pub async fn leads(&self) -> Vec<Lead> {
        self.leads.lock().await.clone()
    }
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        Ok(StoreSnapshot {
            leads: self.leads.lock().await.clone(),
            ..StoreSnapshot::default()
        })
    }

    async fn save(&self, leads: &[Lead]) -> Result<(), StoreError> {
        *self.leads.lock().await = leads.to_vec();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http fetcher is shut down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// POST a JSON body, retrying transient failures with capped exponential backoff.
    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &JsonValue,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        self.post_with_retries(url, headers, body)
            .instrument(info_span!("http_post", url))
            .await
    }

    async fn post_with_retries(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &JsonValue,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.post(url).json(body);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            let retryable = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    format!("http status {status}")
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                    err.to_string()
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt, reason = %retryable, delay_ms = delay.as_millis() as u64, "retrying request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlh_core::LeadStatus;
    use tempfile::tempdir;

    fn lead(url: &str) -> Lead {
        Lead {
            title: "Operations Analyst at Acme Corp".to_string(),
            url: url.to_string(),
            company: "Acme Corp".to_string(),
            status: LeadStatus::New,
            posted_at: "Just now".to_string(),
            found_at: "2024-05-01 23:00".to_string(),
        }
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty_store() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("jobs.json"));
        let snapshot = store.load().await.expect("load");
        assert_eq!(snapshot, StoreSnapshot::default());
    }

    #[tokio::test]
    async fn save_writes_four_space_json_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("jobs.json");
        let store = JsonFileStore::new(&path);
        let leads = vec![lead("https://example.com/job/1"), lead("https://example.com/job/2")];

        store.save(&leads).await.expect("save");
        store.save(&leads[..1]).await.expect("overwrite");

        let text = std::fs::read_to_string(&path).expect("read back");
        assert!(text.starts_with("[\n    {\n        \"title\": \"Operations Analyst at Acme Corp\","));
        assert!(text.contains("\"status\": \"New\""));

        let entries = std::fs::read_dir(path.parent().expect("parent"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(entries, vec!["jobs.json".to_string()]);

        let snapshot = store.load().await.expect("load");
        assert_eq!(snapshot.leads, leads[..1].to_vec());
    }

    #[tokio::test]
    async fn corrupt_file_is_quarantined_and_treated_as_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, b"[{\"title\": \"half-written").expect("seed");
        let store = JsonFileStore::new(&path);

        let snapshot = store.load().await.expect("load");

        assert!(snapshot.leads.is_empty());
        let quarantined = snapshot.quarantined_to.expect("quarantine path");
        assert!(quarantined
            .file_name()
            .expect("file name")
            .to_string_lossy()
            .starts_with("jobs.json.corrupt-"));
        assert_eq!(
            std::fs::read(&quarantined).expect("quarantine copy"),
            b"[{\"title\": \"half-written".to_vec()
        );

        let again = store.load().await.expect("second load");
        assert_eq!(again.quarantined_to, Some(quarantined));
    }

    #[tokio::test]
    async fn read_only_load_reports_corruption_without_writing() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, b"{not json").expect("seed");
        let store = JsonFileStore::new(&path);

        let err = store.load_read_only().await.expect_err("corrupt store");

        assert!(matches!(err, StoreError::Corrupt { .. }));
        let entries = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .count();
        assert_eq!(entries, 1);

        let missing = JsonFileStore::new(dir.path().join("absent.json"));
        assert_eq!(
            missing.load_read_only().await.expect("missing store"),
            StoreSnapshot::default()
        );
    }

    #[tokio::test]
    async fn malformed_elements_are_dropped_individually() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("jobs.json");
        let good = serde_json::to_value(lead("https://example.com/job/1")).expect("value");
        let body = serde_json::json!([good, {"url": 5}, {"title": "no url"}]);
        std::fs::write(&path, serde_json::to_vec(&body).expect("bytes")).expect("seed");

        let snapshot = JsonFileStore::new(&path).load().await.expect("load");

        assert_eq!(snapshot.leads, vec![lead("https://example.com/job/1")]);
        assert_eq!(snapshot.dropped_records, 2);
        assert!(snapshot.quarantined_to.is_none());
    }

    #[tokio::test]
    async fn blank_file_is_an_empty_store() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, b"  \n").expect("seed");

        let snapshot = JsonFileStore::new(&path).load().await.expect("load");

        assert_eq!(snapshot, StoreSnapshot::default());
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryLeadStore::default();
        store.save(&[lead("https://example.com/job/9")]).await.expect("save");
        assert_eq!(store.load().await.expect("load").leads.len(), 1);
        assert_eq!(store.leads().await[0].url, "https://example.com/job/9");
    }

    #[test]
    fn store_hashing_is_stable() {
        let hash = JsonFileStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn status_classification_retries_server_side_failures() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
