//! Run orchestration for DLH: config, query profiles, fetch → advance → save.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use dlh_adapters::{
    collect_leads, load_raw_leads_file, ApiKey, SearchAdapter, SearchQuery, SerperAdapter,
    DEFAULT_RESULTS_PER_QUERY, DEFAULT_TIME_WINDOW, SERPER_ENDPOINT,
};
use dlh_core::{
    advance, Advance, AdvanceReport, ClockZone, CompanyExtractor, CompanyRule, LeadPolicy, RawLead,
    DEFAULT_CAPACITY, DEFAULT_COMPANY, DEFAULT_LOCK_HOUR, DEFAULT_RETENTION_HOURS, DEFAULT_TITLE,
};
use dlh_storage::{HttpClientConfig, HttpFetcher, JsonFileStore, LeadStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dlh-sync";

pub const API_KEY_VAR: &str = "SERPER_API_KEY";
pub const BUILTIN_PROFILE: &str = "operations";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SERPER_API_KEY environment variable not found")]
    MissingCredential,
    #[error("invalid value `{value}` for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("profile `{name}` not found in {}", .path.display())]
    UnknownProfile { name: String, path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_key: Option<ApiKey>,
    pub store_path: PathBuf,
    pub profiles_path: PathBuf,
    pub profile: String,
    pub clock: ClockZone,
    pub lock_hour: u32,
    pub retention_hours: i64,
    pub capacity: Option<usize>,
    pub search_endpoint: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            store_path: PathBuf::from("jobs.json"),
            profiles_path: PathBuf::from("profiles.yaml"),
            profile: BUILTIN_PROFILE.to_string(),
            clock: ClockZone::Utc,
            lock_hour: DEFAULT_LOCK_HOUR,
            retention_hours: DEFAULT_RETENTION_HOURS,
            capacity: None,
            search_endpoint: SERPER_ENDPOINT.to_string(),
            user_agent: "dlh-bot/0.1".to_string(),
            http_timeout_secs: 20,
            http_concurrency: 4,
        }
    }
}

fn parse_var<T>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: err.to_string(),
        }),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let lock_hour = parse_var("DLH_LOCK_HOUR", lookup("DLH_LOCK_HOUR"), defaults.lock_hour)?;
        if lock_hour > 23 {
            return Err(ConfigError::Invalid {
                var: "DLH_LOCK_HOUR",
                value: lock_hour.to_string(),
                reason: "hour must be between 0 and 23".to_string(),
            });
        }
        let retention_hours = parse_var(
            "DLH_RETENTION_HOURS",
            lookup("DLH_RETENTION_HOURS"),
            defaults.retention_hours,
        )?;
        if retention_hours <= 0 {
            return Err(ConfigError::Invalid {
                var: "DLH_RETENTION_HOURS",
                value: retention_hours.to_string(),
                reason: "retention must be positive".to_string(),
            });
        }
        if Duration::try_hours(retention_hours).is_none() {
            return Err(ConfigError::Invalid {
                var: "DLH_RETENTION_HOURS",
                value: retention_hours.to_string(),
                reason: "retention is too large to represent".to_string(),
            });
        }
        let capacity = lookup("DLH_CAPACITY")
            .map(|v| parse_var("DLH_CAPACITY", Some(v), 0usize))
            .transpose()?;
        if capacity == Some(0) {
            return Err(ConfigError::Invalid {
                var: "DLH_CAPACITY",
                value: "0".to_string(),
                reason: "capacity must be at least 1".to_string(),
            });
        }

        Ok(Self {
            api_key: lookup(API_KEY_VAR)
                .filter(|v| !v.trim().is_empty())
                .map(ApiKey::new),
            store_path: lookup("DLH_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            profiles_path: lookup("DLH_PROFILES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.profiles_path),
            profile: lookup("DLH_PROFILE").unwrap_or(defaults.profile),
            clock: parse_var("DLH_CLOCK", lookup("DLH_CLOCK"), defaults.clock)?,
            lock_hour,
            retention_hours,
            capacity,
            search_endpoint: lookup("DLH_SEARCH_ENDPOINT").unwrap_or(defaults.search_endpoint),
            user_agent: lookup("DLH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: parse_var(
                "DLH_HTTP_TIMEOUT_SECS",
                lookup("DLH_HTTP_TIMEOUT_SECS"),
                defaults.http_timeout_secs,
            )?,
            http_concurrency: parse_var(
                "DLH_HTTP_CONCURRENCY",
                lookup("DLH_HTTP_CONCURRENCY"),
                defaults.http_concurrency,
            )?,
        })
    }

    pub fn require_api_key(&self) -> Result<&ApiKey, ConfigError> {
        self.api_key.as_ref().ok_or(ConfigError::MissingCredential)
    }
}

fn default_results_per_query() -> u32 {
    DEFAULT_RESULTS_PER_QUERY
}

fn default_time_window() -> String {
    DEFAULT_TIME_WINDOW.to_string()
}

fn default_title() -> String {
    DEFAULT_TITLE.to_string()
}

fn default_company() -> String {
    DEFAULT_COMPANY.to_string()
}

fn default_company_rules() -> Vec<CompanyRule> {
    CompanyExtractor::default().rules
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

/// Everything that differs between deployments of the hunter: what to search
/// for and how to read company names out of the hits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryProfile {
    pub name: String,
    pub queries: Vec<String>,
    #[serde(default = "default_results_per_query")]
    pub results_per_query: u32,
    #[serde(default = "default_time_window")]
    pub time_window: String,
    #[serde(default = "default_title")]
    pub default_title: String,
    #[serde(default = "default_company")]
    pub default_company: String,
    #[serde(default = "default_company_rules")]
    pub company_rules: Vec<CompanyRule>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl QueryProfile {
    pub fn operations() -> Self {
        Self {
            name: BUILTIN_PROFILE.to_string(),
            queries: [
                "Operations Analyst",
                "Business Operations Analyst",
                "Supply Chain Analyst",
                "Financial Operations Analyst",
                "Sales Operations Analyst",
            ]
            .iter()
            .map(|role| format!("intitle:\"{role}\" \"United States\" job"))
            .collect(),
            results_per_query: default_results_per_query(),
            time_window: default_time_window(),
            default_title: default_title(),
            default_company: default_company(),
            company_rules: default_company_rules(),
            capacity: default_capacity(),
        }
    }

    pub fn search_queries(&self) -> Vec<SearchQuery> {
        self.queries
            .iter()
            .map(|text| SearchQuery {
                text: text.clone(),
                num: self.results_per_query,
                time_window: self.time_window.clone(),
            })
            .collect()
    }

    pub fn policy(&self, config: &SyncConfig) -> LeadPolicy {
        LeadPolicy {
            capacity: config.capacity.unwrap_or(self.capacity),
            retention: Duration::try_hours(config.retention_hours).unwrap_or(Duration::MAX),
            lock_hour: config.lock_hour,
            default_title: self.default_title.clone(),
            companies: CompanyExtractor {
                rules: self.company_rules.clone(),
                default_company: self.default_company.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileRegistry {
    pub profiles: Vec<QueryProfile>,
}

/// Select `name` from the registry file. Without a registry file only the
/// built-in profile is available.
pub async fn load_profile(path: &Path, name: &str) -> Result<QueryProfile> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        if name == BUILTIN_PROFILE {
            info!(path = %path.display(), "no profile registry; using built-in profile");
            return Ok(QueryProfile::operations());
        }
        return Err(ConfigError::UnknownProfile {
            name: name.to_string(),
            path: path.to_path_buf(),
        }
        .into());
    }

    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let registry: ProfileRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let profile = registry
        .profiles
        .into_iter()
        .find(|p| p.name == name)
        .ok_or_else(|| ConfigError::UnknownProfile {
            name: name.to_string(),
            path: path.to_path_buf(),
        })?;
    if profile.capacity == 0 {
        return Err(ConfigError::Invalid {
            var: "capacity",
            value: "0".to_string(),
            reason: format!("profile `{name}` must keep at least one lead"),
        }
        .into());
    }
    Ok(profile)
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub report: AdvanceReport,
    pub total: usize,
    pub dropped_records: usize,
    pub quarantined_to: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub queries: usize,
    pub failed_queries: usize,
    pub fetched: usize,
    pub ingest: IngestSummary,
}

pub struct SyncPipeline {
    profile: QueryProfile,
    policy: LeadPolicy,
    clock: ClockZone,
    store: Box<dyn LeadStore>,
}

impl SyncPipeline {
    pub fn new(config: &SyncConfig, profile: QueryProfile, store: Box<dyn LeadStore>) -> Self {
        Self {
            policy: profile.policy(config),
            profile,
            clock: config.clock,
            store,
        }
    }

    pub async fn run_once(&self, adapter: &dyn SearchAdapter) -> Result<SyncRunSummary> {
        self.run_at(adapter, self.clock.now()).await
    }

    pub async fn run_at(&self, adapter: &dyn SearchAdapter, now: NaiveDateTime) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let queries = self.profile.search_queries();
        info!(%run_id, profile = %self.profile.name, queries = queries.len(), "starting run");

        let collected = collect_leads(adapter, &queries).await;
        if !queries.is_empty() && collected.succeeded == 0 {
            warn!(%run_id, "every search query failed; store will only be aged");
        }

        let ingest = self.ingest_at(&collected.leads, now).await?;

        Ok(SyncRunSummary {
            run_id,
            profile: self.profile.name.clone(),
            started_at,
            finished_at: Utc::now(),
            queries: queries.len(),
            failed_queries: collected.failed_queries.len(),
            fetched: collected.leads.len(),
            ingest,
        })
    }

    /// Load the store, apply one lifecycle step, and save it back.
    pub async fn ingest_at(&self, raw: &[RawLead], now: NaiveDateTime) -> Result<IngestSummary> {
        let snapshot = self.store.load().await.context("loading lead store")?;
        let Advance { leads, report } = advance(&self.policy, snapshot.leads, raw, now);
        self.store
            .save(&leads)
            .await
            .context("saving lead store")?;

        info!(
            admitted = report.admitted,
            expired = report.expired,
            corrupt = report.corrupt,
            archived = report.archived,
            duplicates = report.duplicates,
            truncated = report.truncated,
            total = leads.len(),
            "lead store updated"
        );

        Ok(IngestSummary {
            report,
            total: leads.len(),
            dropped_records: snapshot.dropped_records,
            quarantined_to: snapshot
                .quarantined_to
                .map(|p| p.display().to_string()),
        })
    }
}

/// Fetch with the configured profile and update the store file.
///
/// The credential is checked before anything else, so a misconfigured run
/// never reaches the network or the store.
pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    let api_key = config.require_api_key()?.clone();
    let profile = load_profile(&config.profiles_path, &config.profile).await?;

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: StdDuration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        concurrency: config.http_concurrency,
        ..Default::default()
    })?;
    let adapter = SerperAdapter::new(Arc::new(http), config.search_endpoint.clone(), api_key);
    let store = JsonFileStore::new(config.store_path.clone());
    let pipeline = SyncPipeline::new(&config, profile, Box::new(store));
    pipeline.run_once(&adapter).await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync_once(SyncConfig::from_env()?).await
}

/// Advance the store with raw leads saved to a file; no network involved.
pub async fn ingest_file(config: SyncConfig, path: &Path) -> Result<IngestSummary> {
    let raw = load_raw_leads_file(path)?;
    let profile = load_profile(&config.profiles_path, &config.profile).await?;
    let store = JsonFileStore::new(config.store_path.clone());
    let pipeline = SyncPipeline::new(&config, profile, Box::new(store));
    pipeline.ingest_at(&raw, config.clock.now()).await
}
