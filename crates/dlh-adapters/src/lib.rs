//! Search provider adapter contracts + the Serper implementation.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dlh_core::RawLead;
use dlh_storage::{FetchError, HttpFetcher};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "dlh-adapters";

pub const SERPER_ENDPOINT: &str = "https://google.serper.dev/search";
pub const DEFAULT_RESULTS_PER_QUERY: u32 = 10;
/// Serper `tbs` value restricting results to the past day.
pub const DEFAULT_TIME_WINDOW: &str = "qdr:d";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub num: u32,
    pub time_window: String,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            num: DEFAULT_RESULTS_PER_QUERY,
            time_window: DEFAULT_TIME_WINDOW.to_string(),
        }
    }
}

/// Search API credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding search response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait SearchAdapter: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawLead>, AdapterError>;
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    organic: Vec<JsonValue>,
}

/// Convert hits one at a time; a hit that is not a raw lead is logged and skipped.
fn decode_raw_leads(values: Vec<JsonValue>) -> Vec<RawLead> {
    values
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value::<RawLead>(value) {
            Ok(lead) => Some(lead),
            Err(err) => {
                warn!(index, error = %err, "skipping malformed search hit");
                None
            }
        })
        .collect()
}

/// Raw leads from a Serper response body; a missing `organic` array means no hits.
pub fn parse_search_response(bytes: &[u8]) -> Result<Vec<RawLead>, serde_json::Error> {
    let response: SearchResponse = serde_json::from_slice(bytes)?;
    Ok(decode_raw_leads(response.organic))
}

#[derive(Debug)]
pub struct SerperAdapter {
    http: Arc<HttpFetcher>,
    endpoint: String,
    api_key: ApiKey,
}

impl SerperAdapter {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>, api_key: ApiKey) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            api_key,
        }
    }

    pub fn request_body(query: &SearchQuery) -> JsonValue {
        let mut body = serde_json::json!({
            "q": query.text,
            "num": query.num,
        });
        if !query.time_window.is_empty() {
            body["tbs"] = JsonValue::String(query.time_window.clone());
        }
        body
    }
}

#[async_trait]
impl SearchAdapter for SerperAdapter {
    fn provider_id(&self) -> &'static str {
        "serper"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawLead>, AdapterError> {
        let response = self
            .http
            .post_json(
                &self.endpoint,
                &[("X-API-KEY", self.api_key.expose())],
                &Self::request_body(query),
            )
            .await?;
        debug!(
            status = %response.status,
            final_url = %response.final_url,
            bytes = response.body.len(),
            "search response received"
        );
        Ok(parse_search_response(&response.body)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedLeads {
    /// Hits of every successful query, in query order.
    pub leads: Vec<RawLead>,
    pub succeeded: usize,
    pub failed_queries: Vec<String>,
}

/// Run every query concurrently. A failed query is logged and contributes nothing.
pub async fn collect_leads(adapter: &dyn SearchAdapter, queries: &[SearchQuery]) -> CollectedLeads {
    let results = join_all(queries.iter().map(|query| adapter.search(query))).await;

    let mut collected = CollectedLeads::default();
    for (query, result) in queries.iter().zip(results) {
        match result {
            Ok(leads) => {
                info!(
                    provider = adapter.provider_id(),
                    query = %query.text,
                    hits = leads.len(),
                    "search query complete"
                );
                collected.succeeded += 1;
                collected.leads.extend(leads);
            }
            Err(err) => {
                warn!(
                    provider = adapter.provider_id(),
                    query = %query.text,
                    error = %err,
                    "search query failed; continuing with remaining queries"
                );
                collected.failed_queries.push(query.text.clone());
            }
        }
    }
    collected
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLeadsFile {
    Leads(Vec<JsonValue>),
    Response(SearchResponse),
}

/// Read saved raw leads: either a bare array or a full search response.
pub fn load_raw_leads_file(path: impl AsRef<Path>) -> Result<Vec<RawLead>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: RawLeadsFile =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(decode_raw_leads(match parsed {
        RawLeadsFile::Leads(values) => values,
        RawLeadsFile::Response(response) => response.organic,
    }))
}
