//! Lead domain model and store lifecycle rules for DLH.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Duration, Local, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dlh-core";

/// Layout of `found_at`: minute precision, no zone marker.
pub const FOUND_AT_FORMAT: &str = "%Y-%m-%d %H:%M";
pub const DEFAULT_POSTED_AT: &str = "Just now";
pub const DEFAULT_TITLE: &str = "Operations Analyst";
pub const DEFAULT_COMPANY: &str = "US Company";
pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_RETENTION_HOURS: i64 = 72;
pub const DEFAULT_LOCK_HOUR: u32 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeadStatus {
    New,
    #[serde(rename = "Best_Archived")]
    BestArchived,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::BestArchived => "Best_Archived",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "New" | "new" => Ok(Self::New),
            "Best_Archived" | "best_archived" | "archived" => Ok(Self::BestArchived),
            other => Err(format!("unknown lead status `{other}`")),
        }
    }
}

/// Persisted lead record. `url` is the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub title: String,
    pub url: String,
    pub company: String,
    pub status: LeadStatus,
    pub posted_at: String,
    /// Kept as persisted text so one bad timestamp cannot fail a whole load.
    pub found_at: String,
}

impl Lead {
    pub fn found_at_time(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.found_at, FOUND_AT_FORMAT).ok()
    }
}

pub fn format_found_at(at: NaiveDateTime) -> String {
    at.format(FOUND_AT_FORMAT).to_string()
}

/// Search hit as handed over by the fetcher. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLead {
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

impl RawLead {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: Some(link.into()),
            ..Self::default()
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn dated(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }
}

/// One separator-driven company extraction step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRule {
    pub separator: String,
    #[serde(default)]
    pub cut_at: Option<String>,
}

impl CompanyRule {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            cut_at: None,
        }
    }

    pub fn cut_at(mut self, cut_at: impl Into<String>) -> Self {
        self.cut_at = Some(cut_at.into());
        self
    }

    /// Text after the last occurrence of `separator`, trimmed before `cut_at`.
    pub fn apply(&self, title: &str) -> Option<String> {
        if self.separator.is_empty() {
            return None;
        }
        let (_, tail) = title.rsplit_once(self.separator.as_str())?;
        let company = match self.cut_at.as_deref() {
            Some(cut) if !cut.is_empty() => tail.split_once(cut).map_or(tail, |(head, _)| head),
            _ => tail,
        };
        Some(company.to_string())
    }
}

/// Ordered company rules; the first rule whose separator occurs wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyExtractor {
    pub rules: Vec<CompanyRule>,
    pub default_company: String,
}

impl Default for CompanyExtractor {
    fn default() -> Self {
        Self {
            rules: vec![CompanyRule::new(" at ").cut_at(" - "), CompanyRule::new(" | ")],
            default_company: DEFAULT_COMPANY.to_string(),
        }
    }
}

impl CompanyExtractor {
    pub fn extract(&self, title: &str) -> String {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(title))
            .unwrap_or_else(|| self.default_company.clone())
    }
}

/// Clock convention for `now`, the lock hour and persisted `found_at` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockZone {
    #[default]
    Utc,
    Local,
}

impl ClockZone {
    pub fn now(&self) -> NaiveDateTime {
        match self {
            Self::Utc => Utc::now().naive_utc(),
            Self::Local => Local::now().naive_local(),
        }
    }
}

impl FromStr for ClockZone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utc" => Ok(Self::Utc),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown clock zone `{other}` (expected utc or local)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadPolicy {
    pub capacity: usize,
    pub retention: Duration,
    pub lock_hour: u32,
    pub default_title: String,
    pub companies: CompanyExtractor,
}

impl Default for LeadPolicy {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            retention: Duration::hours(DEFAULT_RETENTION_HOURS),
            lock_hour: DEFAULT_LOCK_HOUR,
            default_title: DEFAULT_TITLE.to_string(),
            companies: CompanyExtractor::default(),
        }
    }
}

/// Per-step counters of one `advance` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdvanceReport {
    pub expired: usize,
    pub corrupt: usize,
    /// Prior records sharing a url with a newer prior record.
    pub collapsed: usize,
    pub archived: usize,
    pub admitted: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub truncated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    pub leads: Vec<Lead>,
    pub report: AdvanceReport,
}

/// Produce the next store state from the prior one and a batch of raw leads.
///
/// Steps run in a fixed order: expiry, archival lock, admission, merge and cap.
/// The lock only touches records that existed before this call, so leads
/// admitted during the lock hour still start as `New`.
pub fn advance(policy: &LeadPolicy, prior: Vec<Lead>, raw: &[RawLead], now: NaiveDateTime) -> Advance {
    let mut report = AdvanceReport::default();
    // No cutoff when the window reaches past the earliest representable time.
    let cutoff = now.checked_sub_signed(policy.retention);

    let mut seen = HashSet::with_capacity(prior.len() + raw.len());
    let mut survivors = Vec::with_capacity(prior.len());
    for lead in prior {
        match lead.found_at_time() {
            None => report.corrupt += 1,
            Some(found_at) if cutoff.is_some_and(|cutoff| found_at <= cutoff) => {
                report.expired += 1
            }
            Some(_) => {
                if seen.insert(lead.url.clone()) {
                    survivors.push(lead);
                } else {
                    report.collapsed += 1;
                }
            }
        }
    }

    if now.hour() == policy.lock_hour {
        for lead in survivors.iter_mut().filter(|l| l.status == LeadStatus::New) {
            lead.status = LeadStatus::BestArchived;
            report.archived += 1;
        }
    }

    let found_at = format_found_at(now);
    let mut next = Vec::new();
    for candidate in raw {
        let Some(url) = candidate.link.as_deref().filter(|l| !l.trim().is_empty()) else {
            report.skipped += 1;
            continue;
        };
        if !seen.insert(url.to_string()) {
            report.duplicates += 1;
            continue;
        }
        let title = candidate
            .title
            .clone()
            .unwrap_or_else(|| policy.default_title.clone());
        next.push(Lead {
            company: policy.companies.extract(&title),
            title,
            url: url.to_string(),
            status: LeadStatus::New,
            posted_at: candidate
                .date
                .clone()
                .unwrap_or_else(|| DEFAULT_POSTED_AT.to_string()),
            found_at: found_at.clone(),
        });
    }
    report.admitted = next.len();

    next.extend(survivors);
    report.truncated = next.len().saturating_sub(policy.capacity);
    next.truncate(policy.capacity);

    Advance {
        leads: next,
        report,
    }
}
