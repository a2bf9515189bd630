//! Core domain model for RJIP: source descriptors, raw source items, canonical listings,
//! dedup keys, and run telemetry records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rjip-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Syndicated RSS feed, read in one shot.
    Feed,
    /// JSON API polled page by page.
    PagedApi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContractType {
    FullTime,
    PartTime,
    Contract,
    Freelance,
    Internship,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::FullTime => "full-time",
            ContractType::PartTime => "part-time",
            ContractType::Contract => "contract",
            ContractType::Freelance => "freelance",
            ContractType::Internship => "internship",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperienceLevel {
    Entry,
    Mid,
    Senior,
    Lead,
    Executive,
}

impl ExperienceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperienceLevel::Entry => "entry",
            ExperienceLevel::Mid => "mid",
            ExperienceLevel::Senior => "senior",
            ExperienceLevel::Lead => "lead",
            ExperienceLevel::Executive => "executive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteType {
    #[default]
    FullyRemote,
    Hybrid,
    OnSite,
    Flexible,
}

impl RemoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteType::FullyRemote => "fully-remote",
            RemoteType::Hybrid => "hybrid",
            RemoteType::OnSite => "on-site",
            RemoteType::Flexible => "flexible",
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, RemoteType::OnSite)
    }
}

/// Include/exclude regexes tested against an item's title and snippet.
#[derive(Debug, Clone, Default)]
pub struct ContentFilter {
    pub include: Vec<Regex>,
    pub exclude: Vec<Regex>,
}

impl ContentFilter {
    pub fn admits(&self, title: &str, snippet: &str) -> bool {
        let hit = |re: &Regex| re.is_match(title) || re.is_match(snippet);
        if !self.include.is_empty() && !self.include.iter().any(hit) {
            return false;
        }
        !self.exclude.iter().any(hit)
    }
}

/// Where each canonical field lives inside a JSON API record. Dotted paths walk nested objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiFieldMap {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub company_logo: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default)]
    pub categories: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub salary: Option<String>,
    #[serde(default)]
    pub salary_min: Option<String>,
    #[serde(default)]
    pub salary_max: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_page_param")]
    pub param: String,
    #[serde(default = "default_page_start")]
    pub start: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_page_start() -> u32 {
    1
}

fn default_max_pages() -> u32 {
    1
}

impl Pagination {
    /// Page URLs in fetch order. The endpoint's existing query string is preserved; the list
    /// stops at the last page number `u32` can hold.
    pub fn page_urls(&self, endpoint: &str) -> Vec<String> {
        let sep = if endpoint.contains('?') { '&' } else { '?' };
        (0..self.max_pages.max(1))
            .map_while(|i| self.start.checked_add(i))
            .map(|page| format!("{endpoint}{sep}{}={page}", self.param))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMapping {
    /// Key holding the record array; `$` means the payload root is the array.
    #[serde(default = "default_list_path")]
    pub list_path: String,
    /// Records carrying this key are feed metadata, not listings (RemoteOK's legal notice).
    #[serde(default)]
    pub skip_meta_key: Option<String>,
    #[serde(default)]
    pub fields: ApiFieldMap,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

fn default_list_path() -> String {
    "jobs".to_string()
}

/// Immutable description of one external source, loaded once per process.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub kind: SourceKind,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub active: bool,
    pub inactive_reason: Option<String>,
    pub max_items_per_source: usize,
    pub default_remote_type: RemoteType,
    pub filters: ContentFilter,
    pub api: Option<ApiMapping>,
}

impl SourceDescriptor {
    pub fn fetch_targets(&self) -> Vec<String> {
        match self.api.as_ref().and_then(|api| api.pagination.as_ref()) {
            Some(pagination) if self.kind == SourceKind::PagedApi => {
                pagination.page_urls(&self.endpoint)
            }
            _ => vec![self.endpoint.clone()],
        }
    }
}

/// One `<item>` of a syndicated feed, as published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub guid: Option<String>,
    pub creator: Option<String>,
    pub published: Option<String>,
    pub categories: Vec<String>,
    pub snippet: Option<String>,
    /// `content:encoded`, when the feed publishes a full body next to the summary.
    pub content: Option<String>,
    pub feed_title: Option<String>,
    pub feed_link: Option<String>,
}

/// One record of a JSON API page after field mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiItem {
    pub id: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub company: Option<String>,
    pub company_logo: Option<String>,
    pub location: Option<String>,
    pub published: Option<String>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub snippet: Option<String>,
    pub salary_text: Option<String>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub currency: Option<String>,
}

/// Source-shaped record produced by the fetch stage and consumed by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawSourceItem {
    Feed(FeedItem),
    Api(ApiItem),
}

impl RawSourceItem {
    pub fn title(&self) -> Option<&str> {
        match self {
            RawSourceItem::Feed(item) => item.title.as_deref(),
            RawSourceItem::Api(item) => item.title.as_deref(),
        }
    }

    pub fn link(&self) -> Option<&str> {
        match self {
            RawSourceItem::Feed(item) => item.link.as_deref(),
            RawSourceItem::Api(item) => item.link.as_deref(),
        }
    }
}

/// Normalized, persistable job listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalListing {
    pub source_id: String,
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub company_logo: Option<String>,
    pub location: Option<String>,
    pub contract_type: ContractType,
    pub category: Option<String>,
    pub description: Option<String>,
    pub requirements: Option<Vec<String>>,
    pub benefits: Option<Vec<String>>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub currency: Option<String>,
    pub salary_min_eur: Option<f64>,
    pub salary_max_eur: Option<f64>,
    pub is_remote: bool,
    pub remote_type: RemoteType,
    pub experience_level: Option<ExperienceLevel>,
    /// `None` when the source date could not be parsed; such listings never pass the
    /// freshness filter.
    pub posted_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub url: String,
    pub source_url: String,
    pub featured: bool,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, JsonValue>,
}

impl CanonicalListing {
    pub fn local_key(&self) -> DedupKey {
        DedupKey::Local(format!("{}:{}", self.source_id, self.external_id))
    }

    pub fn global_key(&self) -> DedupKey {
        if let Some(url) = normalize_url(&self.url) {
            return DedupKey::Url(url);
        }
        let level = self.experience_level.map(|l| l.as_str()).unwrap_or("");
        DedupKey::Content(
            format!(
                "{}|{}|{}|{}",
                self.title,
                self.company,
                level,
                self.remote_type.as_str()
            )
            .to_lowercase(),
        )
    }
}

/// Identity used by the two dedup phases. URL and content keys never collide with each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DedupKey {
    Local(String),
    Url(String),
    Content(String),
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupKey::Local(k) => write!(f, "local:{k}"),
            DedupKey::Url(k) => write!(f, "url:{k}"),
            DedupKey::Content(k) => write!(f, "content:{k}"),
        }
    }
}

/// Lowercase, drop the fragment, drop trailing slashes. `None` when the value is not an
/// http(s) URL.
pub fn normalize_url(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let without_fragment = match lowered.split_once('#') {
        Some((head, _)) => head,
        None => lowered.as_str(),
    };
    let trimmed = without_fragment.trim_end_matches('/');
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))?;
    if rest.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Ok,
    Error,
}

/// Telemetry row for one logical task. Finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub items_inserted: u64,
    pub mean_latency_ms: u64,
    pub notes: Option<String>,
}

impl RunRecord {
    pub fn started(task_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            started_at,
            ended_at: None,
            status: RunStatus::Running,
            items_inserted: 0,
            mean_latency_ms: 0,
            notes: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Lightweight per-source health row, keyed by `source_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source_id: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SourceHealth {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            success_count: 0,
            failure_count: 0,
            last_success_at: None,
            last_error_at: None,
            last_error: None,
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.success_count += 1;
        self.last_success_at = Some(at);
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>, error: impl Into<String>) {
        self.failure_count += 1;
        self.last_error_at = Some(at);
        self.last_error = Some(error.into());
    }
}
