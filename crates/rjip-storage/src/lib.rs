//! HTTP fetch, REST table access, and idempotent persistence for RJIP.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, StatusCode};
use rjip_core::{
    CanonicalListing, ContractType, ExperienceLevel, RemoteType, SourceHealth,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rjip-storage";

pub const LISTINGS_TABLE: &str = "job_portal_listings";
pub const LISTINGS_CONFLICT: &[&str] = &["source_id", "external_id"];
pub const HEALTH_TABLE: &str = "source_health";
pub const HEALTH_CONFLICT: &[&str] = &["source_id"];
pub const RUNS_TABLE: &str = "scrape_runs";
pub const UPSERT_CHUNK_SIZE: usize = 500;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffCurve {
    /// `base * attempt_number`
    Linear,
    /// `base * 2^attempt_index`
    Exponential,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub curve: BackoffCurve,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(250), Duration::from_secs(5))
    }
}

impl BackoffPolicy {
    pub fn linear(max_retries: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            curve: BackoffCurve::Linear,
        }
    }

    pub fn exponential(max_retries: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            curve: BackoffCurve::Exponential,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Delay slept after the attempt at `attempt_index` (zero-based) fails.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let delay = match self.curve {
            BackoffCurve::Linear => {
                let factor = u32::try_from(attempt_index + 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffCurve::Exponential => {
                let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, returns a non-retryable error, exhausts `policy.max_retries`,
/// or `cancel` fires. `op` receives the zero-based attempt index.
pub async fn retry_async<T, E, F, Fut, R>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err)
                if attempt < policy.max_retries && is_retryable(&err) && !cancel.is_cancelled() =>
            {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure; retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
                if cancel.is_cancelled() {
                    return Err(err);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {timeout_ms}ms fetching {url}")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("fetch cancelled for {url}")]
    Cancelled { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } => true,
            FetchError::Cancelled { .. } => false,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::linear(3, Duration::from_millis(500), Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: String,
    pub elapsed: Duration,
}

/// One bounded, cancellable read of a source target.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_text(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    async fn fetch_once(
        &self,
        url: &str,
        attempt: usize,
        cancel: &CancellationToken,
    ) -> Result<FetchedResponse, FetchError> {
        let started = Instant::now();
        let request = async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.text().await?;
            Ok::<_, FetchError>(FetchedResponse {
                status: status.as_u16(),
                final_url,
                body,
                elapsed: Duration::ZERO,
            })
        };

        // Dropping `request` on timeout or cancellation aborts the in-flight connection.
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled { url: url.to_string() }),
            outcome = tokio::time::timeout(self.timeout, request) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    let timeout_ms = self.timeout.as_millis() as u64;
                    warn!(attempt = attempt + 1, timeout_ms, "fetch timed out");
                    Err(FetchError::Timeout { url: url.to_string(), timeout_ms })
                }
            },
        };

        result.map(|mut resp| {
            resp.elapsed = started.elapsed();
            resp
        })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch_text(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled { url: url.to_string() }),
                permit = self.global_limit.acquire() => permit
                    .map_err(|_| FetchError::Cancelled { url: url.to_string() })?,
            };

            retry_async(&self.backoff, cancel, FetchError::is_transient, |attempt| {
                self.fetch_once(url, attempt, cancel)
            })
            .await
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    SchemaCacheStale,
    Rejected,
    Transport,
    Decode,
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The REST gateway has not yet observed the table or column being written.
    #[error("schema cache for `{table}` is stale ({code})")]
    SchemaCacheStale { table: String, code: String },
    #[error("`{table}` rejected the request with status {status} ({code:?}): {message}")]
    Rejected {
        table: String,
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("transport failure on `{table}`: {message}")]
    Transport { table: String, message: String },
    #[error("could not decode `{table}` payload: {message}")]
    Decode { table: String, message: String },
}

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            StoreError::SchemaCacheStale { .. } => StoreErrorKind::SchemaCacheStale,
            StoreError::Rejected { .. } => StoreErrorKind::Rejected,
            StoreError::Transport { .. } => StoreErrorKind::Transport,
            StoreError::Decode { .. } => StoreErrorKind::Decode,
        }
    }

    fn decode(table: &str, err: impl fmt::Display) -> Self {
        StoreError::Decode {
            table: table.to_string(),
            message: err.to_string(),
        }
    }

    fn transport(table: &str, err: impl fmt::Display) -> Self {
        StoreError::Transport {
            table: table.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GatewayErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

const SCHEMA_CACHE_CODES: &[&str] = &["PGRST202", "PGRST204", "PGRST205", "42P01"];

/// Maps a non-2xx gateway response to a typed error using its structured error body.
pub fn classify_gateway_error(table: &str, status: u16, body: &str) -> StoreError {
    let parsed: Option<GatewayErrorBody> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().and_then(|b| b.code.clone());

    match code.as_deref() {
        Some(code) if SCHEMA_CACHE_CODES.contains(&code) => StoreError::SchemaCacheStale {
            table: table.to_string(),
            code: code.to_string(),
        },
        None if status == 404 => StoreError::SchemaCacheStale {
            table: table.to_string(),
            code: "404".to_string(),
        },
        _ => {
            let message = parsed
                .map(|b| {
                    let mut parts = vec![b.message.unwrap_or_default()];
                    parts.extend(b.details);
                    parts.extend(b.hint);
                    parts.retain(|p| !p.is_empty());
                    parts.join("; ")
                })
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| body.trim().to_string());
            StoreError::Rejected {
                table: table.to_string(),
                status,
                code,
                message,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, String),
    Lt(String, String),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<String>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn lt(column: &str, value: impl Into<String>) -> Self {
        Filter::Lt(column.to_string(), value.into())
    }

    fn query_pair(&self) -> (String, String) {
        match self {
            Filter::Eq(column, value) => (column.clone(), format!("eq.{value}")),
            Filter::Lt(column, value) => (column.clone(), format!("lt.{value}")),
        }
    }

    fn matches(&self, row: &JsonValue) -> bool {
        let (column, expected) = match self {
            Filter::Eq(c, v) | Filter::Lt(c, v) => (c, v),
        };
        let Some(actual) = row.get(column).map(json_text) else {
            return false;
        };
        match self {
            Filter::Eq(..) => actual == *expected,
            Filter::Lt(..) => match (
                DateTime::parse_from_rfc3339(&actual),
                DateTime::parse_from_rfc3339(expected),
            ) {
                (Ok(a), Ok(b)) => a < b,
                _ => actual.as_str() < expected.as_str(),
            },
        }
    }
}

fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Row-level access to the backing store's REST gateway.
#[async_trait]
pub trait TableClient: Send + Sync {
    /// Cheap read that warms the gateway's schema cache for `table`.
    async fn probe(&self, table: &str) -> Result<(), StoreError>;
    async fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<JsonValue>, StoreError>;
    async fn insert(&self, table: &str, row: &JsonValue) -> Result<(), StoreError>;
    async fn upsert(
        &self,
        table: &str,
        on_conflict: &[&str],
        rows: &[JsonValue],
    ) -> Result<usize, StoreError>;
    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &JsonValue,
    ) -> Result<(), StoreError>;
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    pub base_url: String,
    pub service_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PostgrestClient {
    client: reqwest::Client,
    rest_url: String,
    service_key: String,
}

impl PostgrestClient {
    pub fn new(config: PostgrestConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building PostgREST client")?;
        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", config.base_url.trim_end_matches('/')),
            service_key: config.service_key,
        })
    }

    pub fn rest_url(&self) -> &str {
        &self.rest_url
    }

    fn request(&self, method: Method, table: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url, table))
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn send(
        &self,
        table: &str,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let resp = builder
            .send()
            .await
            .map_err(|err| StoreError::transport(table, err))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_gateway_error(table, status.as_u16(), &body))
    }

    async fn read_rows(table: &str, resp: reqwest::Response) -> Result<Vec<JsonValue>, StoreError> {
        let text = resp
            .text()
            .await
            .map_err(|err| StoreError::transport(table, err))?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|err| StoreError::decode(table, err))
    }
}

fn filter_query(filters: &[Filter]) -> Vec<(String, String)> {
    filters.iter().map(Filter::query_pair).collect()
}

#[async_trait]
impl TableClient for PostgrestClient {
    async fn probe(&self, table: &str) -> Result<(), StoreError> {
        let builder = self
            .request(Method::GET, table)
            .query(&[("select", "*"), ("limit", "1")]);
        self.send(table, builder).await.map(|_| ())
    }

    async fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<JsonValue>, StoreError> {
        let builder = self
            .request(Method::GET, table)
            .query(&[("select", "*")])
            .query(&filter_query(filters));
        let resp = self.send(table, builder).await?;
        Self::read_rows(table, resp).await
    }

    async fn insert(&self, table: &str, row: &JsonValue) -> Result<(), StoreError> {
        let builder = self
            .request(Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(row);
        self.send(table, builder).await.map(|_| ())
    }

    async fn upsert(
        &self,
        table: &str,
        on_conflict: &[&str],
        rows: &[JsonValue],
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let builder = self
            .request(Method::POST, table)
            .query(&[("on_conflict", on_conflict.join(","))])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        self.send(table, builder).await.map(|_| rows.len())
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &JsonValue,
    ) -> Result<(), StoreError> {
        let builder = self
            .request(Method::PATCH, table)
            .query(&filter_query(filters))
            .header("Prefer", "return=minimal")
            .json(patch);
        self.send(table, builder).await.map(|_| ())
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        let builder = self
            .request(Method::DELETE, table)
            .query(&filter_query(filters))
            .header("Prefer", "return=representation");
        let resp = self.send(table, builder).await?;
        Ok(Self::read_rows(table, resp).await?.len() as u64)
    }
}

/// In-process table store with the gateway's natural-key upsert semantics. Failures can be
/// queued per table to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryTables {
    tables: Mutex<HashMap<String, Vec<JsonValue>>>,
    injected: Mutex<HashMap<String, VecDeque<StoreError>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `errors.len()` operations on `table` fail with these errors, in order.
    pub async fn fail_next(&self, table: &str, errors: impl IntoIterator<Item = StoreError>) {
        self.injected
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(errors);
    }

    pub async fn rows(&self, table: &str) -> Vec<JsonValue> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn calls(&self, table: &str) -> usize {
        self.calls.lock().await.get(table).copied().unwrap_or(0)
    }

    async fn enter(&self, table: &str) -> Result<(), StoreError> {
        *self.calls.lock().await.entry(table.to_string()).or_insert(0) += 1;
        match self
            .injected
            .lock()
            .await
            .get_mut(table)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn same_key(a: &JsonValue, b: &JsonValue, columns: &[&str]) -> bool {
    columns.iter().all(|c| a.get(*c) == b.get(*c))
}

fn merge_object(target: &mut JsonValue, patch: &JsonValue) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

#[async_trait]
impl TableClient for MemoryTables {
    async fn probe(&self, table: &str) -> Result<(), StoreError> {
        self.enter(table).await
    }

    async fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<JsonValue>, StoreError> {
        self.enter(table).await?;
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, row: &JsonValue) -> Result<(), StoreError> {
        self.enter(table).await?;
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        on_conflict: &[&str],
        rows: &[JsonValue],
    ) -> Result<usize, StoreError> {
        self.enter(table).await?;
        let mut tables = self.tables.lock().await;
        let stored = tables.entry(table.to_string()).or_default();
        for row in rows {
            match stored.iter_mut().find(|r| same_key(r, row, on_conflict)) {
                Some(existing) => merge_object(existing, row),
                None => stored.push(row.clone()),
            }
        }
        Ok(rows.len())
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &JsonValue,
    ) -> Result<(), StoreError> {
        self.enter(table).await?;
        let mut tables = self.tables.lock().await;
        if let Some(rows) = tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| filters.iter().all(|f| f.matches(r))) {
                merge_object(row, patch);
            }
        }
        Ok(())
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        self.enter(table).await?;
        let mut tables = self.tables.lock().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !filters.iter().all(|f| f.matches(r)));
        Ok((before - rows.len()) as u64)
    }
}

/// Persisted shape of a listing in `job_portal_listings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRow {
    pub source_id: String,
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub company_logo: Option<String>,
    pub location: Option<String>,
    #[serde(rename = "type")]
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
    pub posted_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub url: String,
    pub source_url: String,
    pub featured: bool,
    pub tags: Vec<String>,
    pub metadata: JsonValue,
}

impl ListingRow {
    /// `None` for listings without a valid `posted_at`; those are never persisted.
    pub fn from_listing(listing: &CanonicalListing) -> Option<Self> {
        Some(Self {
            source_id: listing.source_id.clone(),
            external_id: listing.external_id.clone(),
            title: listing.title.clone(),
            company: listing.company.clone(),
            company_logo: listing.company_logo.clone(),
            location: listing.location.clone(),
            contract_type: listing.contract_type,
            category: listing.category.clone(),
            description: listing.description.clone(),
            requirements: listing.requirements.clone(),
            benefits: listing.benefits.clone(),
            salary_min: listing.salary_min,
            salary_max: listing.salary_max,
            currency: listing.currency.clone(),
            salary_min_eur: listing.salary_min_eur,
            salary_max_eur: listing.salary_max_eur,
            is_remote: listing.is_remote,
            remote_type: listing.remote_type,
            experience_level: listing.experience_level,
            posted_at: listing.posted_at?,
            deadline: listing.deadline,
            url: listing.url.clone(),
            source_url: listing.source_url.clone(),
            featured: listing.featured,
            tags: listing.tags.clone(),
            metadata: serde_json::to_value(&listing.metadata).unwrap_or(JsonValue::Null),
        })
    }
}

/// Collapses a batch to one row per `(source_id, external_id)`. The last occurrence wins and
/// takes the slot of the first. Returns the rows and the number of undated listings skipped.
pub fn collapse_natural_key(listings: &[CanonicalListing]) -> (Vec<ListingRow>, usize) {
    let mut rows: Vec<ListingRow> = Vec::with_capacity(listings.len());
    let mut slots: HashMap<(String, String), usize> = HashMap::new();
    let mut skipped = 0usize;

    for listing in listings {
        let Some(row) = ListingRow::from_listing(listing) else {
            skipped += 1;
            continue;
        };
        let key = (row.source_id.clone(), row.external_id.clone());
        match slots.get(&key) {
            Some(&slot) => rows[slot] = row,
            None => {
                slots.insert(key, rows.len());
                rows.push(row);
            }
        }
    }

    (rows, skipped)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub submitted: usize,
    pub written: usize,
    pub collapsed: usize,
    pub skipped_undated: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Success,
    Failure(String),
}

#[derive(Serialize)]
struct HealthRow<'a> {
    #[serde(flatten)]
    health: &'a SourceHealth,
    updated_at: DateTime<Utc>,
}

/// Idempotent writes against the listing and health tables. Only schema-cache lag is retried.
#[derive(Clone)]
pub struct PersistenceGateway {
    client: Arc<dyn TableClient>,
    retry: BackoffPolicy,
    cancel: CancellationToken,
}

impl fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl PersistenceGateway {
    pub fn new(client: Arc<dyn TableClient>) -> Self {
        Self {
            client,
            retry: BackoffPolicy::linear(4, Duration::from_millis(500), Duration::from_secs(3)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cancelling `cancel` cuts schema-cache retries short; the pending error is returned.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn retrying<T, F, Fut>(&self, table: &str, op: F) -> Result<T, StoreError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        retry_async(
            &self.retry,
            &self.cancel,
            |err: &StoreError| err.kind() == StoreErrorKind::SchemaCacheStale,
            op,
        )
        .instrument(info_span!("store_write", table))
        .await
    }

    /// No-op read that pre-warms the gateway's schema cache before the first write.
    pub async fn prime(&self, table: &str) -> Result<(), StoreError> {
        self.retrying(table, |_| self.client.probe(table)).await
    }

    pub async fn upsert_listings(
        &self,
        listings: &[CanonicalListing],
    ) -> Result<UpsertReport, StoreError> {
        let (rows, skipped_undated) = collapse_natural_key(listings);
        let mut report = UpsertReport {
            submitted: listings.len(),
            collapsed: listings.len() - skipped_undated - rows.len(),
            skipped_undated,
            ..UpsertReport::default()
        };

        for chunk in rows.chunks(UPSERT_CHUNK_SIZE) {
            let payload = chunk
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| StoreError::decode(LISTINGS_TABLE, err))?;
            let written = self
                .retrying(LISTINGS_TABLE, |_| {
                    self.client.upsert(LISTINGS_TABLE, LISTINGS_CONFLICT, &payload)
                })
                .await?;
            report.written += written;
            report.chunks += 1;
            debug!(chunk = report.chunks, rows = written, "upserted listing chunk");
        }

        Ok(report)
    }

    /// Reads the current health row, applies `outcome`, and upserts it back keyed by source.
    pub async fn record_health(
        &self,
        source_id: &str,
        outcome: &HealthOutcome,
        at: DateTime<Utc>,
    ) -> Result<SourceHealth, StoreError> {
        let filters = [Filter::eq("source_id", source_id)];
        let existing = self
            .retrying(HEALTH_TABLE, |_| self.client.select(HEALTH_TABLE, &filters))
            .await?;

        let mut health = match existing.into_iter().next() {
            Some(row) => serde_json::from_value::<SourceHealth>(row)
                .map_err(|err| StoreError::decode(HEALTH_TABLE, err))?,
            None => SourceHealth::new(source_id),
        };
        match outcome {
            HealthOutcome::Success => health.record_success(at),
            HealthOutcome::Failure(reason) => health.record_failure(at, reason.clone()),
        }

        let row = serde_json::to_value(HealthRow {
            health: &health,
            updated_at: at,
        })
        .map_err(|err| StoreError::decode(HEALTH_TABLE, err))?;
        self.retrying(HEALTH_TABLE, |_| {
            self.client
                .upsert(HEALTH_TABLE, HEALTH_CONFLICT, std::slice::from_ref(&row))
        })
        .await?;

        Ok(health)
    }

    /// Deletes persisted listings posted before `cutoff`.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let filters = [Filter::lt(
            "posted_at",
            cutoff.to_rfc3339_opts(SecondsFormat::Secs, true),
        )];
        self.retrying(LISTINGS_TABLE, |_| self.client.delete(LISTINGS_TABLE, &filters))
            .await
    }
}
