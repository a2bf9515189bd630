use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rjip_core::{
    ApiMapping, ContentFilter, RemoteType, RunStatus, SourceDescriptor, SourceKind,
};
use rjip_storage::{
    BackoffPolicy, FetchError, FetchedResponse, Filter, MemoryTables, PersistenceGateway,
    SourceFetcher, StoreError, TableClient, HEALTH_TABLE, LISTINGS_TABLE,
};
use rjip_sync::fx::StaticRates;
use rjip_sync::telemetry::InMemoryTelemetry;
use rjip_sync::{Collaborators, ConfigError, SyncConfig, SyncPipeline};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const WWR_URL: &str = "https://weworkremotely.test/jobs.rss";
const REMOTIVE_URL: &str = "https://remotive.test/api/remote-jobs";
const DOWN_URL: &str = "https://down.test/feed.rss";
const RETIRED_URL: &str = "https://retired.test/feed.rss";

enum Route {
    Body(String),
    Status(u16),
}

#[derive(Default)]
struct FixtureFetcher {
    routes: HashMap<String, Route>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FixtureFetcher {
    fn with(mut self, url: &str, route: Route) -> Self {
        self.routes.insert(url.to_string(), route);
        self
    }

    fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl SourceFetcher for FixtureFetcher {
    async fn fetch_text(
        &self,
        _run_id: Uuid,
        _source_id: &str,
        url: &str,
        _cancel: &CancellationToken,
    ) -> Result<FetchedResponse, FetchError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_insert(0) += 1;
        match self.routes.get(url) {
            Some(Route::Body(body)) => Ok(FetchedResponse {
                status: 200,
                final_url: url.to_string(),
                body: body.clone(),
                elapsed: Duration::from_millis(3),
            }),
            Some(Route::Status(status)) => Err(FetchError::HttpStatus {
                status: *status,
                url: url.to_string(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

/// Table store whose first `stale_upserts` listing upserts report schema-cache lag. Probes and
/// every other operation go straight through.
struct LaggingUpserts {
    inner: Arc<MemoryTables>,
    stale_upserts: usize,
    upserts: AtomicUsize,
}

impl LaggingUpserts {
    fn new(inner: Arc<MemoryTables>, stale_upserts: usize) -> Self {
        Self {
            inner,
            stale_upserts,
            upserts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TableClient for LaggingUpserts {
    async fn probe(&self, table: &str) -> Result<(), StoreError> {
        self.inner.probe(table).await
    }

    async fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<JsonValue>, StoreError> {
        self.inner.select(table, filters).await
    }

    async fn insert(&self, table: &str, row: &JsonValue) -> Result<(), StoreError> {
        self.inner.insert(table, row).await
    }

    async fn upsert(
        &self,
        table: &str,
        on_conflict: &[&str],
        rows: &[JsonValue],
    ) -> Result<usize, StoreError> {
        if table == LISTINGS_TABLE
            && self.upserts.fetch_add(1, Ordering::SeqCst) < self.stale_upserts
        {
            return Err(StoreError::SchemaCacheStale {
                table: table.into(),
                code: "PGRST205".into(),
            });
        }
        self.inner.upsert(table, on_conflict, rows).await
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &JsonValue,
    ) -> Result<(), StoreError> {
        self.inner.update(table, filters, patch).await
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        self.inner.delete(table, filters).await
    }
}

fn days_ago(days: i64) -> String {
    (Utc::now() - ChronoDuration::days(days)).to_rfc2822()
}

fn wwr_feed() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>We Work Remotely</title>
    <link>https://weworkremotely.test</link>
    <item>
      <title>Acme: Rust Engineer</title>
      <link>https://x.com/job/42</link>
      <guid>wwr-42</guid>
      <pubDate>{fresh}</pubDate>
      <dc:creator>Recruiter at Acme</dc:creator>
      <category>Programming</category>
      <description>Senior backend role.</description>
    </item>
    <item>
      <title>Globex: Go Developer</title>
      <link>https://weworkremotely.test/jobs/go</link>
      <guid>wwr-43</guid>
      <pubDate>{fresh}</pubDate>
      <description>Contract, fully remote.</description>
    </item>
    <item>
      <title>Initech: Old Posting</title>
      <link>https://weworkremotely.test/jobs/old</link>
      <guid>wwr-44</guid>
      <pubDate>{stale}</pubDate>
    </item>
    <item>
      <title>Acme: Rust Engineer</title>
      <link>https://x.com/job/42</link>
      <guid>wwr-42</guid>
      <pubDate>{fresh}</pubDate>
    </item>
  </channel>
</rss>"#,
        fresh = days_ago(1),
        stale = days_ago(46),
    )
}

fn remotive_page() -> String {
    let jobs = serde_json::json!({
        "job-count": 3,
        "jobs": [
            {
                "id": 9001,
                "title": "Rust Engineer",
                "company_name": "Acme",
                "url": "https://X.com/job/42#ref=twitter",
                "publication_date": (Utc::now() - ChronoDuration::days(2)).to_rfc3339(),
                "category": "Software Development",
                "salary_min": 100000,
                "salary_max": 120000,
                "currency": "USD"
            },
            {
                "id": 9002,
                "title": "Data Engineer",
                "company_name": "Hooli",
                "url": "https://remotive.test/jobs/9002",
                "publication_date": (Utc::now() - ChronoDuration::hours(5)).to_rfc3339(),
                "category": "Data",
                "salary_min": 50000,
                "salary_max": 60000,
                "currency": "XYZ"
            },
            {
                "id": 9003,
                "title": "Platform Engineer",
                "company_name": "Umbrella",
                "url": "https://remotive.test/jobs/9003",
                "publication_date": "not a date"
            }
        ]
    });
    jobs.to_string()
}

fn feed_source(id: &str, endpoint: &str) -> SourceDescriptor {
    SourceDescriptor {
        id: id.into(),
        name: id.into(),
        endpoint: endpoint.into(),
        kind: SourceKind::Feed,
        category: Some("development".into()),
        tags: vec!["remote".into()],
        active: true,
        inactive_reason: None,
        max_items_per_source: 50,
        default_remote_type: RemoteType::FullyRemote,
        filters: ContentFilter::default(),
        api: None,
    }
}

fn remotive_source() -> SourceDescriptor {
    let api: ApiMapping = serde_json::from_value(serde_json::json!({
        "list_path": "jobs",
        "fields": {
            "company": "company_name",
            "published": "publication_date"
        }
    }))
    .unwrap();
    SourceDescriptor {
        kind: SourceKind::PagedApi,
        api: Some(api),
        ..feed_source("remotive", REMOTIVE_URL)
    }
}

fn retired_source() -> SourceDescriptor {
    SourceDescriptor {
        active: false,
        inactive_reason: Some("feed discontinued upstream".into()),
        ..feed_source("retired", RETIRED_URL)
    }
}

fn all_sources() -> Vec<SourceDescriptor> {
    vec![
        feed_source("weworkremotely", WWR_URL),
        remotive_source(),
        feed_source("down", DOWN_URL),
        retired_source(),
    ]
}

fn fixtures() -> Arc<FixtureFetcher> {
    Arc::new(
        FixtureFetcher::default()
            .with(WWR_URL, Route::Body(wwr_feed()))
            .with(REMOTIVE_URL, Route::Body(remotive_page()))
            .with(DOWN_URL, Route::Status(503))
            .with(RETIRED_URL, Route::Body(wwr_feed())),
    )
}

fn config(workspace: &Path, dry_run: bool) -> SyncConfig {
    let root = workspace.display().to_string();
    let dry = if dry_run { "1" } else { "0" };
    SyncConfig::from_lookup(move |key| match key {
        "RJIP_WORKSPACE_ROOT" => Some(root.clone()),
        "DRY_RUN" => Some(dry.to_string()),
        "RJIP_TASK_BASE_DELAY_MS" => Some("1".to_string()),
        "RJIP_MAX_AGE_DAYS" => Some("45".to_string()),
        _ => None,
    })
}

fn live_pipeline(
    workspace: &Path,
    http: Arc<FixtureFetcher>,
    tables: Arc<MemoryTables>,
) -> SyncPipeline {
    live_pipeline_over(workspace, http, tables)
}

fn live_pipeline_over(
    workspace: &Path,
    http: Arc<FixtureFetcher>,
    tables: Arc<dyn TableClient>,
) -> SyncPipeline {
    let gateway = PersistenceGateway::new(tables).with_retry(BackoffPolicy::linear(
        4,
        Duration::from_millis(1),
        Duration::from_millis(5),
    ));
    SyncPipeline::with_collaborators(
        config(workspace, false),
        all_sources(),
        Collaborators {
            fetcher: http,
            gateway: Some(gateway),
            rates: Arc::new(StaticRates::new(&[("USD", 0.9)])),
            telemetry: Arc::new(InMemoryTelemetry::new()),
        },
    )
    .expect("pipeline")
}

fn natural_keys(rows: &[JsonValue]) -> BTreeSet<(String, String)> {
    rows.iter()
        .map(|row| {
            (
                row["source_id"].as_str().unwrap().to_string(),
                row["external_id"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

fn row<'a>(rows: &'a [JsonValue], source_id: &str, external_id: &str) -> Option<&'a JsonValue> {
    rows.iter()
        .find(|r| r["source_id"] == source_id && r["external_id"] == external_id)
}

#[tokio::test]
async fn failing_source_is_isolated_and_others_persist() {
    let dir = tempfile::tempdir().unwrap();
    let http = fixtures();
    let tables = Arc::new(MemoryTables::new());
    let pipeline = live_pipeline(dir.path(), http.clone(), tables.clone());

    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.status, RunStatus::Error);
    let down = summary.sources.iter().find(|s| s.source_id == "down").unwrap();
    assert!(!down.ok);
    assert!(down.error.as_deref().unwrap().contains("503"));
    assert_eq!(down.attempts, 1);

    let rows = tables.rows(LISTINGS_TABLE).await;
    assert!(row(&rows, "weworkremotely", "wwr-43").is_some());
    assert!(row(&rows, "remotive", "9002").is_some());
    assert!(rows.iter().all(|r| r["source_id"] != "down"));

    let health = tables.rows(HEALTH_TABLE).await;
    let down_health = health.iter().find(|r| r["source_id"] == "down").unwrap();
    assert_eq!(down_health["failure_count"], 1);
    assert_eq!(down_health["success_count"], 0);
    let wwr_health = health
        .iter()
        .find(|r| r["source_id"] == "weworkremotely")
        .unwrap();
    assert_eq!(wwr_health["success_count"], 1);
}

#[tokio::test]
async fn cross_posted_url_survives_once_as_newest() {
    let dir = tempfile::tempdir().unwrap();
    let tables = Arc::new(MemoryTables::new());
    let pipeline = live_pipeline(dir.path(), fixtures(), tables.clone());

    let summary = pipeline.run_once().await.unwrap();

    let rows = tables.rows(LISTINGS_TABLE).await;
    assert!(row(&rows, "weworkremotely", "wwr-42").is_some());
    assert!(row(&rows, "remotive", "9001").is_none());
    assert_eq!(summary.totals.cross_source_removed, 1);

    let wwr = summary
        .sources
        .iter()
        .find(|s| s.source_id == "weworkremotely")
        .unwrap();
    assert_eq!(wwr.fetched, 4);
    assert_eq!(wwr.fresh, 3);
    assert_eq!(wwr.unique, 2, "duplicate guid collapses within the source");
    assert_eq!(wwr.stale_filtered, 1);
}

#[tokio::test]
async fn stale_and_undated_listings_are_never_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let tables = Arc::new(MemoryTables::new());
    let pipeline = live_pipeline(dir.path(), fixtures(), tables.clone());

    let summary = pipeline.run_once().await.unwrap();

    let rows = tables.rows(LISTINGS_TABLE).await;
    assert!(row(&rows, "weworkremotely", "wwr-44").is_none(), "46 days old");
    assert!(row(&rows, "remotive", "9003").is_none(), "unparsable date");
    assert_eq!(summary.totals.stale_filtered_total, 2);
    assert_eq!(summary.totals.total_fresh, 5);
    assert_eq!(summary.totals.total_after_source_dedupe, 4);
    assert_eq!(summary.totals.total_after_global_dedupe, 3);
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn inactive_source_is_never_fetched() {
    let dir = tempfile::tempdir().unwrap();
    let http = fixtures();
    let pipeline = live_pipeline(dir.path(), http.clone(), Arc::new(MemoryTables::new()));

    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(http.calls(RETIRED_URL), 0);
    assert_eq!(http.calls(WWR_URL), 1);
    assert!(summary.sources.iter().all(|s| s.source_id != "retired"));
    assert_eq!(summary.skipped_sources.len(), 1);
    assert_eq!(
        summary.skipped_sources[0].reason.as_deref(),
        Some("feed discontinued upstream")
    );
}

#[tokio::test]
async fn repeated_runs_converge_on_the_same_rows() {
    let dir = tempfile::tempdir().unwrap();
    let http = fixtures();
    let tables = Arc::new(MemoryTables::new());
    let pipeline = live_pipeline(dir.path(), http, tables.clone());

    pipeline.run_once().await.unwrap();
    let first = tables.rows(LISTINGS_TABLE).await;
    pipeline.run_once().await.unwrap();
    let second = tables.rows(LISTINGS_TABLE).await;

    assert_eq!(first.len(), second.len());
    assert_eq!(natural_keys(&first), natural_keys(&second));
    assert_eq!(tables.rows(HEALTH_TABLE).await.len(), 3);
}

#[tokio::test]
async fn unknown_currency_keeps_original_salary_and_null_eur() {
    let dir = tempfile::tempdir().unwrap();
    let tables = Arc::new(MemoryTables::new());
    let pipeline = live_pipeline(dir.path(), fixtures(), tables.clone());

    let summary = pipeline.run_once().await.unwrap();

    let rows = tables.rows(LISTINGS_TABLE).await;
    let xyz = row(&rows, "remotive", "9002").unwrap();
    assert_eq!(xyz["currency"], "XYZ");
    assert_eq!(xyz["salary_min"], 50000.0);
    assert!(xyz["salary_min_eur"].is_null());
    assert!(xyz["salary_max_eur"].is_null());
    assert_eq!(summary.fx.codes, vec!["XYZ"]);
    assert!(summary.fx.resolved.is_empty());
}

#[tokio::test]
async fn schema_cache_lag_on_the_listing_upsert_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let tables = Arc::new(MemoryTables::new());
    let lagging = Arc::new(LaggingUpserts::new(tables.clone(), 2));
    let pipeline = live_pipeline_over(dir.path(), fixtures(), lagging.clone());

    let summary = pipeline.run_once().await.unwrap();

    assert!(summary.persistence_error.is_none());
    assert_eq!(summary.status, RunStatus::Error, "only the 503 source fails");
    assert_eq!(summary.persistence.as_ref().unwrap().written, 3);
    assert_eq!(lagging.upserts.load(Ordering::SeqCst), 3);
    assert_eq!(tables.rows(LISTINGS_TABLE).await.len(), 3);
}

#[tokio::test]
async fn schema_cache_lag_during_priming_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let tables = Arc::new(MemoryTables::new());
    let stale = StoreError::SchemaCacheStale {
        table: LISTINGS_TABLE.into(),
        code: "PGRST205".into(),
    };
    tables
        .fail_next(LISTINGS_TABLE, [stale.clone(), stale.clone(), stale])
        .await;
    let pipeline = live_pipeline(dir.path(), fixtures(), tables.clone());

    let summary = pipeline.run_once().await.unwrap();

    assert!(summary.persistence_error.is_none());
    assert_eq!(summary.persistence.as_ref().unwrap().written, 3);
    // Three stale priming reads, the one that succeeds, then one upsert.
    assert_eq!(tables.calls(LISTINGS_TABLE).await, 5);
}

#[tokio::test]
async fn cancelled_run_stops_gateway_retries() {
    let dir = tempfile::tempdir().unwrap();
    let http = fixtures();
    let tables = Arc::new(MemoryTables::new());
    tables
        .fail_next(
            LISTINGS_TABLE,
            (0..5).map(|_| StoreError::SchemaCacheStale {
                table: LISTINGS_TABLE.into(),
                code: "PGRST205".into(),
            }),
        )
        .await;
    let pipeline = live_pipeline(dir.path(), http.clone(), tables.clone());
    pipeline.cancel_token().cancel();

    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.status, RunStatus::Error);
    assert_eq!(http.total_calls(), 0);
    assert_eq!(tables.calls(LISTINGS_TABLE).await, 1);
}

#[tokio::test]
async fn every_task_is_recorded_once_including_persist() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = live_pipeline(dir.path(), fixtures(), Arc::new(MemoryTables::new()));

    let summary = pipeline.run_once().await.unwrap();

    let labels: Vec<_> = summary.runs.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(
        labels,
        vec!["source:weworkremotely", "source:remotive", "source:down", "persist"]
    );
    assert!(summary.runs.iter().all(|r| r.is_finished()));
    assert_eq!(summary.runs[2].status, RunStatus::Error);
    assert_eq!(summary.runs[3].items_inserted, 3);
}

#[tokio::test]
async fn dry_run_reports_without_persisting() {
    let dir = tempfile::tempdir().unwrap();
    let http = fixtures();
    let pipeline = SyncPipeline::with_collaborators(
        config(dir.path(), true),
        all_sources(),
        Collaborators {
            fetcher: http.clone(),
            gateway: None,
            rates: Arc::new(StaticRates::new(&[("USD", 0.9)])),
            telemetry: Arc::new(InMemoryTelemetry::new()),
        },
    )
    .unwrap();

    let summary = pipeline.run_once().await.unwrap();

    assert!(summary.dry_run);
    assert!(summary.persistence.is_none());
    assert_eq!(summary.totals.total_after_global_dedupe, 3);

    let reports_dir = dir.path().join("reports").join(summary.run_id.to_string());
    assert_eq!(
        summary.reports_dir.as_deref(),
        Some(reports_dir.display().to_string().as_str())
    );
    for file in [
        "summary.json",
        "run_brief.md",
        "snapshots/listings.parquet",
        "snapshots/manifest.json",
    ] {
        assert!(reports_dir.join(file).exists(), "{file} missing");
    }

    let written: JsonValue = serde_json::from_str(
        &std::fs::read_to_string(reports_dir.join("summary.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(written["totals"]["cross_source_removed"], 1);
    assert_eq!(written["skipped_sources"][0]["source_id"], "retired");

    let brief = std::fs::read_to_string(reports_dir.join("run_brief.md")).unwrap();
    assert!(brief.contains("| down |"));
    assert!(brief.contains("feed discontinued upstream"));
}

#[tokio::test]
async fn missing_gateway_outside_dry_run_fails_before_any_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let http = fixtures();
    let result = SyncPipeline::with_collaborators(
        config(dir.path(), false),
        all_sources(),
        Collaborators {
            fetcher: http.clone(),
            gateway: None,
            rates: Arc::new(StaticRates::new(&[])),
            telemetry: Arc::new(InMemoryTelemetry::new()),
        },
    );

    assert!(matches!(result, Err(ConfigError::MissingCredentials(_))));
    assert_eq!(http.total_calls(), 0);
}

#[tokio::test]
async fn live_pipeline_without_credentials_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = SyncPipeline::new(config(dir.path(), false), all_sources())
        .err()
        .expect("credentials are required");
    assert!(err.downcast_ref::<ConfigError>().is_some());
}
