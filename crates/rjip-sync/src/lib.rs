//! Ingestion run orchestration: registry, per-source harvest tasks, the global dedup barrier,
//! currency normalization, persistence, telemetry, and operator reports.

pub mod dedup;
pub mod fx;
pub mod migrate;
pub mod orchestrator;
pub mod registry;
pub mod reports;
pub mod telemetry;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rjip_adapters::{adapter_for_kind, parse_listing, AdapterContext};
use rjip_core::{CanonicalListing, RunRecord, RunStatus, SourceDescriptor};
use rjip_storage::{
    BackoffPolicy, HealthOutcome, HttpClientConfig, HttpFetcher, PersistenceGateway,
    PostgrestClient, PostgrestConfig, SourceFetcher, TableClient, UpsertReport, HEALTH_TABLE,
    LISTINGS_TABLE,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::{dedup_global, dedup_per_source, filter_fresh, freshness_cutoff, ratio};
use crate::fx::{CurrencyNormalizer, ExchangeRateHost, FxReport, RateProvider};
use crate::orchestrator::{Orchestrator, OrchestratorConfig, Task, TaskContext, TaskError, TaskReport};
use crate::registry::SourceRegistry;
use crate::telemetry::{InMemoryTelemetry, RunOutcome, RunTelemetry, TableTelemetry};

pub const CRATE_NAME: &str = "rjip-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required credentials: {0}")]
    MissingCredentials(String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub supabase_url: Option<String>,
    pub service_key: Option<String>,
    pub database_url: Option<String>,
    pub fetch_timeout: Duration,
    pub fetch_max_retries: usize,
    pub fetch_base_delay: Duration,
    pub max_age_days: u32,
    pub dry_run: bool,
    pub concurrency: usize,
    pub task_attempts: usize,
    pub task_base_delay: Duration,
    pub run_deadline: Option<Duration>,
    pub fx_base_url: String,
    pub user_agent: String,
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub prune_max_age_days: u32,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(get: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn flag(get: &dyn Fn(&str) -> Option<String>, key: &str) -> bool {
    get(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Unparsable numbers fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let get: &dyn Fn(&str) -> Option<String> = &get;
        Self {
            supabase_url: non_empty(get("SUPABASE_URL"))
                .or_else(|| non_empty(get("NEXT_PUBLIC_SUPABASE_URL"))),
            service_key: non_empty(get("SUPABASE_SERVICE_ROLE_KEY")),
            database_url: non_empty(get("DATABASE_URL")),
            fetch_timeout: Duration::from_millis(parse_or(get, "RJIP_FETCH_TIMEOUT_MS", 15_000)),
            fetch_max_retries: parse_or(get, "RJIP_FETCH_MAX_RETRIES", 3),
            fetch_base_delay: Duration::from_millis(parse_or(get, "RJIP_FETCH_BASE_DELAY_MS", 500)),
            max_age_days: parse_or(get, "RJIP_MAX_AGE_DAYS", 45),
            dry_run: flag(get, "DRY_RUN"),
            concurrency: parse_or(get, "RJIP_CONCURRENCY", 4),
            task_attempts: parse_or(get, "RJIP_TASK_ATTEMPTS", 3),
            task_base_delay: Duration::from_millis(parse_or(get, "RJIP_TASK_BASE_DELAY_MS", 1_000)),
            run_deadline: get("RJIP_RUN_DEADLINE_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
            fx_base_url: non_empty(get("FX_BASE_URL"))
                .unwrap_or_else(|| "https://api.exchangerate.host".to_string()),
            user_agent: non_empty(get("RJIP_USER_AGENT"))
                .unwrap_or_else(|| "rjip-bot/0.1 (+https://remotebalkan.com)".to_string()),
            workspace_root: non_empty(get("RJIP_WORKSPACE_ROOT"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            scheduler_enabled: flag(get, "RJIP_SCHEDULER_ENABLED"),
            sync_cron_1: non_empty(get("SYNC_CRON_1")).unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sync_cron_2: non_empty(get("SYNC_CRON_2"))
                .unwrap_or_else(|| "0 0 18 * * *".to_string()),
            prune_max_age_days: parse_or(get, "JOB_PRUNE_MAX_AGE_DAYS", 60),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn require_credentials(&self) -> Result<PostgrestConfig, ConfigError> {
        let mut missing = Vec::new();
        if self.supabase_url.is_none() {
            missing.push("SUPABASE_URL");
        }
        if self.service_key.is_none() {
            missing.push("SUPABASE_SERVICE_ROLE_KEY");
        }
        match (&self.supabase_url, &self.service_key) {
            (Some(base_url), Some(service_key)) => Ok(PostgrestConfig {
                base_url: base_url.clone(),
                service_key: service_key.clone(),
                timeout: self.fetch_timeout,
                user_agent: Some(self.user_agent.clone()),
            }),
            _ => Err(ConfigError::MissingCredentials(missing.join(", "))),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.fetch_timeout,
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::linear(
                self.fetch_max_retries,
                self.fetch_base_delay,
                Duration::from_secs(30),
            ),
            ..Default::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::new(self.concurrency, self.task_attempts, self.task_base_delay)
            .with_deadline(self.run_deadline)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source_id: String,
    pub fetched: usize,
    pub parsed: usize,
    pub fresh: usize,
    pub unique: usize,
    pub dedupe_ratio: f64,
    pub stale_filtered: usize,
    pub ok: bool,
    pub error: Option<String>,
    pub attempts: usize,
    pub pages: usize,
    /// A later page failed; the items from earlier pages were kept.
    pub page_error: Option<String>,
    pub mean_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedSource {
    pub source_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunTotals {
    pub total_fetched: usize,
    pub total_fresh: usize,
    pub total_after_source_dedupe: usize,
    pub total_after_global_dedupe: usize,
    pub cross_source_removed: usize,
    pub ratio: f64,
    pub stale_filtered_total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub status: RunStatus,
    pub max_age_days: u32,
    pub freshness_cutoff: DateTime<Utc>,
    pub sources: Vec<SourceStats>,
    pub skipped_sources: Vec<SkippedSource>,
    pub totals: RunTotals,
    pub fx: FxReport,
    pub persistence: Option<UpsertReport>,
    pub persistence_error: Option<String>,
    pub health_errors: Vec<String>,
    pub runs: Vec<RunRecord>,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceStats> {
        self.sources.iter().filter(|s| !s.ok)
    }
}

/// Output of one source task: the source's fresh, locally deduplicated listings.
#[derive(Debug)]
struct SourceHarvest {
    fetched: usize,
    parsed: usize,
    fresh: usize,
    stale_filtered: usize,
    pages: usize,
    page_error: Option<String>,
    listings: Vec<CanonicalListing>,
}

impl TaskReport for SourceHarvest {
    fn items(&self) -> u64 {
        self.listings.len() as u64
    }

    fn notes(&self) -> Option<String> {
        let mut notes = format!(
            "fetched={} parsed={} fresh={} pages={}",
            self.fetched, self.parsed, self.fresh, self.pages
        );
        if let Some(err) = &self.page_error {
            notes.push_str(&format!(" page_error={err}"));
        }
        Some(notes)
    }
}

async fn harvest_source(
    http: &dyn SourceFetcher,
    source: &SourceDescriptor,
    run_id: Uuid,
    cutoff: DateTime<Utc>,
    ctx: TaskContext,
) -> Result<SourceHarvest, TaskError> {
    let adapter = adapter_for_kind(source.kind);
    let adapter_ctx = AdapterContext {
        run_id,
        cancel: ctx.cancel.clone(),
    };
    let fetched = adapter
        .fetch_items(http, &adapter_ctx, source)
        .await
        .map_err(|err| {
            if err.is_retryable() {
                TaskError::Transient(err.into())
            } else {
                TaskError::Fatal(err.into())
            }
        })?;

    let parsed: Vec<_> = fetched
        .items
        .iter()
        .filter_map(|item| parse_listing(item, source))
        .collect();
    let parsed_count = parsed.len();
    let (fresh, stale_filtered) = filter_fresh(parsed, cutoff);
    let fresh_count = fresh.len();
    let listings = dedup_per_source(fresh);

    debug!(
        source_id = %source.id,
        attempt = ctx.attempt + 1,
        fetched = fetched.items.len(),
        parsed = parsed_count,
        fresh = fresh_count,
        unique = listings.len(),
        "source harvested"
    );

    Ok(SourceHarvest {
        fetched: fetched.items.len(),
        parsed: parsed_count,
        fresh: fresh_count,
        stale_filtered,
        pages: fetched.pages,
        page_error: fetched.page_error,
        listings,
    })
}

/// Injected run dependencies. `gateway` is `None` only for dry runs.
pub struct Collaborators {
    pub fetcher: Arc<dyn SourceFetcher>,
    pub gateway: Option<PersistenceGateway>,
    pub rates: Arc<dyn RateProvider>,
    pub telemetry: Arc<dyn RunTelemetry>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    sources: Vec<Arc<SourceDescriptor>>,
    fetcher: Arc<dyn SourceFetcher>,
    gateway: Option<PersistenceGateway>,
    normalizer: CurrencyNormalizer,
    telemetry: Arc<dyn RunTelemetry>,
    orchestrator: Orchestrator,
}

impl SyncPipeline {
    /// Wires live collaborators. Outside dry-run mode missing gateway credentials fail here,
    /// before any source is scheduled.
    pub fn new(config: SyncConfig, sources: Vec<SourceDescriptor>) -> Result<Self> {
        let fetcher: Arc<dyn SourceFetcher> = Arc::new(HttpFetcher::new(config.http_config())?);
        let rates = Arc::new(ExchangeRateHost::new(&config.fx_base_url, fetcher.clone()));

        let (gateway, telemetry): (Option<PersistenceGateway>, Arc<dyn RunTelemetry>) =
            if config.dry_run {
                (None, Arc::new(InMemoryTelemetry::new()) as Arc<dyn RunTelemetry>)
            } else {
                let client: Arc<dyn TableClient> =
                    Arc::new(PostgrestClient::new(config.require_credentials()?)?);
                (
                    Some(PersistenceGateway::new(client.clone())),
                    Arc::new(TableTelemetry::new(client)) as Arc<dyn RunTelemetry>,
                )
            };

        Ok(Self::with_collaborators(
            config,
            sources,
            Collaborators {
                fetcher,
                gateway,
                rates,
                telemetry,
            },
        )?)
    }

    pub fn with_collaborators(
        config: SyncConfig,
        sources: Vec<SourceDescriptor>,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        if !config.dry_run && collaborators.gateway.is_none() {
            return Err(ConfigError::MissingCredentials(
                "no persistence gateway configured".to_string(),
            ));
        }
        let orchestrator =
            Orchestrator::new(config.orchestrator_config(), collaborators.telemetry.clone());
        let gateway = collaborators
            .gateway
            .map(|gateway| gateway.with_cancel(orchestrator.cancel_token()));
        Ok(Self {
            sources: sources.into_iter().map(Arc::new).collect(),
            fetcher: collaborators.fetcher,
            gateway,
            normalizer: CurrencyNormalizer::new(collaborators.rates),
            telemetry: collaborators.telemetry,
            orchestrator,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Cancels in-flight fetches, pending retries and gateway writes of the current run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.orchestrator.cancel_token()
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, dry_run = self.config.dry_run);
        self.run_with_id(run_id).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let cancel = self.orchestrator.cancel_token();

        let (active, inactive): (Vec<_>, Vec<_>) =
            self.sources.iter().cloned().partition(|s| s.active);
        let skipped_sources: Vec<SkippedSource> = inactive
            .iter()
            .map(|source| {
                info!(
                    source_id = %source.id,
                    reason = source.inactive_reason.as_deref().unwrap_or("inactive"),
                    "skipping inactive source"
                );
                SkippedSource {
                    source_id: source.id.clone(),
                    reason: source.inactive_reason.clone(),
                }
            })
            .collect();

        if let Some(gateway) = &self.gateway {
            for table in [LISTINGS_TABLE, HEALTH_TABLE] {
                if let Err(err) = gateway.prime(table).await {
                    warn!(table, error = %err, "schema cache prime failed");
                }
            }
        }

        let cutoff = freshness_cutoff(started_at, self.config.max_age_days);
        let tasks: Vec<Task<SourceHarvest>> = active
            .iter()
            .map(|source| {
                let source = source.clone();
                let fetcher = self.fetcher.clone();
                Task::new(format!("source:{}", source.id), move |ctx: TaskContext| {
                    let source = source.clone();
                    let fetcher = fetcher.clone();
                    async move { harvest_source(fetcher.as_ref(), &source, run_id, cutoff, ctx).await }
                })
            })
            .collect();

        // Barrier: every source task has settled past this point.
        let outcomes = self.orchestrator.run_all(tasks).await;

        let mut stats = Vec::with_capacity(outcomes.len());
        let mut runs = Vec::with_capacity(outcomes.len() + 1);
        let mut health = Vec::with_capacity(outcomes.len());
        let mut accumulated = Vec::new();
        for (source, outcome) in active.iter().zip(outcomes) {
            let mean_latency_ms = outcome.mean_latency.as_millis() as u64;
            runs.push(outcome.record);
            match outcome.result {
                Ok(harvest) => {
                    stats.push(SourceStats {
                        source_id: source.id.clone(),
                        fetched: harvest.fetched,
                        parsed: harvest.parsed,
                        fresh: harvest.fresh,
                        unique: harvest.listings.len(),
                        dedupe_ratio: ratio(harvest.listings.len(), harvest.fresh),
                        stale_filtered: harvest.stale_filtered,
                        ok: true,
                        error: None,
                        attempts: outcome.attempts,
                        pages: harvest.pages,
                        page_error: harvest.page_error,
                        mean_latency_ms,
                    });
                    health.push((source.id.clone(), HealthOutcome::Success));
                    accumulated.extend(harvest.listings);
                }
                Err(failure) => {
                    let reason = failure.to_string();
                    warn!(source_id = %source.id, attempts = outcome.attempts, error = %reason, "source failed");
                    stats.push(SourceStats {
                        source_id: source.id.clone(),
                        fetched: 0,
                        parsed: 0,
                        fresh: 0,
                        unique: 0,
                        dedupe_ratio: 0.0,
                        stale_filtered: 0,
                        ok: false,
                        error: Some(reason.clone()),
                        attempts: outcome.attempts,
                        pages: 0,
                        page_error: None,
                        mean_latency_ms,
                    });
                    health.push((source.id.clone(), HealthOutcome::Failure(reason)));
                }
            }
        }

        let mut health_errors = Vec::new();
        if let Some(gateway) = &self.gateway {
            let at = Utc::now();
            for (source_id, outcome) in &health {
                if let Err(err) = gateway.record_health(source_id, outcome, at).await {
                    warn!(source_id = %source_id, error = %err, "health record write failed");
                    health_errors.push(format!("{source_id}: {err}"));
                }
            }
        }

        let total_fresh: usize = stats.iter().map(|s| s.fresh).sum();
        let total_after_source_dedupe = accumulated.len();
        let mut listings = dedup_global(accumulated);
        let totals = RunTotals {
            total_fetched: stats.iter().map(|s| s.fetched).sum(),
            total_fresh,
            total_after_source_dedupe,
            total_after_global_dedupe: listings.len(),
            cross_source_removed: total_after_source_dedupe - listings.len(),
            ratio: ratio(listings.len(), total_fresh),
            stale_filtered_total: stats.iter().map(|s| s.stale_filtered).sum(),
        };

        let fx = self.normalizer.normalize(run_id, &mut listings, &cancel).await;

        let (persistence, persistence_error) = match &self.gateway {
            Some(gateway) => self.persist(gateway, &listings, &mut runs).await,
            None => {
                info!(listings = listings.len(), "dry run; skipping persistence");
                (None, None)
            }
        };

        let any_source_failed = stats.iter().any(|s| !s.ok);
        let status = if any_source_failed || persistence_error.is_some() || !health_errors.is_empty()
        {
            RunStatus::Error
        } else {
            RunStatus::Ok
        };

        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(run_id.to_string());
        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.config.dry_run,
            status,
            max_age_days: self.config.max_age_days,
            freshness_cutoff: cutoff,
            sources: stats,
            skipped_sources,
            totals,
            fx,
            persistence,
            persistence_error,
            health_errors,
            runs,
            reports_dir: Some(reports_dir.display().to_string()),
        };

        if let Err(err) =
            reports::write_reports(&self.config.workspace_root, &summary, &listings).await
        {
            warn!(error = %format!("{err:#}"), "could not write run reports");
            summary.reports_dir = None;
        }

        info!(
            status = ?summary.status,
            sources = summary.sources.len(),
            failed = summary.failed_sources().count(),
            skipped = summary.skipped_sources.len(),
            total_fetched = summary.totals.total_fetched,
            total_fresh = summary.totals.total_fresh,
            after_global_dedupe = summary.totals.total_after_global_dedupe,
            cross_source_removed = summary.totals.cross_source_removed,
            stale_filtered = summary.totals.stale_filtered_total,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn persist(
        &self,
        gateway: &PersistenceGateway,
        listings: &[CanonicalListing],
        runs: &mut Vec<RunRecord>,
    ) -> (Option<UpsertReport>, Option<String>) {
        let record = self.telemetry.start("persist").await;
        let started = Instant::now();
        let result = gateway.upsert_listings(listings).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(report) => {
                let outcome = RunOutcome::ok(report.written as u64, elapsed_ms).with_notes(Some(
                    format!(
                        "chunks={} collapsed={} skipped_undated={}",
                        report.chunks, report.collapsed, report.skipped_undated
                    ),
                ));
                runs.push(self.telemetry.finish(record, outcome).await);
                (Some(report), None)
            }
            Err(err) => {
                error!(error = %err, "listing upsert failed");
                let outcome = RunOutcome::error(err.to_string(), elapsed_ms);
                runs.push(self.telemetry.finish(record, outcome).await);
                (None, Some(err.to_string()))
            }
        }
    }

    /// Deletes persisted listings older than `prune_max_age_days`.
    pub async fn prune(&self) -> Result<u64> {
        let gateway = self.gateway.as_ref().ok_or_else(|| {
            ConfigError::MissingCredentials("prune needs a persistence gateway".to_string())
        })?;
        let cutoff = freshness_cutoff(Utc::now(), self.config.prune_max_age_days);
        let deleted = gateway
            .prune_older_than(cutoff)
            .await
            .context("pruning stale listings")?;
        info!(deleted, cutoff = %cutoff, "pruned stale listings");
        Ok(deleted)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = self.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = pipeline.clone();
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            status = ?summary.status,
                            "scheduled sync finished"
                        ),
                        Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

pub async fn load_sources(path: &Path) -> Result<Vec<SourceDescriptor>> {
    let registry = SourceRegistry::load(path)
        .await
        .with_context(|| format!("loading {}", path.display()))?;
    registry
        .descriptors()
        .with_context(|| format!("validating {}", path.display()))
}

pub async fn run_sync_once(config: SyncConfig) -> Result<RunSummary> {
    let sources = load_sources(&config.sources_path()).await?;
    let pipeline = SyncPipeline::new(config, sources)?;
    pipeline.run_once().await
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    run_sync_once(SyncConfig::from_env()).await
}
