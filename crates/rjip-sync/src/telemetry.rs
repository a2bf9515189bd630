//! Run telemetry: one `scrape_runs` record per logical task, started and finished once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rjip_core::{RunRecord, RunStatus};
use rjip_storage::{Filter, TableClient, RUNS_TABLE};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub items_inserted: u64,
    pub mean_latency_ms: u64,
    pub notes: Option<String>,
}

impl RunOutcome {
    pub fn ok(items_inserted: u64, mean_latency_ms: u64) -> Self {
        Self {
            status: RunStatus::Ok,
            items_inserted,
            mean_latency_ms,
            notes: None,
        }
    }

    pub fn error(notes: impl Into<String>, mean_latency_ms: u64) -> Self {
        Self {
            status: RunStatus::Error,
            items_inserted: 0,
            mean_latency_ms,
            notes: Some(notes.into()),
        }
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }
}

/// Recorder contract. `finish` consumes the started record so it cannot be finalized twice.
/// Writes are best-effort: implementations log their own failures and never return them.
#[async_trait]
pub trait RunTelemetry: Send + Sync {
    async fn start(&self, task_id: &str) -> RunRecord;
    async fn finish(&self, record: RunRecord, outcome: RunOutcome) -> RunRecord;
}

fn finalize(mut record: RunRecord, outcome: RunOutcome) -> RunRecord {
    record.ended_at = Some(Utc::now());
    record.status = outcome.status;
    record.items_inserted = outcome.items_inserted;
    record.mean_latency_ms = outcome.mean_latency_ms;
    record.notes = outcome.notes;
    record
}

fn log_finished(record: &RunRecord) {
    match record.status {
        RunStatus::Error => warn!(
            task_id = %record.task_id,
            run_record = %record.id,
            items = record.items_inserted,
            mean_latency_ms = record.mean_latency_ms,
            notes = record.notes.as_deref().unwrap_or(""),
            "task failed"
        ),
        _ => info!(
            task_id = %record.task_id,
            run_record = %record.id,
            items = record.items_inserted,
            mean_latency_ms = record.mean_latency_ms,
            "task finished"
        ),
    }
}

/// Keeps records in memory. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryTelemetry {
    records: Mutex<Vec<RunRecord>>,
    started: Mutex<usize>,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<RunRecord> {
        self.records.lock().await.clone()
    }

    pub async fn started_count(&self) -> usize {
        *self.started.lock().await
    }
}

#[async_trait]
impl RunTelemetry for InMemoryTelemetry {
    async fn start(&self, task_id: &str) -> RunRecord {
        *self.started.lock().await += 1;
        RunRecord::started(task_id, Utc::now())
    }

    async fn finish(&self, record: RunRecord, outcome: RunOutcome) -> RunRecord {
        let record = finalize(record, outcome);
        log_finished(&record);
        self.records.lock().await.push(record.clone());
        record
    }
}

/// Writes records to the `scrape_runs` table through the REST gateway.
pub struct TableTelemetry {
    client: Arc<dyn TableClient>,
}

impl TableTelemetry {
    pub fn new(client: Arc<dyn TableClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RunTelemetry for TableTelemetry {
    async fn start(&self, task_id: &str) -> RunRecord {
        let record = RunRecord::started(task_id, Utc::now());
        let row = json!({
            "id": record.id,
            "task_id": record.task_id,
            "started_at": record.started_at,
            "status": record.status,
        });
        if let Err(err) = self.client.insert(RUNS_TABLE, &row).await {
            warn!(task_id, error = %err, "could not record task start");
        }
        record
    }

    async fn finish(&self, record: RunRecord, outcome: RunOutcome) -> RunRecord {
        let record = finalize(record, outcome);
        log_finished(&record);
        let patch = json!({
            "ended_at": record.ended_at,
            "status": record.status,
            "items_inserted": record.items_inserted,
            "mean_latency_ms": record.mean_latency_ms,
            "notes": record.notes,
        });
        let filters = [Filter::eq("id", record.id.to_string())];
        if let Err(err) = self.client.update(RUNS_TABLE, &filters, &patch).await {
            warn!(task_id = %record.task_id, error = %err, "could not record task finish");
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use rjip_storage::{MemoryTables, StoreError};

    use super::*;

    #[tokio::test]
    async fn table_telemetry_inserts_then_finalizes_in_place() {
        let tables = Arc::new(MemoryTables::new());
        let telemetry = TableTelemetry::new(tables.clone());

        let record = telemetry.start("source:wwr").await;
        assert!(!record.is_finished());
        let finished = telemetry
            .finish(record, RunOutcome::ok(12, 340))
            .await;
        assert!(finished.is_finished());

        let rows = tables.rows(RUNS_TABLE).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "ok");
        assert_eq!(rows[0]["items_inserted"], 12);
        assert_eq!(rows[0]["task_id"], "source:wwr");
    }

    #[tokio::test]
    async fn telemetry_write_failure_does_not_mask_outcome() {
        let tables = Arc::new(MemoryTables::new());
        tables
            .fail_next(
                RUNS_TABLE,
                [
                    StoreError::Transport {
                        table: RUNS_TABLE.into(),
                        message: "connection reset".into(),
                    },
                    StoreError::Transport {
                        table: RUNS_TABLE.into(),
                        message: "connection reset".into(),
                    },
                ],
            )
            .await;
        let telemetry = TableTelemetry::new(tables.clone());

        let record = telemetry.start("source:remotive").await;
        let finished = telemetry
            .finish(record, RunOutcome::error("http status 503", 90))
            .await;
        assert_eq!(finished.status, RunStatus::Error);
        assert_eq!(finished.notes.as_deref(), Some("http status 503"));
        assert!(tables.rows(RUNS_TABLE).await.is_empty());
    }

    #[tokio::test]
    async fn in_memory_telemetry_counts_starts_and_finishes() {
        let telemetry = InMemoryTelemetry::new();
        let a = telemetry.start("a").await;
        let b = telemetry.start("b").await;
        telemetry.finish(a, RunOutcome::ok(1, 10)).await;
        telemetry.finish(b, RunOutcome::error("boom", 5)).await;

        assert_eq!(telemetry.started_count().await, 2);
        let records = telemetry.records().await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(RunRecord::is_finished));
    }
}
