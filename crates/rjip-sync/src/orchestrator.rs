//! Bounded-parallel task runner with per-task retry and all-settled semantics.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use rjip_core::RunRecord;
use rjip_storage::{retry_async, BackoffPolicy};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::telemetry::{RunOutcome, RunTelemetry};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Outer ceiling for `run_all`. Expiry cancels every task still running or queued.
    pub deadline: Option<Duration>,
}

impl OrchestratorConfig {
    /// `attempts` counts the first try. Backoff doubles from `base_delay`, capped at 30s.
    pub fn new(concurrency: usize, attempts: usize, base_delay: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            backoff: BackoffPolicy::exponential(
                attempts.saturating_sub(1),
                base_delay,
                Duration::from_secs(30),
            ),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }
}

#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    /// Zero-based attempt index.
    pub attempt: usize,
    pub cancel: CancellationToken,
}

#[derive(Debug, Error)]
pub enum TaskError {
    /// Worth another attempt after backoff.
    #[error("{0:#}")]
    Transient(anyhow::Error),
    #[error("{0:#}")]
    Fatal(anyhow::Error),
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    fn is_transient(&self) -> bool {
        matches!(self, TaskError::Transient(_))
    }
}

/// What a successful task reports to telemetry.
pub trait TaskReport {
    fn items(&self) -> u64;

    fn notes(&self) -> Option<String> {
        None
    }
}

type Producer<T> = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<T, TaskError>> + Send + Sync>;

pub struct Task<T> {
    pub id: String,
    producer: Producer<T>,
}

impl<T> Task<T> {
    pub fn new<F, Fut>(id: impl Into<String>, producer: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            producer: Arc::new(move |ctx| producer(ctx).boxed()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskFailure {
    #[error("{0}")]
    Failed(String),
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("cancelled before completion")]
    Cancelled,
}

#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub id: String,
    pub attempts: usize,
    pub mean_latency: Duration,
    pub result: Result<T, TaskFailure>,
    /// Finalized telemetry record for this task.
    pub record: RunRecord,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    telemetry: Arc<dyn RunTelemetry>,
    cancel: CancellationToken,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Attempts<T> {
    count: usize,
    mean_latency: Duration,
    result: Result<T, TaskFailure>,
}

async fn acquire_slot(
    limit: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = limit.clone().acquire_owned() => permit.ok(),
    }
}

/// Each attempt holds a worker slot only while it runs; backoff sleeps hold none. `first` is
/// the slot the task was admitted with.
async fn run_attempts<T>(
    id: &str,
    producer: &Producer<T>,
    backoff: &BackoffPolicy,
    cancel: &CancellationToken,
    limit: &Arc<Semaphore>,
    first: OwnedSemaphorePermit,
) -> Attempts<T> {
    let count = AtomicUsize::new(0);
    let busy_ms = AtomicU64::new(0);
    let mut first = Some(first);

    let result = retry_async(backoff, cancel, TaskError::is_transient, |attempt| {
        let ctx = TaskContext {
            task_id: id.to_string(),
            attempt,
            cancel: cancel.clone(),
        };
        let fut = producer(ctx);
        let held = first.take();
        let (count, busy_ms) = (&count, &busy_ms);
        async move {
            let permit = match held {
                Some(permit) => Some(permit),
                None => acquire_slot(limit, cancel).await,
            };
            let Some(_permit) = permit else {
                return Err(TaskError::Fatal(anyhow::anyhow!(
                    "cancelled while waiting for a worker slot"
                )));
            };
            let started = Instant::now();
            let outcome = AssertUnwindSafe(fut).catch_unwind().await;
            count.fetch_add(1, Ordering::Relaxed);
            busy_ms.fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(task_id = id, panic = %message, "task panicked");
                    Err(TaskError::Panicked(message))
                }
            }
        }
    })
    .await;

    let count = count.into_inner();
    let mean_latency = Duration::from_millis(busy_ms.into_inner() / count.max(1) as u64);
    let result = result.map_err(|err| match err {
        TaskError::Panicked(message) => TaskFailure::Panicked(message),
        _ if cancel.is_cancelled() => TaskFailure::Cancelled,
        other => TaskFailure::Failed(other.to_string()),
    });

    Attempts {
        count,
        mean_latency,
        result,
    }
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, telemetry: Arc<dyn RunTelemetry>) -> Self {
        Self {
            config,
            telemetry,
            cancel: CancellationToken::new(),
        }
    }

    /// Token whose cancellation settles every task of the current and future runs.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every task to settlement with at most `concurrency` in flight. One outcome per
    /// task, in input order. Each task's telemetry record is started and finished exactly once.
    pub async fn run_all<T>(&self, tasks: Vec<Task<T>>) -> Vec<TaskOutcome<T>>
    where
        T: TaskReport + Send + 'static,
    {
        let run_cancel = self.cancel.child_token();
        let limit = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        let deadline_guard = self.config.deadline.map(|deadline| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "run deadline reached; cancelling unsettled tasks"
                );
                token.cancel();
            })
        });

        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        // Started records, readable here if a task dies before finishing its own.
        let started: Vec<Arc<OnceLock<RunRecord>>> =
            ids.iter().map(|_| Arc::new(OnceLock::new())).collect();
        let mut set = JoinSet::new();
        for (slot, task) in tasks.into_iter().enumerate() {
            let limit = limit.clone();
            let telemetry = self.telemetry.clone();
            let backoff = self.config.backoff;
            let cancel = run_cancel.child_token();
            let started = started[slot].clone();

            set.spawn(async move {
                let permit = acquire_slot(&limit, &cancel).await;

                let record = telemetry.start(&task.id).await;
                let _ = started.set(record.clone());
                let attempts = match permit {
                    Some(permit) => {
                        run_attempts(&task.id, &task.producer, &backoff, &cancel, &limit, permit)
                            .await
                    }
                    None => Attempts {
                        count: 0,
                        mean_latency: Duration::ZERO,
                        result: Err(TaskFailure::Cancelled),
                    },
                };

                let latency_ms = attempts.mean_latency.as_millis() as u64;
                let outcome = match &attempts.result {
                    Ok(report) => RunOutcome::ok(report.items(), latency_ms).with_notes(report.notes()),
                    Err(failure) => RunOutcome::error(failure.to_string(), latency_ms),
                };
                let record = telemetry.finish(record, outcome).await;

                (
                    slot,
                    TaskOutcome {
                        id: task.id,
                        attempts: attempts.count,
                        mean_latency: attempts.mean_latency,
                        result: attempts.result,
                        record,
                    },
                )
            });
        }

        let mut slots: Vec<Option<TaskOutcome<T>>> = ids.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((slot, outcome)) => slots[slot] = Some(outcome),
                Err(err) => error!(error = %err, "orchestrated task aborted outside its guard"),
            }
        }
        if let Some(guard) = deadline_guard {
            guard.abort();
        }

        let mut outcomes = Vec::with_capacity(slots.len());
        for ((slot, id), started) in slots.into_iter().zip(ids).zip(started) {
            let outcome = match slot {
                Some(outcome) => outcome,
                None => {
                    let failure = TaskFailure::Panicked("task aborted".to_string());
                    let record = match started.get() {
                        Some(record) => record.clone(),
                        None => self.telemetry.start(&id).await,
                    };
                    let record = self
                        .telemetry
                        .finish(record, RunOutcome::error(failure.to_string(), 0))
                        .await;
                    TaskOutcome {
                        id,
                        attempts: 0,
                        mean_latency: Duration::ZERO,
                        result: Err(failure),
                        record,
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}
