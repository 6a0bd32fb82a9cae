//! Job dispatch.
//!
//! Handlers are registered by kind in an explicit [`JobRegistry`] built once
//! at startup and shared by `Arc`. Queues deliver at least once, so every
//! handler must tolerate seeing the same job twice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Run one test case of a run and append its result.
    ExecuteTestCase,
    /// Compute the aggregate status once every slot of a run is filled.
    FinalizeRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_index: Option<usize>,
    /// Times this job has been handed to a handler so far.
    #[serde(default)]
    pub deliveries: u32,
}

impl Job {
    pub fn execute_case(run_id: impl Into<String>, case_index: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: JobKind::ExecuteTestCase,
            run_id: run_id.into(),
            case_index: Some(case_index),
            deliveries: 0,
        }
    }

    pub fn finalize(run_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: JobKind::FinalizeRun,
            run_id: run_id.into(),
            case_index: None,
            deliveries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn with(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> anyhow::Result<JobHandle>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub handled: usize,
    pub redelivered: usize,
    pub dead_lettered: Vec<Job>,
}

/// In-process queue with at-least-once delivery.
///
/// A job whose handler fails goes back to the tail of the queue until it has
/// been delivered `max_deliveries` times; after that it is dead-lettered.
pub struct LocalQueue {
    registry: Arc<JobRegistry>,
    max_deliveries: u32,
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<mpsc::UnboundedReceiver<Job>>,
}

impl LocalQueue {
    pub fn new(registry: Arc<JobRegistry>, max_deliveries: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            registry,
            max_deliveries: max_deliveries.max(1),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Puts an already-delivered job back on the queue as-is, the way a
    /// broker does after a lost acknowledgement.
    pub fn redeliver(&self, job: Job) -> anyhow::Result<()> {
        self.tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("local queue closed"))
    }

    /// Handles queued jobs one at a time until the queue is empty.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let mut rx = self.rx.lock().await;

        while let Ok(mut job) = rx.try_recv() {
            job.deliveries += 1;
            let Some(handler) = self.registry.get(job.kind) else {
                error!(job_id = %job.id, kind = ?job.kind, "no handler registered for job kind");
                report.dead_lettered.push(job);
                continue;
            };

            debug!(job_id = %job.id, kind = ?job.kind, delivery = job.deliveries, "delivering job");
            match handler.handle(&job).await {
                Ok(()) => report.handled += 1,
                Err(e) if job.deliveries < self.max_deliveries => {
                    warn!(
                        job_id = %job.id,
                        run_id = %job.run_id,
                        delivery = job.deliveries,
                        max_deliveries = self.max_deliveries,
                        error = %e,
                        "job failed; redelivering"
                    );
                    report.redelivered += 1;
                    if self.tx.send(job).is_err() {
                        error!("local queue closed during redelivery");
                    }
                }
                Err(e) => {
                    error!(job_id = %job.id, run_id = %job.run_id, error = %e, "job dead-lettered");
                    report.dead_lettered.push(job);
                }
            }
        }
        report
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn enqueue(&self, job: Job) -> anyhow::Result<JobHandle> {
        let handle = JobHandle {
            job_id: job.id.clone(),
        };
        self.tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("local queue closed"))?;
        Ok(handle)
    }
}
