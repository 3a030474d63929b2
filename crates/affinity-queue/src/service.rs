//! ProcessingService: transport-agnostic job submission and lifecycle.
//!
//! This service owns:
//! - The slot pool (exclusive affinity between running jobs and slots)
//! - The bounded job queue and the worker pool draining it
//! - The in-flight tracker (phases, cancel by id)
//! - Shutdown coordination (bidirectional)
//!
//! Transports build a [`Job`] from a request, call [`ProcessingService::submit`]
//! and map the returned [`JobResult`] onto their own status codes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ProcessorSettings};
use crate::health::HealthReport;
use crate::job::{Job, JobId, JobPhase};
use crate::outcome::JobResult;
use crate::permit::{AffinityManager, SlotError, utilization};
use crate::processor::{JobProcessor, SimulatedProcessor};
use crate::queue::{JobQueue, QueueError};
use crate::status::QueueStatus;
use crate::tracker::JobTracker;
use crate::worker::{QueuedJob, ShutdownReport, WorkerPool};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Slots(#[from] SlotError),
}

/// Aggregate of a bulk submission. Partial failure is reported, never rolled back.
#[derive(Debug, Clone)]
pub struct BulkOutcome {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<JobResult>,
}

#[derive(Serialize)]
struct BulkResponse {
    total_requests: usize,
    successful: usize,
    failed: usize,
    results: Vec<serde_json::Value>,
}

impl BulkOutcome {
    fn from_results(results: Vec<JobResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }

    pub fn to_response(&self) -> serde_json::Value {
        let response = BulkResponse {
            total_requests: self.total,
            successful: self.succeeded,
            failed: self.failed,
            results: self.results.iter().map(JobResult::to_response).collect(),
        };
        serde_json::to_value(response).unwrap_or_default()
    }
}

/// Cleans up after a `submit` future that is dropped before its result arrives.
///
/// Not yet queued: removes the tracker entry. Queued: the worker owns the
/// entry, so only the job is cancelled.
struct SubmissionGuard {
    tracker: Arc<JobTracker>,
    job_id: JobId,
    cancel: CancellationToken,
    enqueued: bool,
    armed: bool,
}

impl SubmissionGuard {
    fn new(tracker: Arc<JobTracker>, job_id: JobId, cancel: CancellationToken) -> Self {
        Self {
            tracker,
            job_id,
            cancel,
            enqueued: false,
            armed: true,
        }
    }

    fn enqueued(&mut self) {
        self.enqueued = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SubmissionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.enqueued {
            tracing::debug!(job_id = %self.job_id, "Submission dropped, cancelling queued job");
            self.cancel.cancel();
        } else {
            self.tracker.remove(&self.job_id);
        }
    }
}

pub struct ProcessingService {
    settings: ProcessorSettings,
    manager: Arc<AffinityManager>,
    queue: Arc<JobQueue<QueuedJob>>,
    tracker: Arc<JobTracker>,
    workers: WorkerPool,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProcessingService {
    pub fn new(
        settings: ProcessorSettings,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<Self, ServiceError> {
        settings.validate()?;

        let manager = Arc::new(
            AffinityManager::new(settings.total_slots)?
                .with_scan_interval(settings.scan_interval),
        );
        let queue = Arc::new(JobQueue::new(settings.queue_capacity));
        let tracker = Arc::new(JobTracker::new());
        let workers = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&manager),
            processor,
            Arc::clone(&tracker),
            settings.acquisition_timeout,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            settings,
            manager,
            queue,
            tracker,
            workers,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Service whose job body is the simulated per-iteration workload.
    pub fn simulated(settings: ProcessorSettings) -> Result<Self, ServiceError> {
        let processor = Arc::new(SimulatedProcessor::new(settings.tick));
        Self::new(settings, processor)
    }

    /// Start the configured number of worker loops.
    pub fn start(&self) -> usize {
        self.workers.start(self.settings.worker_count)
    }

    /// Queue a job and wait for its result.
    ///
    /// `cancel` covers the whole submission: firing it while queuing, while
    /// waiting for a slot or while executing yields a cancelled result. The
    /// job itself runs under a child token so per-job cancels stay local.
    pub async fn submit(&self, job: Job, cancel: &CancellationToken) -> JobResult {
        let job_id = job.id().clone();
        let job_cancel = cancel.child_token();

        if !self.tracker.register(job_id.clone(), job_cancel.clone()) {
            tracing::warn!(job_id = %job_id, "Rejected duplicate in-flight job id");
            return JobResult::error(job_id, "A job with this id is already in flight");
        }

        tracing::debug!(
            job_id = %job_id,
            iterations = job.iterations(),
            client_id = job.client_id().unwrap_or("-"),
            "Job submitted"
        );

        let mut guard =
            SubmissionGuard::new(Arc::clone(&self.tracker), job_id.clone(), job_cancel.clone());
        let (queued, rx) = QueuedJob::new(job, job_cancel.clone());
        if let Err(e) = self.queue.enqueue(queued, &job_cancel).await {
            return match e {
                QueueError::Closed => JobResult::error(job_id, "Processor is shutting down"),
                QueueError::Cancelled => {
                    JobResult::cancelled(job_id, "Request cancelled while queuing")
                }
            };
        }
        guard.enqueued();

        let result = match rx.await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(job_id = %job_id, "Result conduit closed without a result");
                self.tracker.remove(&job_id);
                JobResult::error(job_id, "Job result was lost")
            }
        };
        guard.disarm();
        result
    }

    /// Submit every job concurrently and wait for all of them.
    pub async fn submit_bulk(&self, jobs: Vec<Job>, cancel: &CancellationToken) -> BulkOutcome {
        let count = jobs.len();
        let submissions = jobs.into_iter().map(|job| self.submit(job, cancel));
        let results = futures::future::join_all(submissions).await;

        let outcome = BulkOutcome::from_results(results);
        tracing::info!(
            total = count,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Bulk submission finished"
        );
        outcome
    }

    /// Cancel an in-flight job by id. Returns false if it is not in flight.
    pub fn cancel(&self, id: &JobId) -> bool {
        self.tracker.cancel(id)
    }

    pub fn status(&self) -> QueueStatus {
        // One scan feeds both the counts and the per-slot listing.
        let slots = self.manager.snapshot().unwrap_or_default();
        let total_slots = self.manager.total_slots();
        let available_slots = if slots.is_empty() {
            // Disposed: every slot was forcibly freed.
            total_slots
        } else {
            slots.iter().filter(|slot| slot.is_available).count()
        };
        let busy_slots = total_slots.saturating_sub(available_slots);

        QueueStatus {
            total_slots,
            available_slots,
            busy_slots,
            queued_jobs: self.queue.len(),
            active_jobs: self.tracker.len(),
            acquiring_jobs: self.tracker.count_in(JobPhase::AcquiringSlot),
            active_workers: self.workers.active_workers(),
            utilization_percentage: utilization(busy_slots, total_slots),
            is_running: self.workers.is_running(),
            status_time: Utc::now(),
            metrics: Default::default(),
            slots,
        }
        .with_metrics()
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::from_status(&self.status())
    }

    /// Stop the workers, then tear down the slot pool. Idempotent.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        let report = self.workers.stop(drain_timeout).await;
        if report != ShutdownReport::AlreadyStopped {
            self.manager.dispose();
        }
        report
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    pub fn manager(&self) -> &Arc<AffinityManager> {
        &self.manager
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    pub fn is_running(&self) -> bool {
        self.workers.is_running()
    }

    /// Ask the transport to stop serving (e.g. from `/shutdown`).
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}
