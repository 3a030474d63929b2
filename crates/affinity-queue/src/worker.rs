//! Fixed-size worker pool draining the job queue.
//!
//! Each worker loop takes one job at a time, acquires any free slot within
//! the acquisition timeout, runs the job body in its own task while holding
//! the slot, releases the slot and publishes exactly one result.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::job::{Job, JobId, JobPhase};
use crate::outcome::JobResult;
use crate::permit::{Acquisition, AffinityManager, DenialReason, SlotError, SlotPermit};
use crate::processor::{ExecutionContext, ExecutionError, JobProcessor};
use crate::queue::{JobQueue, QueueError};
use crate::tracker::JobTracker;

pub(crate) const SHUTDOWN_REASON: &str = "Service is shutting down";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job waiting in the queue together with its result conduit.
pub struct QueuedJob {
    job: Arc<Job>,
    cancel: CancellationToken,
    reply: oneshot::Sender<JobResult>,
}

impl QueuedJob {
    /// Pair a job with a fresh result conduit; the receiver goes to the submitter.
    pub fn new(job: Job, cancel: CancellationToken) -> (Self, oneshot::Receiver<JobResult>) {
        let (reply, rx) = oneshot::channel();
        let queued = Self {
            job: Arc::new(job),
            cancel,
            reply,
        };
        (queued, rx)
    }

    pub fn job_id(&self) -> &JobId {
        self.job.id()
    }

    /// Fulfil the conduit. A submitter that stopped listening is not an error.
    fn complete(self, result: JobResult) {
        let job_id = self.job.id().clone();
        if self.reply.send(result).is_err() {
            tracing::debug!(job_id = %job_id, "Submitter dropped before result was delivered");
        }
    }
}

/// How `stop` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReport {
    /// Every worker loop finished within the drain timeout.
    Drained { cancelled_backlog: usize },
    /// The drain timeout elapsed; in-flight jobs keep running unobserved.
    Partial {
        cancelled_backlog: usize,
        still_running: usize,
    },
    /// `stop` had already been called.
    AlreadyStopped,
}

impl ShutdownReport {
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial { .. })
    }
}

struct WorkerShared {
    queue: Arc<JobQueue<QueuedJob>>,
    manager: Arc<AffinityManager>,
    processor: Arc<dyn JobProcessor>,
    tracker: Arc<JobTracker>,
    acquisition_timeout: Duration,
    active_workers: AtomicUsize,
}

pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    shutdown: CancellationToken,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue<QueuedJob>>,
        manager: Arc<AffinityManager>,
        processor: Arc<dyn JobProcessor>,
        tracker: Arc<JobTracker>,
        acquisition_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                queue,
                manager,
                processor,
                tracker,
                acquisition_timeout,
                active_workers: AtomicUsize::new(0),
            }),
            shutdown: CancellationToken::new(),
            handles: StdMutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Spawn `count` worker loops. Only the first call has an effect.
    pub fn start(&self, count: usize) -> usize {
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::warn!("Worker pool already started");
            return 0;
        }

        let mut handles = self.lock_handles();
        for index in 0..count {
            let shared = Arc::clone(&self.shared);
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(run_worker(
                WorkerId::new(index),
                shared,
                shutdown,
            )));
        }

        tracing::info!(
            workers = count,
            acquisition_timeout_ms = self.shared.acquisition_timeout.as_millis() as u64,
            "Worker pool started"
        );
        count
    }

    /// Close the queue, stop the loops and wait up to `drain_timeout` for
    /// in-flight jobs. Jobs still buffered get a cancelled result. Idempotent.
    pub async fn stop(&self, drain_timeout: Duration) -> ShutdownReport {
        if self.stopped.swap(true, Ordering::AcqRel) {
            tracing::debug!("Worker pool already stopped");
            return ShutdownReport::AlreadyStopped;
        }

        tracing::info!(
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "Stopping worker pool"
        );

        self.shared.queue.close();
        self.shutdown.cancel();

        let backlog = self.shared.queue.drain().await;
        let cancelled_backlog = backlog.len();
        for queued in backlog {
            let job_id = queued.job_id().clone();
            self.shared.tracker.remove(&job_id);
            queued.complete(JobResult::cancelled(job_id, SHUTDOWN_REASON));
        }
        if cancelled_backlog > 0 {
            tracing::info!(cancelled_backlog, "Cancelled queued jobs during shutdown");
        }

        let handles = std::mem::take(&mut *self.lock_handles());
        match tokio::time::timeout(drain_timeout, futures::future::join_all(handles)).await {
            Ok(_) => {
                tracing::info!("Worker pool stopped");
                ShutdownReport::Drained { cancelled_backlog }
            }
            Err(_) => {
                let still_running = self.active_workers();
                tracing::warn!(
                    still_running,
                    "Drain timeout elapsed, worker pool partially shut down"
                );
                ShutdownReport::Partial {
                    cancelled_backlog,
                    still_running,
                }
            }
        }
    }

    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Worker handle mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

async fn run_worker(worker_id: WorkerId, shared: Arc<WorkerShared>, shutdown: CancellationToken) {
    shared.active_workers.fetch_add(1, Ordering::AcqRel);
    tracing::debug!(worker = %worker_id, "Worker started");

    loop {
        let queued = match shared.queue.dequeue(&shutdown).await {
            Ok(Some(queued)) => queued,
            // Closed and drained, or told to stop taking work.
            Ok(None) | Err(QueueError::Closed | QueueError::Cancelled) => break,
        };

        let job_id = queued.job_id().clone();
        shared.tracker.dispatch(&job_id, worker_id);

        let result = shared
            .process(worker_id, &queued.job, &queued.cancel)
            .await;

        tracing::info!(
            worker = %worker_id,
            job_id = %job_id,
            outcome = %result.kind(),
            elapsed_ms = result.elapsed().as_millis() as u64,
            "Job finished"
        );

        shared.tracker.remove(&job_id);
        queued.complete(result);
    }

    shared.active_workers.fetch_sub(1, Ordering::AcqRel);
    tracing::debug!(worker = %worker_id, "Worker stopped");
}

impl WorkerShared {
    /// Per-job protocol: acquire, execute, release, classify.
    async fn process(
        &self,
        worker_id: WorkerId,
        job: &Arc<Job>,
        cancel: &CancellationToken,
    ) -> JobResult {
        let job_id = job.id().clone();
        let dispatched_at = Instant::now();

        self.tracker.transition(&job_id, JobPhase::AcquiringSlot);
        let acquisition = match self
            .manager
            .try_acquire_any(&job_id, self.acquisition_timeout, cancel)
            .await
        {
            Ok(acquisition) => acquisition,
            Err(SlotError::Disposed) => {
                return JobResult::error(job_id, "Processor is shutting down");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Slot acquisition failed");
                return JobResult::error(job_id, e.to_string());
            }
        };

        let slot_id = match acquisition {
            Acquisition::Granted { slot_id, .. } => slot_id,
            Acquisition::Denied {
                reason: DenialReason::Cancelled,
                ..
            } => {
                self.tracker
                    .transition(&job_id, JobPhase::CancelledWhileAcquiring);
                return JobResult::cancelled(job_id, DenialReason::Cancelled.message());
            }
            Acquisition::Denied {
                reason: DenialReason::Timeout,
                wait_time,
            } => {
                self.tracker.transition(&job_id, JobPhase::DeniedBusy);
                tracing::warn!(
                    job_id = %job_id,
                    wait_ms = wait_time.as_millis() as u64,
                    "No slot available within acquisition timeout"
                );
                return JobResult::busy(job_id, DenialReason::Timeout.message());
            }
        };

        let permit = SlotPermit::adopt(Arc::clone(&self.manager), slot_id);
        self.tracker.begin_executing(&job_id, slot_id);

        let ctx = ExecutionContext {
            slot_id,
            worker_id,
            cancel: cancel.clone(),
        };
        let processor = Arc::clone(&self.processor);
        let body_job = Arc::clone(job);
        let body = tokio::spawn(async move { processor.process(&body_job, &ctx).await });
        let joined = body.await;

        if let Err(e) = permit.release() {
            tracing::debug!(slot = %slot_id, error = %e, "Slot release after job failed");
        }

        match joined {
            Ok(Ok(output)) => {
                self.tracker.transition(&job_id, JobPhase::Succeeded);
                JobResult::success(
                    job_id,
                    output,
                    slot_id,
                    worker_id,
                    dispatched_at.elapsed(),
                )
            }
            Ok(Err(ExecutionError::Cancelled)) => {
                self.tracker
                    .transition(&job_id, JobPhase::CancelledWhileExecuting);
                JobResult::cancelled(job_id, ExecutionError::Cancelled.to_string())
            }
            Ok(Err(ExecutionError::Failed(message))) => {
                self.tracker.transition(&job_id, JobPhase::Failed);
                tracing::error!(job_id = %job_id, slot = %slot_id, error = %message, "Job body failed");
                JobResult::error(job_id, message)
            }
            Err(join_error) => {
                self.tracker.transition(&job_id, JobPhase::Failed);
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    "Job body was aborted".to_string()
                };
                tracing::error!(job_id = %job_id, slot = %slot_id, error = %message, "Job body panicked");
                JobResult::error(job_id, message)
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("Job body panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("Job body panicked: {s}")
    } else {
        "Job body panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::OutcomeKind;
    use crate::processor::SimulatedProcessor;
    use crate::queue::DEFAULT_QUEUE_CAPACITY;

    struct Fixture {
        queue: Arc<JobQueue<QueuedJob>>,
        manager: Arc<AffinityManager>,
        tracker: Arc<JobTracker>,
        pool: WorkerPool,
    }

    fn fixture(slots: usize, processor: Arc<dyn JobProcessor>, timeout: Duration) -> Fixture {
        let queue = Arc::new(JobQueue::new(DEFAULT_QUEUE_CAPACITY));
        let manager = Arc::new(
            AffinityManager::new(slots)
                .unwrap()
                .with_scan_interval(Duration::from_millis(5)),
        );
        let tracker = Arc::new(JobTracker::new());
        let pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&manager),
            processor,
            Arc::clone(&tracker),
            timeout,
        );
        Fixture {
            queue,
            manager,
            tracker,
            pool,
        }
    }

    async fn submit(fx: &Fixture, job: Job) -> oneshot::Receiver<JobResult> {
        let cancel = CancellationToken::new();
        fx.tracker.register(job.id().clone(), cancel.clone());
        let (queued, rx) = QueuedJob::new(job, cancel.clone());
        fx.queue.enqueue(queued, &cancel).await.unwrap();
        rx
    }

    struct FailingProcessor;

    #[async_trait::async_trait]
    impl JobProcessor for FailingProcessor {
        async fn process(&self, job: &Job, _ctx: &ExecutionContext) -> Result<String, ExecutionError> {
            if job.data() == "panic" {
                panic!("kaboom");
            }
            if job.data() == "fail" {
                return Err(ExecutionError::Failed("bad input".to_string()));
            }
            Ok(job.data().to_string())
        }
    }

    #[tokio::test]
    async fn runs_job_and_reports_slot_and_worker() {
        let fx = fixture(
            1,
            Arc::new(SimulatedProcessor::new(Duration::from_millis(1))),
            Duration::from_secs(1),
        );
        fx.pool.start(1);

        let result = submit(&fx, Job::new("x", 2)).await.await.unwrap();
        assert_eq!(result.kind(), OutcomeKind::Success);
        assert_eq!(result.slot_id().map(|s| s.index()), Some(0));
        assert_eq!(result.worker_id(), Some(WorkerId::new(0)));
        assert_eq!(fx.manager.available_slots(), 1);
        assert!(fx.tracker.is_empty());

        fx.pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failures_and_panics_become_errors_and_worker_survives() {
        let fx = fixture(1, Arc::new(FailingProcessor), Duration::from_secs(1));
        fx.pool.start(1);

        let failed = submit(&fx, Job::new("fail", 1)).await.await.unwrap();
        assert_eq!(failed.kind(), OutcomeKind::Error);
        assert_eq!(failed.reason(), Some("bad input"));

        let panicked = submit(&fx, Job::new("panic", 1)).await.await.unwrap();
        assert_eq!(panicked.kind(), OutcomeKind::Error);
        assert!(panicked.reason().unwrap().contains("kaboom"));
        assert_eq!(fx.manager.available_slots(), 1);

        let ok = submit(&fx, Job::new("fine", 1)).await.await.unwrap();
        assert_eq!(ok.output(), Some("fine"));

        fx.pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn busy_when_no_slot_frees_in_time() {
        let fx = fixture(
            1,
            Arc::new(SimulatedProcessor::new(Duration::from_millis(10))),
            Duration::from_millis(30),
        );
        assert!(
            fx.manager
                .try_acquire_specific(crate::permit::SlotId::new(0), &JobId::from("hog"))
                .unwrap()
        );
        fx.pool.start(1);

        let result = submit(&fx, Job::new("late", 1)).await.await.unwrap();
        assert_eq!(result.kind(), OutcomeKind::Busy);
        assert_eq!(result.reason(), Some("No slots available within timeout"));

        fx.pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn cancel_during_execution_releases_slot() {
        let fx = fixture(
            1,
            Arc::new(SimulatedProcessor::new(Duration::from_secs(60))),
            Duration::from_secs(1),
        );
        fx.pool.start(1);

        let job = Job::new("long", 10);
        let id = job.id().clone();
        let rx = submit(&fx, job).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.tracker.get(&id).unwrap().phase, JobPhase::Executing);
        assert!(fx.tracker.cancel(&id));

        let result = rx.await.unwrap();
        assert_eq!(result.kind(), OutcomeKind::Cancelled);
        assert_eq!(fx.manager.available_slots(), 1);

        fx.pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stop_cancels_backlog_and_is_idempotent() {
        let fx = fixture(
            1,
            Arc::new(SimulatedProcessor::new(Duration::from_millis(1))),
            Duration::from_secs(1),
        );

        let waiting = submit(&fx, Job::new("never-dispatched", 1)).await;

        let report = fx.pool.stop(Duration::from_secs(1)).await;
        assert_eq!(report, ShutdownReport::Drained { cancelled_backlog: 1 });

        let result = waiting.await.unwrap();
        assert_eq!(result.kind(), OutcomeKind::Cancelled);
        assert_eq!(result.reason(), Some(SHUTDOWN_REASON));
        assert!(fx.tracker.is_empty());

        assert_eq!(
            fx.pool.stop(Duration::from_secs(1)).await,
            ShutdownReport::AlreadyStopped
        );
        assert!(!fx.pool.is_running());
    }

    #[tokio::test]
    async fn stop_reports_partial_when_jobs_outlive_drain_timeout() {
        let fx = fixture(
            1,
            Arc::new(SimulatedProcessor::new(Duration::from_millis(300))),
            Duration::from_secs(1),
        );
        fx.pool.start(1);

        let rx = submit(&fx, Job::new("slow", 1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = fx.pool.stop(Duration::from_millis(20)).await;
        assert!(report.is_partial());

        // Not killed: the job still completes on its own.
        let result = rx.await.unwrap();
        assert!(result.is_success());
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(Box::new("oops")), "Job body panicked: oops");
        assert_eq!(
            panic_message(Box::new(String::from("owned"))),
            "Job body panicked: owned"
        );
        assert_eq!(panic_message(Box::new(42u8)), "Job body panicked");
    }
}
