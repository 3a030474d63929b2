//! affinity-queue: bounded job queue and worker pool with exclusive slot affinity.

mod health;
mod job;
mod outcome;
mod status;
mod tracker;

pub mod config;
pub mod permit;
pub mod processor;
pub mod queue;
pub mod service;
pub mod transport;
pub mod worker;

pub use config::{ConfigError, ProcessorSettings};
pub use health::{DEGRADED_QUEUE_THRESHOLD, HealthReport, HealthStatus};
pub use job::{CancellationToken, Job, JobId, JobPhase};
pub use outcome::{JobOutcome, JobResult, OutcomeKind};
pub use permit::{
    Acquisition, AffinityManager, DenialReason, SlotError, SlotId, SlotInfo, SlotPermit,
};
pub use processor::{ExecutionContext, ExecutionError, JobProcessor, SimulatedProcessor};
pub use queue::{JobQueue, QueueError};
pub use service::{BulkOutcome, ProcessingService, ServiceError};
pub use status::QueueStatus;
pub use tracker::{JobSnapshot, JobTracker};
pub use worker::{QueuedJob, ShutdownReport, WorkerId, WorkerPool};
