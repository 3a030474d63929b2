//! Job bodies: what actually runs while a slot is held.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::job::Job;
use crate::permit::SlotId;
use crate::worker::WorkerId;

/// Default length of one simulated iteration.
pub const DEFAULT_TICK: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// Where and under which token a job body is running.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub slot_id: SlotId,
    pub worker_id: WorkerId,
    pub cancel: CancellationToken,
}

/// Body executed by a worker while it holds a slot.
///
/// Implementations should check `ctx.cancel` at their own checkpoints and
/// return [`ExecutionError::Cancelled`] when it fires. Panics are caught by
/// the worker and reported as an error result.
#[async_trait::async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn process(&self, job: &Job, ctx: &ExecutionContext) -> Result<String, ExecutionError>;
}

/// Simulated CPU-bound work: `iterations` ticks, interruptible between ticks.
#[derive(Debug, Clone)]
pub struct SimulatedProcessor {
    tick: Duration,
}

impl SimulatedProcessor {
    pub fn new(tick: Duration) -> Self {
        Self { tick }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }
}

impl Default for SimulatedProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

#[async_trait::async_trait]
impl JobProcessor for SimulatedProcessor {
    async fn process(&self, job: &Job, ctx: &ExecutionContext) -> Result<String, ExecutionError> {
        let iterations = job.iterations();

        for i in 0..iterations {
            if ctx.cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(ExecutionError::Cancelled),
                _ = tokio::time::sleep(self.tick) => {}
            }

            if i == 0 || (i + 1) % 5 == 0 {
                tracing::debug!(
                    job_id = %job.id(),
                    slot = %ctx.slot_id,
                    iteration = i + 1,
                    iterations,
                    "Job progress"
                );
            }
        }

        Ok(format!(
            "Processed '{}' through {} iterations on slot {}",
            job.data(),
            iterations,
            ctx.slot_id
        ))
    }
}
